//! Tool slugs and per-tool input schemas.
//!
//! Every job names the tool that handles it through a [`ToolSlug`]. Inputs for
//! tools with a known schema are parsed into a typed [`ToolInput`] variant when
//! the record crosses the store boundary (submission and load), so processors
//! never see unvalidated JSON for those tools. Slugs without a schema carry
//! their payload as [`ToolInput::Opaque`].

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

pub const CONTRACT_ANALYSIS: &str = "contract-analysis";
pub const TEXT_SUMMARY: &str = "text-summary";
pub const TRANSCRIPTION: &str = "transcription";

/// Stable string key identifying which processor handles a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolSlug(String);

impl ToolSlug {
    pub fn new(slug: impl Into<String>) -> DomainResult<Self> {
        let slug = slug.into();
        let valid = !slug.is_empty()
            && slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(DomainError::InvalidSlug(slug));
        }
        Ok(Self(slug))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ToolSlug {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ToolSlug {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ToolSlug {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ToolSlug> for String {
    fn from(value: ToolSlug) -> Self {
        value.0
    }
}

/// Input for the `contract-analysis` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractAnalysisInput {
    pub document_text: String,
    #[serde(default)]
    pub jurisdiction: Option<String>,
}

/// Input for the `text-summary` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextSummaryInput {
    pub text: String,
    #[serde(default = "default_max_sentences")]
    pub max_sentences: usize,
}

fn default_max_sentences() -> usize {
    3
}

/// Input for the `transcription` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptionInput {
    pub audio_url: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Job input, keyed by tool slug.
///
/// Serializes to the bare per-tool object; the slug lives next to it on the
/// job record, so the pair is re-validated with [`ToolInput::from_parts`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolInput {
    ContractAnalysis(ContractAnalysisInput),
    TextSummary(TextSummaryInput),
    Transcription(TranscriptionInput),
    /// Payload for a slug without a registered schema.
    Opaque(JsonValue),
}

impl ToolInput {
    /// Parse and validate `value` against the schema registered for `slug`.
    pub fn from_parts(slug: &ToolSlug, value: JsonValue) -> DomainResult<Self> {
        let input = match slug.as_str() {
            CONTRACT_ANALYSIS => Self::ContractAnalysis(parse(slug, value)?),
            TEXT_SUMMARY => Self::TextSummary(parse(slug, value)?),
            TRANSCRIPTION => Self::Transcription(parse(slug, value)?),
            _ => Self::Opaque(value),
        };
        input.validate()?;
        Ok(input)
    }

    /// Slug whose schema this input follows (`None` for opaque payloads).
    pub fn schema_slug(&self) -> Option<&'static str> {
        match self {
            Self::ContractAnalysis(_) => Some(CONTRACT_ANALYSIS),
            Self::TextSummary(_) => Some(TEXT_SUMMARY),
            Self::Transcription(_) => Some(TRANSCRIPTION),
            Self::Opaque(_) => None,
        }
    }

    /// Whether this input may be stored under `slug`.
    pub fn matches(&self, slug: &ToolSlug) -> bool {
        match self.schema_slug() {
            Some(expected) => expected == slug.as_str(),
            None => !is_schema_slug(slug.as_str()),
        }
    }

    pub fn to_value(&self) -> JsonValue {
        // Plain structs and JSON values always serialize.
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    fn validate(&self) -> DomainResult<()> {
        match self {
            Self::ContractAnalysis(input) => {
                if input.document_text.trim().is_empty() {
                    return Err(DomainError::validation(
                        "contract-analysis: document_text must not be empty",
                    ));
                }
            }
            Self::TextSummary(input) => {
                if input.text.trim().is_empty() {
                    return Err(DomainError::validation("text-summary: text must not be empty"));
                }
                if !(1..=50).contains(&input.max_sentences) {
                    return Err(DomainError::validation(format!(
                        "text-summary: max_sentences must be within 1..=50, got {}",
                        input.max_sentences
                    )));
                }
            }
            Self::Transcription(input) => {
                if !(input.audio_url.starts_with("https://")
                    || input.audio_url.starts_with("http://"))
                {
                    return Err(DomainError::validation(
                        "transcription: audio_url must be an http(s) URL",
                    ));
                }
            }
            Self::Opaque(_) => {}
        }
        Ok(())
    }
}

fn is_schema_slug(slug: &str) -> bool {
    matches!(slug, CONTRACT_ANALYSIS | TEXT_SUMMARY | TRANSCRIPTION)
}

fn parse<T: serde::de::DeserializeOwned>(slug: &ToolSlug, value: JsonValue) -> DomainResult<T> {
    serde_json::from_value(value).map_err(|e| DomainError::validation(format!("{slug}: {e}")))
}
