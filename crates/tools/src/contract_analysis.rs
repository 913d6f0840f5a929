use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobforge_core::{ContractAnalysisInput, ToolInput};

use crate::processor::{ProcessContext, Processor, ProcessorError};

/// Clause flagged by the keyword scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedClause {
    pub clause_index: usize,
    pub category: String,
    pub excerpt: String,
}

/// Output of the `contract-analysis` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractReport {
    pub clause_count: usize,
    pub flagged: Vec<FlaggedClause>,
    /// Share of clauses flagged, in \[0, 1\].
    pub risk_score: f64,
    pub jurisdiction: Option<String>,
}

/// (category, lowercase stems that put a clause in it)
const RISK_CATEGORIES: &[(&str, &[&str])] = &[
    ("indemnity", &["indemnif", "hold harmless"]),
    ("liability", &["liabilit", "consequential damages"]),
    ("termination", &["terminat"]),
    ("auto_renewal", &["automatically renew", "auto-renew"]),
    ("penalty", &["penalt", "liquidated damages"]),
    ("exclusivity", &["exclusiv", "non-compete"]),
];

const EXCERPT_CHARS: usize = 120;

/// Deterministic clause scanner.
///
/// Model:
/// - Split the document into clauses on sentence terminators and semicolons.
/// - Put each clause into the first risk category whose stem it contains.
/// - Score as flagged / total.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContractAnalysisProcessor;

impl ContractAnalysisProcessor {
    pub fn analyze(
        &self,
        input: &ContractAnalysisInput,
        ctx: &ProcessContext,
    ) -> Result<ContractReport, ProcessorError> {
        let clauses = split_clauses(&input.document_text);
        let mut flagged = Vec::new();

        for (idx, clause) in clauses.iter().enumerate() {
            ctx.check_cancelled()?;
            let lower = clause.to_lowercase();
            let category = RISK_CATEGORIES
                .iter()
                .find(|(_, stems)| stems.iter().any(|stem| lower.contains(stem)))
                .map(|(category, _)| *category);

            if let Some(category) = category {
                flagged.push(FlaggedClause {
                    clause_index: idx,
                    category: category.to_string(),
                    excerpt: clause.chars().take(EXCERPT_CHARS).collect(),
                });
            }
        }

        let risk_score = if clauses.is_empty() {
            0.0
        } else {
            flagged.len() as f64 / clauses.len() as f64
        };

        Ok(ContractReport {
            clause_count: clauses.len(),
            flagged,
            risk_score,
            jurisdiction: input.jurisdiction.clone(),
        })
    }
}

#[async_trait]
impl Processor for ContractAnalysisProcessor {
    async fn process(&self, ctx: ProcessContext) -> Result<JsonValue, ProcessorError> {
        let ToolInput::ContractAnalysis(input) = &ctx.job.input else {
            return Err(ProcessorError::InvalidInput(
                "expected contract-analysis input".to_string(),
            ));
        };

        let report = self.analyze(input, &ctx)?;
        serde_json::to_value(report).map_err(|e| ProcessorError::failed(e.to_string()))
    }
}

fn split_clauses(text: &str) -> Vec<&str> {
    text.split(['.', ';', '!', '?', '\n'])
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::{Job, ToolSlug};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn ctx_for(text: &str) -> ProcessContext {
        let slug = ToolSlug::new("contract-analysis").unwrap();
        let input = ToolInput::from_parts(
            &slug,
            json!({"document_text": text, "jurisdiction": "DE"}),
        )
        .unwrap();
        ProcessContext::new(Job::new(slug, input), CancellationToken::new())
    }

    #[tokio::test]
    async fn flags_risky_clauses() {
        let ctx = ctx_for(
            "The supplier shall indemnify the buyer. Payment is due in 30 days. \
             This agreement will automatically renew each year; \
             either party may terminate with notice.",
        );

        let out = ContractAnalysisProcessor.process(ctx).await.unwrap();
        let report: ContractReport = serde_json::from_value(out).unwrap();

        assert_eq!(report.clause_count, 4);
        let categories: Vec<_> = report.flagged.iter().map(|f| f.category.as_str()).collect();
        assert_eq!(categories, vec!["indemnity", "auto_renewal", "termination"]);
        assert!((report.risk_score - 0.75).abs() < f64::EPSILON);
        assert_eq!(report.jurisdiction.as_deref(), Some("DE"));
    }

    #[tokio::test]
    async fn rejects_foreign_input() {
        let slug = ToolSlug::new("contract-analysis").unwrap();
        let job = Job::new(slug, ToolInput::Opaque(json!({})));
        let err = ContractAnalysisProcessor
            .process(ProcessContext::new(job, CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let ctx = ctx_for("Clause one. Clause two.");
        ctx.cancel.cancel();
        let err = ContractAnalysisProcessor.process(ctx).await.unwrap_err();
        assert_eq!(err, ProcessorError::Cancelled);
    }
}
