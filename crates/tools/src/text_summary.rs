use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobforge_core::{TextSummaryInput, ToolInput};

use crate::processor::{ProcessContext, Processor, ProcessorError};

/// Output of the `text-summary` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub sentences: Vec<String>,
    pub word_count: usize,
    pub sentence_count: usize,
}

/// Extractive summarizer: keeps the sentences with the highest average word
/// frequency, in their original order.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextSummaryProcessor;

impl TextSummaryProcessor {
    pub fn summarize(&self, input: &TextSummaryInput) -> Summary {
        let sentences: Vec<&str> = input
            .text
            .split_inclusive(['.', '!', '?'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        let mut freq: HashMap<String, usize> = HashMap::new();
        let mut word_count = 0;
        for word in input.text.split_whitespace().filter_map(normalize) {
            word_count += 1;
            *freq.entry(word).or_default() += 1;
        }

        let mut scored: Vec<(usize, f64)> = sentences
            .iter()
            .enumerate()
            .map(|(idx, sentence)| {
                let words: Vec<String> = sentence
                    .split_whitespace()
                    .filter_map(normalize)
                    .collect();
                let score = if words.is_empty() {
                    0.0
                } else {
                    words.iter().map(|w| freq.get(w).copied().unwrap_or(0)).sum::<usize>() as f64
                        / words.len() as f64
                };
                (idx, score)
            })
            .collect();

        // Highest score first; earlier sentence wins ties.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut keep: Vec<usize> = scored
            .into_iter()
            .take(input.max_sentences)
            .map(|(idx, _)| idx)
            .collect();
        keep.sort_unstable();

        Summary {
            sentences: keep.into_iter().map(|idx| sentences[idx].to_string()).collect(),
            word_count,
            sentence_count: sentences.len(),
        }
    }
}

#[async_trait]
impl Processor for TextSummaryProcessor {
    async fn process(&self, ctx: ProcessContext) -> Result<JsonValue, ProcessorError> {
        let ToolInput::TextSummary(input) = &ctx.job.input else {
            return Err(ProcessorError::InvalidInput("expected text-summary input".to_string()));
        };
        ctx.check_cancelled()?;

        serde_json::to_value(self.summarize(input))
            .map_err(|e| ProcessorError::failed(e.to_string()))
    }
}

fn normalize(word: &str) -> Option<String> {
    let w: String = word
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    (!w.is_empty()).then_some(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_central_sentences_in_order() {
        let input = TextSummaryInput {
            text: "Rust jobs retry. Cats sleep. Rust jobs time out and rust jobs retry again."
                .to_string(),
            max_sentences: 2,
        };

        let summary = TextSummaryProcessor.summarize(&input);

        assert_eq!(summary.sentence_count, 3);
        assert_eq!(summary.word_count, 14);
        assert_eq!(
            summary.sentences,
            vec!["Rust jobs retry.", "Rust jobs time out and rust jobs retry again."]
        );
    }

    #[test]
    fn short_text_returns_everything() {
        let input = TextSummaryInput {
            text: "Only one sentence".to_string(),
            max_sentences: 3,
        };

        let summary = TextSummaryProcessor.summarize(&input);
        assert_eq!(summary.sentences, vec!["Only one sentence"]);
    }
}
