//! Built-in processor catalog.

use std::sync::Arc;

use jobforge_core::payload::{CONTRACT_ANALYSIS, TEXT_SUMMARY};

use crate::contract_analysis::ContractAnalysisProcessor;
use crate::processor::Processor;
use crate::text_summary::TextSummaryProcessor;

/// Builds a fresh processor instance.
pub type ProcessorFactory = fn() -> Arc<dyn Processor>;

/// `(slug, factory)` pairs for the processors shipped with this crate.
///
/// `transcription` has an input schema but no built-in processor: it needs an
/// external speech service, so deployments register their own.
pub fn builtin_catalog() -> &'static [(&'static str, ProcessorFactory)] {
    BUILTIN_CATALOG
}

static BUILTIN_CATALOG: &[(&str, ProcessorFactory)] = &[
    (CONTRACT_ANALYSIS, contract_analysis),
    (TEXT_SUMMARY, text_summary),
];

fn contract_analysis() -> Arc<dyn Processor> {
    Arc::new(ContractAnalysisProcessor)
}

fn text_summary() -> Arc<dyn Processor> {
    Arc::new(TextSummaryProcessor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::ToolSlug;

    #[test]
    fn catalog_slugs_are_valid_and_unique() {
        let catalog = builtin_catalog();
        let mut slugs: Vec<_> = catalog.iter().map(|(slug, _)| *slug).collect();
        for slug in &slugs {
            assert!(ToolSlug::new(*slug).is_ok());
        }
        slugs.sort_unstable();
        slugs.dedup();
        assert_eq!(slugs.len(), catalog.len());
    }
}
