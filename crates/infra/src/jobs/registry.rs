use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use jobforge_core::{DomainResult, ToolSlug};
use jobforge_tools::{ProcessorFactory, Processor};

/// Tool slug -> processor, built once before pollers start.
///
/// Registration is idempotent: the first processor registered for a slug
/// wins and later registrations are ignored.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<ToolSlug, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a static `(slug, factory)` list.
    pub fn from_entries(entries: &[(&str, ProcessorFactory)]) -> DomainResult<Self> {
        let mut registry = Self::new();
        for (slug, factory) in entries {
            registry.register(ToolSlug::new(*slug)?, factory());
        }
        Ok(registry)
    }

    /// Register `processor` for `slug`. Returns `false` (and keeps the
    /// existing processor) when the slug is already registered.
    pub fn register(&mut self, slug: ToolSlug, processor: Arc<dyn Processor>) -> bool {
        if self.processors.contains_key(&slug) {
            debug!(tool_slug = %slug, "Processor already registered; ignoring");
            return false;
        }
        self.processors.insert(slug, processor);
        true
    }

    pub fn get(&self, slug: &ToolSlug) -> Option<Arc<dyn Processor>> {
        self.processors.get(slug).cloned()
    }

    pub fn contains(&self, slug: &ToolSlug) -> bool {
        self.processors.contains_key(slug)
    }

    /// Registered slugs, sorted.
    pub fn slugs(&self) -> Vec<ToolSlug> {
        let mut slugs: Vec<_> = self.processors.keys().cloned().collect();
        slugs.sort();
        slugs
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("slugs", &self.slugs())
            .finish()
    }
}
