use std::sync::Arc;

use dashmap::DashMap;
use lazy_static::lazy_static;
use tracing::{debug, info};

use crate::config::ProcessorOptions;
use crate::error::{SoulError, SoulResult};

use super::anthropic::AnthropicProcessor;
use super::openai::OpenAiProcessor;
use super::traits::Processor;

pub const OPENAI_LABEL: &str = "openai";
pub const ANTHROPIC_LABEL: &str = "anthropic";

/// Builds a processor instance from per-label options.
pub type ProcessorFactory =
    Arc<dyn Fn(&ProcessorOptions) -> SoulResult<Arc<dyn Processor>> + Send + Sync>;

/// Label to factory lookup. Registering an existing label replaces it.
pub struct ProcessorRegistry {
    factories: DashMap<String, ProcessorFactory>,
}

impl ProcessorRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// A registry holding the `openai` and `anthropic` processors.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(
            OPENAI_LABEL,
            Arc::new(|options: &ProcessorOptions| -> SoulResult<Arc<dyn Processor>> {
                Ok(Arc::new(OpenAiProcessor::openai(options.clone())) as Arc<dyn Processor>)
            }),
        );
        registry.register(
            ANTHROPIC_LABEL,
            Arc::new(|options: &ProcessorOptions| -> SoulResult<Arc<dyn Processor>> {
                Ok(Arc::new(AnthropicProcessor::anthropic(options.clone())) as Arc<dyn Processor>)
            }),
        );
        registry
    }

    pub fn register(&self, label: impl Into<String>, factory: ProcessorFactory) {
        let label = label.into();
        if self.factories.insert(label.clone(), factory).is_some() {
            info!(label = %label, "replaced processor factory");
        } else {
            debug!(label = %label, "registered processor factory");
        }
    }

    pub fn create(
        &self,
        label: &str,
        options: &ProcessorOptions,
    ) -> SoulResult<Arc<dyn Processor>> {
        // Clone out of the map so a factory may touch the registry itself.
        let factory = self
            .factories
            .get(label)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SoulError::UnknownProcessor {
                label: label.to_string(),
            })?;
        factory(options)
    }

    pub fn has(&self, label: &str) -> bool {
        self.factories.contains_key(label)
    }

    /// Registered labels, sorted
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        labels.sort();
        labels
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

lazy_static! {
    static ref GLOBAL_REGISTRY: ProcessorRegistry = ProcessorRegistry::with_builtins();
}

/// The process-wide registry consulted by working memories.
pub fn global_registry() -> &'static ProcessorRegistry {
    &GLOBAL_REGISTRY
}

pub fn register_processor(label: impl Into<String>, factory: ProcessorFactory) {
    GLOBAL_REGISTRY.register(label, factory);
}

pub fn create_processor(label: &str, options: &ProcessorOptions) -> SoulResult<Arc<dyn Processor>> {
    GLOBAL_REGISTRY.create(label, options)
}

pub fn registered_processors() -> Vec<String> {
    GLOBAL_REGISTRY.labels()
}
