use crate::types::{Extractor, PipelineError, Result};
use interfaces::BaselineExtractor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Form type to extractor lookup.
///
/// Built once at startup and shared read-only between coordinator workers.
/// Form-type tags match exactly, so "10-K" and "10-K/A" are different keys.
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Register an extractor under `form_type`, replacing any previous one.
    /// One extractor may be registered under several tags.
    pub fn register(&mut self, form_type: impl Into<String>, extractor: Arc<dyn Extractor>) -> Option<Arc<dyn Extractor>> {
        let form_type = form_type.into();
        let previous = self.extractors.insert(form_type.clone(), extractor);
        if previous.is_some() {
            warn!("Replaced extractor for form type {}", form_type);
        } else {
            info!("Registered extractor for form type {}", form_type);
        }
        previous
    }

    pub fn resolve(&self, form_type: &str) -> Result<Arc<dyn Extractor>> {
        match self.extractors.get(form_type) {
            Some(extractor) => Ok(extractor.clone()),
            None => {
                debug!("No extractor for form type {}", form_type);
                Err(PipelineError::UnsupportedFormType {
                    form_type: form_type.to_string(),
                })
            }
        }
    }

    pub fn contains(&self, form_type: &str) -> bool {
        self.extractors.contains_key(form_type)
    }

    pub fn remove(&mut self, form_type: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors.remove(form_type)
    }

    /// Registered form types, sorted
    pub fn list(&self) -> Vec<String> {
        let mut form_types: Vec<String> = self.extractors.keys().cloned().collect();
        form_types.sort();
        form_types
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a registry of metadata extractors
pub struct ExtractorRegistryBuilder {
    registry: ExtractorRegistry,
}

impl ExtractorRegistryBuilder {
    pub fn new() -> Self {
        Self {
            registry: ExtractorRegistry::new(),
        }
    }

    pub fn add_baseline<S: AsRef<str>>(mut self, form_types: &[S]) -> Self {
        for form_type in form_types {
            let form_type = form_type.as_ref();
            self.registry
                .register(form_type, Arc::new(BaselineExtractor::new(form_type)));
        }
        self
    }

    /// Register `extractor` under each of `form_types`
    pub fn add_extractor<S: AsRef<str>>(mut self, form_types: &[S], extractor: Arc<dyn Extractor>) -> Self {
        for form_type in form_types {
            self.registry.register(form_type.as_ref(), extractor.clone());
        }
        self
    }

    pub fn build(self) -> ExtractorRegistry {
        self.registry
    }
}

impl Default for ExtractorRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
