//! Provider registry -- the configured providers, keyed by id.
//!
//! Lookups hand out `Arc<dyn Provider>` so a job worker can own its
//! provider for the lifetime of the invocation.

use std::collections::HashMap;
use std::sync::Arc;

use super::command::CommandProvider;
use super::trait_def::Provider;
use crate::config::HarnessConfig;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`CommandProvider`] per configured provider.
    pub fn from_config(config: &HarnessConfig) -> Self {
        let mut registry = Self::new();
        for provider in &config.providers {
            registry.register(CommandProvider::from_config(provider));
        }
        registry
    }

    /// Register a provider under [`Provider::id`], returning any provider
    /// it replaced.
    pub fn register(&mut self, provider: impl Provider + 'static) -> Option<Arc<dyn Provider>> {
        self.register_arc(Arc::new(provider))
    }

    pub fn register_arc(&mut self, provider: Arc<dyn Provider>) -> Option<Arc<dyn Provider>> {
        let id = provider.id().to_string();
        self.providers.insert(id, provider)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.list())
            .finish()
    }
}
