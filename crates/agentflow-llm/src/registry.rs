//! Reference-counted directory of chat backends.
//!
//! A [`ModelRegistry`] maps a caller-chosen name to a backend instance (or a
//! factory that builds one on first use), together with an optional tokenizer,
//! an optional max-token budget and a visibility flag. Independent call sites
//! may register the same name; the entry lives until every registration has
//! been matched by an [`ModelRegistry::unregister`].
//!
//! All state sits behind one re-entrant lock, so a factory may itself consult
//! the registry (e.g. to wrap another registered model) while being
//! materialized.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use thiserror::Error;

use crate::tokenizer::Tokenizer;
use crate::traits::ChatClient;

pub type ModelFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn ChatClient>> + Send + Sync>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model not registered: {0}")]
    NotFound(String),

    #[error("No models registered")]
    Empty,

    #[error("Factory for model '{name}' failed")]
    Factory {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Backend behind a registry name
#[derive(Clone)]
pub enum ModelSource {
    Instance(Arc<dyn ChatClient>),
    Factory(ModelFactory),
}

impl ModelSource {
    pub fn instance(client: impl ChatClient + 'static) -> Self {
        Self::Instance(Arc::new(client))
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn ChatClient>> + Send + Sync + 'static,
    {
        Self::Factory(Arc::new(factory))
    }
}

impl From<Arc<dyn ChatClient>> for ModelSource {
    fn from(client: Arc<dyn ChatClient>) -> Self {
        Self::Instance(client)
    }
}

/// Optional attributes recorded with the first registration of a name
#[derive(Clone, Default)]
pub struct RegisterOptions {
    pub tokenizer: Option<Arc<dyn Tokenizer>>,
    pub max_tokens: Option<usize>,
    pub hidden: bool,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }
}

struct RegistryEntry {
    source: ModelSource,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    max_tokens: Option<usize>,
    hidden: bool,
    ref_count: usize,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, RegistryEntry>,
    catalog: Vec<String>,
}

impl RegistryState {
    fn resolve<'a>(&'a self, name: Option<&'a str>) -> Result<&'a str, RegistryError> {
        match name {
            Some(name) if self.entries.contains_key(name) => Ok(name),
            Some(name) => Err(RegistryError::NotFound(name.to_string())),
            None => self
                .catalog
                .first()
                .map(String::as_str)
                .ok_or(RegistryError::Empty),
        }
    }

    fn entry(&self, name: Option<&str>) -> Result<&RegistryEntry, RegistryError> {
        let name = self.resolve(name)?;
        self.entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}

#[derive(Default)]
pub struct ModelRegistry {
    state: ReentrantMutex<RefCell<RegistryState>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, or take another reference on an existing registration.
    ///
    /// Only the first registration's source and options are kept. Returns the
    /// reference count after this call.
    pub fn register(&self, name: impl Into<String>, source: impl Into<ModelSource>, options: RegisterOptions) -> usize {
        let name = name.into();
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        if let Some(entry) = state.entries.get_mut(&name) {
            entry.ref_count += 1;
            tracing::debug!(model = %name, ref_count = entry.ref_count, "model registration shared");
            return entry.ref_count;
        }

        state.entries.insert(
            name.clone(),
            RegistryEntry {
                source: source.into(),
                tokenizer: options.tokenizer,
                max_tokens: options.max_tokens,
                hidden: options.hidden,
                ref_count: 1,
            },
        );
        state.catalog.push(name.clone());
        tracing::info!(model = %name, "model registered");
        1
    }

    /// Drop one reference on `name`; the entry goes away at zero.
    ///
    /// Unknown names are ignored. Returns the remaining count, if the name was known.
    pub fn unregister(&self, name: &str) -> Option<usize> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        let Some(entry) = state.entries.get_mut(name) else {
            tracing::warn!(model = %name, "unregister of unknown model ignored");
            return None;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        let remaining = entry.ref_count;

        if remaining == 0 {
            state.entries.remove(name);
            state.catalog.retain(|n| n != name);
            tracing::info!(model = %name, "model unregistered");
        }
        Some(remaining)
    }

    /// Resolve a backend; `None` selects the first registered name.
    ///
    /// Factory-backed entries are built on first access and cached. The
    /// factory runs with the registry lock held (re-entrantly), so concurrent
    /// callers never build the same model twice.
    pub fn get_model(&self, name: Option<&str>) -> Result<Arc<dyn ChatClient>, RegistryError> {
        let guard = self.state.lock();

        let (name, factory) = {
            let state = guard.borrow();
            let name = state.resolve(name)?.to_string();
            match &state.entry(Some(&name))?.source {
                ModelSource::Instance(model) => return Ok(Arc::clone(model)),
                ModelSource::Factory(factory) => (name, Arc::clone(factory)),
            }
        };

        tracing::debug!(model = %name, "materializing model from factory");
        let model = factory().map_err(|e| RegistryError::Factory {
            name: name.clone(),
            source: e.into(),
        })?;

        let mut state = guard.borrow_mut();
        match state.entries.get_mut(&name) {
            Some(entry) => match &entry.source {
                // built by a re-entrant call while the factory ran
                ModelSource::Instance(existing) => Ok(Arc::clone(existing)),
                ModelSource::Factory(_) => {
                    entry.source = ModelSource::Instance(Arc::clone(&model));
                    Ok(model)
                }
            },
            None => Ok(model),
        }
    }

    pub fn get_tokenizer(&self, name: Option<&str>) -> Result<Option<Arc<dyn Tokenizer>>, RegistryError> {
        let guard = self.state.lock();
        let state = guard.borrow();
        Ok(state.entry(name)?.tokenizer.clone())
    }

    pub fn get_max_tokens(&self, name: Option<&str>) -> Result<Option<usize>, RegistryError> {
        let guard = self.state.lock();
        let state = guard.borrow();
        Ok(state.entry(name)?.max_tokens)
    }

    /// Registration order, hidden entries excluded
    pub fn get_registered_names(&self) -> Vec<String> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .catalog
            .iter()
            .filter(|name| state.entries.get(*name).is_some_and(|e| !e.hidden))
            .cloned()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        let guard = self.state.lock();
        let contains = guard.borrow().entries.contains_key(name);
        contains
    }

    pub fn ref_count(&self, name: &str) -> usize {
        let guard = self.state.lock();
        let count = guard.borrow().entries.get(name).map_or(0, |e| e.ref_count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_name_is_first_catalog_entry() {
        let registry = ModelRegistry::new();
        registry.register("first", ModelSource::instance(StubClient::new("1")), RegisterOptions::new());
        registry.register("second", ModelSource::instance(StubClient::new("2")), RegisterOptions::new());

        let default = registry.get_model(None).unwrap();
        let first = registry.get_model(Some("first")).unwrap();
        assert!(Arc::ptr_eq(&default, &first));
    }

    #[test]
    fn test_empty_registry_reports_empty() {
        let registry = ModelRegistry::new();
        assert!(matches!(registry.get_model(None), Err(RegistryError::Empty)));
        assert!(matches!(registry.get_max_tokens(None), Err(RegistryError::Empty)));
    }

    #[test]
    fn test_factory_materializes_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let registry = ModelRegistry::new();
        registry.register(
            "lazy",
            ModelSource::factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(StubClient::new("lazy")) as Arc<dyn ChatClient>)
            }),
            RegisterOptions::new(),
        );

        let a = registry.get_model(Some("lazy")).unwrap();
        let b = registry.get_model(Some("lazy")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_factory_stays_lazy() {
        let registry = ModelRegistry::new();
        registry.register(
            "broken",
            ModelSource::factory(|| anyhow::bail!("no credentials")),
            RegisterOptions::new(),
        );
        let err = registry.get_model(Some("broken")).err().unwrap();
        assert!(matches!(err, RegistryError::Factory { ref name, .. } if name == "broken"));
        assert!(registry.contains("broken"));
    }

    #[test]
    fn test_hidden_entries_are_not_listed() {
        let registry = ModelRegistry::new();
        registry.register("visible", ModelSource::instance(StubClient::new("v")), RegisterOptions::new());
        registry.register(
            "internal",
            ModelSource::instance(StubClient::new("i")),
            RegisterOptions::new().hidden(true).max_tokens(128),
        );
        assert_eq!(registry.get_registered_names(), vec!["visible".to_string()]);
        assert_eq!(registry.get_max_tokens(Some("internal")).unwrap(), Some(128));
    }
}
