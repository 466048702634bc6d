//! Name-keyed registries for orchestration and activity handlers.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::{OrchestrationContext, Step};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable handler table shared by the dispatchers.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

/// Generic registry builder
pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
    kind: &'static str,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "durable_fanout::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        found
    }

    /// List all registered names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    fn with_kind(kind: &'static str) -> Self {
        Self {
            map: HashMap::new(),
            errors: Vec::new(),
            kind,
        }
    }

    /// Register an already-constructed handler.
    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<H>) -> Self {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {} registration: {name}", self.kind));
            return self;
        }
        self.map.insert(name, handler);
        self
    }

    /// Add every handler of `other`; names already present are reported as duplicates.
    pub fn merge(mut self, other: Registry<H>) -> Self {
        for (name, handler) in other.inner.iter() {
            self = self.register_handler(name.clone(), handler.clone());
        }
        self
    }

    /// Build the registry. Duplicate registrations keep the first handler.
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if there were any registration errors.
    ///
    /// # Errors
    ///
    /// Returns an error string containing all registration errors if any handlers failed to register.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        RegistryBuilder::with_kind("orchestration")
    }
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        RegistryBuilder::with_kind("activity")
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut OrchestrationContext, &str) -> Step<String> + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(FnOrchestration(f)))
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnActivity(f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_reported() {
        let result = ActivityRegistry::builder()
            .register("Echo", |_ctx, input| async move { Ok(input) })
            .register("Echo", |_ctx, _input| async move { Ok(String::new()) })
            .build_result();
        let err = result.err().unwrap();
        assert!(err.contains("duplicate activity registration: Echo"));
    }

    #[test]
    fn lookup_and_merge() {
        let base = OrchestrationRegistry::builder()
            .register("A", |_ctx, input| Ok(input.to_string()))
            .build();
        let merged = OrchestrationRegistry::builder()
            .register("B", |_ctx, _input| Ok(String::new()))
            .merge(base)
            .build_result()
            .unwrap();
        assert_eq!(merged.list_names(), vec!["A".to_string(), "B".to_string()]);
        assert!(merged.get("A").is_some());
        assert!(merged.get("missing").is_none());
        assert_eq!(merged.count(), 2);
    }
}
