//! Name-indexed, priority-ordered strategy set.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::{Strategy, StrategyDescriptor};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("strategy '{0}' is already registered")]
    DuplicateName(String),
}

/// Immutable after [`StrategyRegistryBuilder::build`]; safe to share.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    ordered: Vec<Arc<dyn Strategy>>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}

impl StrategyRegistry {
    pub fn builder() -> StrategyRegistryBuilder {
        StrategyRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.by_name
            .get(name)
            .map(|&index| Arc::clone(&self.ordered[index]))
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.ordered
            .iter()
            .map(|strategy| strategy.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Ascending priority; equal priorities keep registration order.
    pub fn all_by_priority(&self) -> Vec<Arc<dyn Strategy>> {
        self.ordered.clone()
    }

    pub fn describe(&self) -> Vec<StrategyDescriptor> {
        self.ordered
            .iter()
            .map(|strategy| strategy.descriptor().clone())
            .collect()
    }
}

#[derive(Default)]
pub struct StrategyRegistryBuilder {
    pending: Vec<Arc<dyn Strategy>>,
}

impl StrategyRegistryBuilder {
    pub fn register<S: Strategy + 'static>(self, strategy: S) -> Self {
        self.register_arc(Arc::new(strategy))
    }

    pub fn register_arc(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.pending.push(strategy);
        self
    }

    pub fn build(self) -> Result<StrategyRegistry, RegistryError> {
        let mut ordered = self.pending;
        // stable: ties keep registration order
        ordered.sort_by_key(|strategy| strategy.descriptor().priority);

        let mut by_name = HashMap::with_capacity(ordered.len());
        for (index, strategy) in ordered.iter().enumerate() {
            let name = strategy.name().to_string();
            if by_name.insert(name.clone(), index).is_some() {
                return Err(RegistryError::DuplicateName(name));
            }
        }

        Ok(StrategyRegistry { ordered, by_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::ResolutionResult;
    use async_trait::async_trait;
    use std::time::Duration;
    use url::Url;

    struct Named(StrategyDescriptor);

    impl Named {
        fn new(name: &str, priority: u32) -> Self {
            Self(StrategyDescriptor::new(name, priority, Duration::from_secs(1)))
        }
    }

    #[async_trait]
    impl Strategy for Named {
        fn descriptor(&self) -> &StrategyDescriptor {
            &self.0
        }

        async fn execute(&self, _url: &Url) -> ResolutionResult {
            ResolutionResult::failure(self.name(), "noop")
        }
    }

    #[test]
    fn orders_by_priority_and_keeps_ties_stable() {
        let registry = StrategyRegistry::builder()
            .register(Named::new("late", 10))
            .register(Named::new("tie_a", 2))
            .register(Named::new("first", 1))
            .register(Named::new("tie_b", 2))
            .build()
            .unwrap();

        assert_eq!(registry.names(), ["first", "tie_a", "tie_b", "late"]);
        assert_eq!(registry.len(), 4);
        assert!(registry.get("tie_b").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.describe()[3].priority, 10);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = StrategyRegistry::builder()
            .register(Named::new("same", 1))
            .register(Named::new("same", 2))
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName("same".into()));
    }

    #[test]
    fn empty_registry_is_valid() {
        let registry = StrategyRegistry::builder().build().unwrap();
        assert!(registry.is_empty());
        assert!(registry.all_by_priority().is_empty());
    }
}
