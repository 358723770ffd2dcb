//! TypedRegistry - operator selector → handler の対応表

use super::handler::{DynHandler, Handler, TypedHandler};
use super::operator::Operator;
use std::collections::HashMap;
use std::sync::Arc;

/// TypedRegistry stores type-erased handlers keyed by `Operator::NAME`.
///
/// ```ignore
/// let mut registry = TypedRegistry::new();
/// registry.register::<Compact, _>(CompactHandler)?;
/// let handler = registry.get("etl.compact.v1");
/// ```
#[derive(Default, Clone)]
pub struct TypedRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for operator '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Operator, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        let name = T::NAME.to_string();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers
            .insert(name, Arc::new(TypedHandler::<T, H>::new(handler)));
        Ok(())
    }

    pub fn get(&self, operator: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(operator).cloned()
    }

    pub fn registered_operators(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::tests::{Echo, EchoHandler};
    use crate::typed::operator::{OperatorError, Produced};
    use crate::domain::TaskPayload;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Noop {}

    impl Operator for Noop {
        const NAME: &'static str = "test.noop.v1";
    }

    struct NoopHandler;

    #[async_trait]
    impl Handler<Noop> for NoopHandler {
        async fn handle(&self, _config: Noop, _payload: &TaskPayload) -> Result<Produced, OperatorError> {
            Ok(Produced::nothing())
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = TypedRegistry::new();
        registry.register::<Echo, _>(EchoHandler).unwrap();

        let retrieved = registry.get(Echo::NAME);
        assert!(retrieved.is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_double_registration() {
        let mut registry = TypedRegistry::new();
        registry.register::<Echo, _>(EchoHandler).unwrap();
        let result = registry.register::<Echo, _>(EchoHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn test_registered_operators_are_sorted() {
        let mut registry = TypedRegistry::new();
        registry.register::<Noop, _>(NoopHandler).unwrap();
        registry.register::<Echo, _>(EchoHandler).unwrap();
        assert_eq!(
            registry.registered_operators(),
            vec![Echo::NAME.to_string(), Noop::NAME.to_string()]
        );
    }
}
