//! Handler trait - claim 済み task に対して operator を実行する
//!
//! - `Handler<T>`: ジェネリック、operator の config 型ごとに 1 つ
//! - `DynHandler`: object-safe、registry に格納
//! - `TypedHandler<T, H>`: 前者から後者への type erasure
//!
//! config が `null` の job は `{}` として decode します（フィールドなしの operator 用）。

use super::operator::{Operator, OperatorError, Produced};
use crate::domain::TaskPayload;
use async_trait::async_trait;
use std::marker::PhantomData;

/// Handler executes one attempt of a task whose job selects operator `T`.
///
/// ```ignore
/// struct CompactHandler;
///
/// #[async_trait]
/// impl Handler<Compact> for CompactHandler {
///     async fn handle(&self, config: Compact, payload: &TaskPayload) -> Result<Produced, OperatorError> {
///         Ok(Produced::nothing())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Operator>: Send + Sync {
    async fn handle(&self, config: T, payload: &TaskPayload) -> Result<Produced, OperatorError>;
}

/// Object-safe handler. The job config arrives as JSON inside the payload.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: &TaskPayload) -> Result<Produced, OperatorError>;

    fn operator(&self) -> &str;
}

pub struct TypedHandler<T: Operator, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Operator, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Operator, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, payload: &TaskPayload) -> Result<Produced, OperatorError> {
        // jobs deployed without a config get `{}`, so field-less operators decode
        let raw = match &payload.config {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            config => config.clone(),
        };
        // a config that does not decode will not decode on retry either
        let config: T = serde_json::from_value(raw)
            .map_err(|e| OperatorError::permanent(format!("config decode for {}: {e}", T::NAME)))?;
        self.handler.handle(config, payload).await
    }

    fn operator(&self) -> &str {
        T::NAME
    }
}
