//! Typed - in-process executor 向けの型付き Operator API
//!
//! operator selector の typo を文字列ではなく型で排除します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Operator` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, registry が保持

pub mod handler;
pub mod operator;
pub mod registry;

pub use self::handler::{DynHandler, Handler, TypedHandler};
pub use self::operator::{Operator, OperatorError, Produced};
pub use self::registry::{RegistryError, TypedRegistry};
