//! Impls - ports の in-process 実装
//!
//! - **InMemoryStateStore**: 単一 Mutex のトランザクショナル store
//! - **InMemoryDeliveryQueue**: wake-up queue
//! - **DispatchTable**: execution strategy → sink の対応表
//!
//! 永続バックエンドは同じ ports を別 crate で実装します。

pub mod dispatch;
pub mod inmem_delivery;
pub mod inmem_store;

// 主要な型を再エクスポート
pub use self::dispatch::{DispatchTable, QueueSink};
pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::inmem_store::InMemoryStateStore;
