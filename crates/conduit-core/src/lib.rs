//! conduit-core
//!
//! Conduit タスクディスパッチャのコア: fencing 付き lease、トランザクショナル outbox、
//! retry、job 間の event routing、dataset version、原子的な pointer cutover。
//!
//! # モジュール構成
//! - **domain**: データモデルと純粋な状態遷移（ids, job, task, stream, version, pointer）
//! - **ports**: 外部との境界（StateStore, DeliveryQueue, Clock, IdGenerator, BackoffStrategy）
//! - **app**: dispatcher の各コンポーネントとそのワイヤリング
//! - **typed**: in-process executor 向けの型付き Operator API
//! - **impls**: 開発・テスト用のインメモリ store と queue

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use self::app::{Dispatcher, DispatcherBuilder, DispatcherConfig, DispatcherHandle};
pub use self::error::ConduitError;
