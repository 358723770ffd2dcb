//! Ports - dispatcher と外部世界の境界
//!
//! 各 trait は外部システムを 1 つずつ隠します:
//! - トランザクショナルな state store（唯一の真実）
//! - wake-up 配送 queue（ヒントのみ、状態は持たない）
//! - 時刻、ID 生成、backoff ポリシー（テストで差し替え可能）

pub mod backoff;
pub mod clock;
pub mod delivery_queue;
pub mod dispatch;
pub mod id_generator;
pub mod state_store;

pub use self::backoff::{BackoffStrategy, ExponentialBackoff};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::{DeliveryQueue, QueueError};
pub use self::dispatch::WakeupSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::state_store::{CreatedTask, DeployOutcome, ScheduleOutcome, StateStore, StoreError};
