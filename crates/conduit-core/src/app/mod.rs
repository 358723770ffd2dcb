//! App - ports を組み合わせて dispatcher の各コンポーネントを構成する
//!
//! # 主要コンポーネント
//! - **LeaseManager**: claim / heartbeat / complete（fencing 付き）
//! - **OutboxDrainer**: wake-up の配送と event の routing
//! - **RetryScheduler**: backoff 後に失敗 task を requeue
//! - **LeaseReaper**: lease 切れの attempt を失敗として回収
//! - **EventRouter**: output event → 依存 task
//! - **DatasetVersionRegistry**: 不変で内容アドレスな version
//! - **CutoverCoordinator**: pointer の原子的な切り替えと rollback
//! - **RangePlanner**: スケジュール stream の固定幅 range
//! - **Admin**: deploy, trigger, stream 操作, status
//! - **WorkerLoop**: in-process executor
//! - **DispatcherBuilder**: ワイヤリングと起動時検証

pub mod admin;
pub mod builder;
pub mod config;
pub mod cutover;
pub mod event_router;
pub mod lease_manager;
pub mod outbox_drainer;
pub mod planner;
pub mod reaper_loop;
pub mod registry;
pub mod retry_scheduler;
pub mod tasks;
pub mod worker_loop;

mod pacer;
mod payload;

pub use self::admin::{Admin, DeployReport, DispatcherStatus, StreamStatus};
pub use self::builder::{BuildError, Dispatcher, DispatcherBuilder, DispatcherHandle};
pub use self::config::{ConfigError, DispatcherConfig};
pub use self::cutover::CutoverCoordinator;
pub use self::event_router::{EventRouter, RoutePlan, RouteReport};
pub use self::lease_manager::LeaseManager;
pub use self::outbox_drainer::{DrainReport, OutboxDrainer};
pub use self::planner::{PlanReport, RangePlanner};
pub use self::reaper_loop::{LeaseReaper, ReapReport};
pub use self::registry::DatasetVersionRegistry;
pub use self::retry_scheduler::{RetryReport, RetryScheduler};
pub use self::tasks::TaskFactory;
pub use self::worker_loop::{WorkOutcome, WorkerLoop};
