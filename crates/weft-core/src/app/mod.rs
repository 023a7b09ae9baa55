//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてキューの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **WorkQueue**: enqueue と worker の起動、運用向けの参照 API
//! - **Worker**: reclaim→discover→lease→execute→finalize のループ
//! - **ScheduledQueue**: カレンダー型の繰り返し（自己再アーム）
//! - **DelayedQueue**: クラスタロックで選ばれた 1 プロセスが fire-once 行を処理
//! - **WorkerHandle / WorkerGroup**: 協調的な停止と join

pub mod backend;
pub mod config;
pub mod delayed_queue;
pub mod scheduled_queue;
pub mod work_queue;
pub mod worker_group;
pub mod worker_loop;

mod lease;
mod reaper;

pub use self::backend::Backend;
pub use self::config::{DelayedConfig, QueueConfig};
pub use self::delayed_queue::DelayedQueue;
pub use self::scheduled_queue::{Firing, Rearming, ScheduledQueue};
pub use self::work_queue::WorkQueue;
pub use self::worker_group::{WorkerGroup, WorkerHandle};
pub use self::worker_loop::{Tick, Worker};
