//! weft-core
//!
//! Transactional work queues on top of a serializable key-value store.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task record, retry policy, schedule, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, DelayedStore, EventBus, ClusterLock, Clock, IdGenerator）
//! - **app**: キューの振る舞い（WorkQueue, Worker, ScheduledQueue, DelayedQueue）
//! - **typed**: 型付き payload / handler API（Payload, Handler, DelayedHandler）
//! - **impls**: ports の in-memory 実装
//!
//! # 保証
//! - at-least-once: handler は同じ payload で 2 回以上呼ばれうる。冪等に書くこと
//! - 同じ queue の中で FIFO は保証しない（候補はランダムに選ばれる）
//! - `start_at` より前に実行されることはない

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{
    Backend, DelayedConfig, DelayedQueue, Firing, QueueConfig, ScheduledQueue, WorkQueue,
    WorkerGroup, WorkerHandle,
};
pub use domain::{Result, Schedule, TaskRecord, TaskStatus, WeftError};
pub use typed::{DelayedHandler, ExecutionContext, Handler, Payload};
