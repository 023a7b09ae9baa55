//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部の協調者（トランザクショナル KV ストア、pub/sub、
//! クラスタロック）へのインターフェースで、キューエンジンは
//! コンストラクタ経由でこれらを受け取ります（グローバルな lookup はしない）。

pub mod clock;
pub mod cluster_lock;
pub mod delayed_store;
pub mod event_bus;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::cluster_lock::ClusterLock;
pub use self::delayed_store::DelayedStore;
pub use self::event_bus::{BusError, EventBus, Subscription};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{StoreError, TaskStore, Write};
