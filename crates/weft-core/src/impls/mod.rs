//! Impls - ports の in-memory 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: BTreeMap + 1 つの Mutex（modify がそのまま atomic になる）
//! - **InMemoryDelayedStore**: fire_at の負値キーによる順序付き index
//! - **InMemoryEventBus**: topic ごとの tokio broadcast
//! - **InMemoryClusterLock**: version 付きの TTL ロック
//!
//! # 本番用実装
//! トランザクショナルな KV ストアや pub/sub への実装は別クレートに配置します。

pub mod memory_bus;
pub mod memory_delayed;
pub mod memory_lock;
pub mod memory_store;

pub use self::memory_bus::InMemoryEventBus;
pub use self::memory_delayed::InMemoryDelayedStore;
pub use self::memory_lock::InMemoryClusterLock;
pub use self::memory_store::InMemoryTaskStore;
