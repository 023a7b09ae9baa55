//! Backend - 外部協調者の束
//!
//! キューはグローバルなレジストリから store や bus を引かず、
//! 生成時にこの束を受け取ります。テストでは FixedClock と in-memory 実装を
//! 差し込むだけで、本番と同じコードパスを通せます。

use std::sync::Arc;

use crate::impls::{
    InMemoryClusterLock, InMemoryDelayedStore, InMemoryEventBus, InMemoryTaskStore,
};
use crate::ports::{
    Clock, ClusterLock, DelayedStore, EventBus, IdGenerator, SystemClock, TaskStore, UlidGenerator,
};

#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn TaskStore>,
    pub delayed: Arc<dyn DelayedStore>,
    pub bus: Arc<dyn EventBus>,
    pub lock: Arc<dyn ClusterLock>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Backend {
    /// Everything in process memory, on the system clock.
    pub fn in_memory() -> Self {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    /// Everything in process memory, on the given clock.
    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(InMemoryTaskStore::new()),
            delayed: Arc::new(InMemoryDelayedStore::new()),
            bus: Arc::new(InMemoryEventBus::new()),
            lock: Arc::new(InMemoryClusterLock::new(Arc::clone(&clock))),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }

    /// Publish a wake-up for `topic`. Failures only cost latency, so they are logged and dropped.
    pub(crate) async fn wake(&self, topic: &str) {
        if let Err(e) = self.bus.publish(topic).await {
            tracing::warn!(topic, error = %e, "wake-up publish failed");
        }
    }
}
