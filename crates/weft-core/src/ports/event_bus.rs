//! EventBus port - wake-up 通知用の pub/sub
//!
//! at-least-once / best-effort。順序も配送も保証しません。
//! 通知を取りこぼしても worker は poll 間隔で必ず拾い直すので、
//! ここでの失敗は遅延が増えるだけです。

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("event bus: {0}")]
pub struct BusError(pub String);

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str) -> Result<(), BusError>;

    fn subscribe(&self, topic: &str) -> Box<dyn Subscription>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next signal. Returns `false` once the bus has gone away.
    async fn recv(&mut self) -> bool;
}
