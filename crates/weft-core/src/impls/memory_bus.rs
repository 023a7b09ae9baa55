//! InMemoryEventBus - プロセス内の wake-up 通知
//!
//! # 実装詳細
//! - topic ごとに tokio::sync::broadcast チャネルを 1 本
//! - 購読者がいなければ publish は何もしない（best-effort）
//! - 受信側が遅れて Lagged になっても「何か来た」とみなして起きる

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::ports::{BusError, EventBus, Subscription};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<()> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str) -> Result<(), BusError> {
        // 購読者 0 のときの SendError は無視
        let _ = self.sender(topic).send(());
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Box<dyn Subscription> {
        Box::new(BroadcastSubscription {
            rx: self.sender(topic).subscribe(),
        })
    }
}

struct BroadcastSubscription {
    rx: broadcast::Receiver<()>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn recv(&mut self) -> bool {
        match self.rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => false,
        }
    }
}
