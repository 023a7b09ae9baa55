//! InMemoryClusterLock - 単一プロセス内でのリーダー選出
//!
//! 複数の DelayedQueue driver を同じプロセスで動かすテストやデモ用です。
//! 期限は Clock で判定します。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::ports::{Clock, ClusterLock, StoreError};

#[derive(Debug, Clone)]
struct Holder {
    holder: String,
    version: u32,
    expires_at: DateTime<Utc>,
}

pub struct InMemoryClusterLock {
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Holder>>,
}

impl InMemoryClusterLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClusterLock for InMemoryClusterLock {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        version: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Other(format!("lock ttl out of range: {e}")))?;
        let mut locks = self.locks.lock().await;

        let granted = match locks.get(name) {
            None => true,
            Some(current) if current.holder == holder => version >= current.version,
            Some(current) if current.version > version => false,
            Some(current) if current.version < version => true,
            Some(current) => current.expires_at <= now,
        };

        if granted {
            locks.insert(
                name.to_string(),
                Holder {
                    holder: holder.to_string(),
                    version,
                    expires_at: now + ttl,
                },
            );
        }
        Ok(granted)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().await;
        if locks.get(name).is_some_and(|h| h.holder == holder) {
            locks.remove(name);
        }
        Ok(())
    }
}
