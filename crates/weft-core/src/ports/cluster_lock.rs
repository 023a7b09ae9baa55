//! ClusterLock port - クラスタ全体での排他（リーダー選出）
//!
//! Delayed queue の driver を 1 プロセスに限定するために使います。
//! 取得できなければその tick は何もしません。
//!
//! # version
//! 新しいバージョンのプロセスは古いバージョンが保持するロックを奪えます。
//! 古いバージョンは新しいバージョンのロックを奪えません。

use std::time::Duration;

use async_trait::async_trait;

use crate::ports::StoreError;

#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Acquire or extend `name` for `holder` for `ttl`.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        version: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release `name` if `holder` owns it.
    async fn release(&self, name: &str, holder: &str) -> Result<(), StoreError>;
}
