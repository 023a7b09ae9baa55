//! Reaper - 期限切れ lease と backoff 済みの失敗タスクを回収
//!
//! # フロー
//! 1. find_reclaimable() で候補を取得
//!    - Executing かつ lock_timeout <= now（worker がクラッシュした）
//!    - Failing かつ failure_time <= now（backoff が終わった）
//! 2. 1 行ずつ modify() の中で条件を再確認して Pending に戻す
//! 3. 1 件でも戻したら wake-up を publish
//!
//! 専用のループは持たず、各 worker が discovery の直前に呼びます。
//! 複数の worker が同時に走っても、条件を書き込みの中で再確認するので
//! 二重に戻すことはありません。lock_timeout より前に回収することもありません。

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::backend::Backend;
use crate::domain::{QueueName, Result, TaskStatus};
use crate::ports::Write;

#[derive(Clone)]
pub struct Reaper {
    queue: QueueName,
    backend: Backend,
    limit: usize,
}

impl Reaper {
    pub fn new(queue: QueueName, backend: Backend, limit: usize) -> Self {
        Self {
            queue,
            backend,
            limit,
        }
    }

    /// Return abandoned and retry-due rows to `Pending`. Returns how many were moved.
    pub async fn sweep(&self) -> Result<usize> {
        let now = self.backend.clock.now();
        self.sweep_at(now).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self
            .backend
            .store
            .find_reclaimable(&self.queue, now, self.limit)
            .await?;

        let mut reclaimed = 0;
        for candidate in candidates {
            let write = self
                .backend
                .store
                .modify(candidate.id, &mut |row| match row {
                    Some(r) if r.lease_expired(now) || r.retry_due(now) => {
                        let mut r = r.clone();
                        r.reclaim();
                        Write::Put(r)
                    }
                    _ => Write::Unchanged,
                })
                .await?;

            if matches!(write, Write::Put(_)) {
                reclaimed += 1;
                if candidate.status == TaskStatus::Executing {
                    warn!(
                        queue = %self.queue,
                        task_id = %candidate.id,
                        seed = ?candidate.lock_seed,
                        "lease expired, task returned to pending"
                    );
                } else {
                    debug!(
                        queue = %self.queue,
                        task_id = %candidate.id,
                        failure_count = candidate.failure_count,
                        "backoff elapsed, task returned to pending"
                    );
                }
            }
        }

        if reclaimed > 0 {
            self.backend.wake(&self.queue.topic()).await;
        }
        Ok(reclaimed)
    }
}
