//! Delayed task: fire once at an explicit time.
//!
//! Work queue の Task とは別の行で、lease を持ちません。
//! 単一の driver（クラスタロックで選出）だけが処理するためです。
//! 完了した行は削除せず `Completed` として残します（監査用）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::DelayedId;
use super::task::QueueName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayedStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedTask {
    pub queue: QueueName,
    pub id: DelayedId,
    pub payload: serde_json::Value,
    pub fire_at: DateTime<Utc>,
    pub status: DelayedStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DelayedTask {
    pub fn new(
        queue: QueueName,
        id: DelayedId,
        payload: serde_json::Value,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            queue,
            id,
            payload,
            fire_at,
            status: DelayedStatus::Pending,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DelayedStatus::Pending && self.fire_at <= now
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = DelayedStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Index key that sorts eligible rows first in a forward range scan.
    ///
    /// The key is the negated fire time in milliseconds, so `fire_at <= now`
    /// is exactly `sort_key >= -now_ms`.
    pub fn sort_key(&self) -> i64 {
        fire_key(self.fire_at)
    }
}

pub fn fire_key(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis().saturating_neg()
}
