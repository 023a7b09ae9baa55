//! Task record: the single durable row behind every unit of work.
//!
//! # 状態遷移
//! - Pending -> Executing -> (削除)              成功
//! - Pending -> Executing -> Failing -> Pending    リトライ（backoff 経過後）
//! - Pending -> Executing -> Failed                max_failures 到達（dead letter）
//! - Executing (lock_timeout 経過) -> Pending      lease 回収
//!
//! 遷移はすべて `TaskStore::modify` の中で行われ、
//! `lock_seed` の一致を確認してから書き込みます。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{LockSeed, TaskId};

/// Name of a logical queue. One worker pool per name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Pub/sub topic used for wake-up notifications of this queue.
    pub fn topic(&self) -> String {
        format!("weft.queue.{}", self.0)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be leased (possibly not before `start_at`).
    Pending,

    /// Leased by the worker identified by `lock_seed`.
    Executing,

    /// Last attempt failed; eligible again once `failure_time` passes.
    Failing,

    /// Retry budget exhausted. Kept for inspection.
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Failed)
    }

    /// Pending, executing or failing: the task will still run.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Executing => "executing",
            TaskStatus::Failing => "failing",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Row counts per status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub executing: usize,
    pub failing: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Executing => self.executing += 1,
            TaskStatus::Failing => self.failing += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.executing + self.failing + self.failed
    }
}

/// One row per in-flight unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub queue: QueueName,
    pub id: TaskId,
    pub payload: serde_json::Value,
    pub status: TaskStatus,

    /// `None` means unlimited retries.
    pub max_failures: Option<u32>,

    /// Number of failed attempts so far (0 = never failed).
    pub failure_count: u32,

    pub lock_seed: Option<LockSeed>,
    pub lock_timeout: Option<DateTime<Utc>>,

    /// Not eligible for leasing before this instant.
    pub start_at: Option<DateTime<Utc>>,

    pub failure_message: Option<String>,

    /// For `Failing`: when the task becomes eligible again.
    /// For `Failed`: when the final failure happened.
    pub failure_time: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        queue: QueueName,
        id: TaskId,
        payload: serde_json::Value,
        max_failures: Option<u32>,
        start_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            queue,
            id,
            payload,
            status: TaskStatus::Pending,
            max_failures,
            failure_count: 0,
            lock_seed: None,
            lock_timeout: None,
            start_at,
            failure_message: None,
            failure_time: None,
            created_at: now,
        }
    }

    /// Eligible for leasing at `now` (pending and not before `start_at`).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.start_at.is_none_or(|at| at <= now)
    }

    /// Held by `seed` (status and token both match).
    pub fn is_owned_by(&self, seed: LockSeed) -> bool {
        self.status == TaskStatus::Executing && self.lock_seed == Some(seed)
    }

    /// Lease expired: an `Executing` row whose `lock_timeout` has passed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Executing && self.lock_timeout.is_none_or(|t| t <= now)
    }

    /// Failing row whose backoff has elapsed.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Failing && self.failure_time.is_none_or(|t| t <= now)
    }

    /// The next failure would exhaust the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.max_failures
            .is_some_and(|max| self.failure_count.saturating_add(1) >= max)
    }

    /// Pending -> Executing.
    pub fn lease(&mut self, seed: LockSeed, until: DateTime<Utc>) {
        self.status = TaskStatus::Executing;
        self.lock_seed = Some(seed);
        self.lock_timeout = Some(until);
    }

    pub fn renew(&mut self, until: DateTime<Utc>) {
        self.lock_timeout = Some(until);
    }

    /// Record one failed attempt.
    ///
    /// `retry_after` is consulted only when the task stays retryable.
    pub fn record_failure(
        &mut self,
        message: String,
        now: DateTime<Utc>,
        retry_after: impl FnOnce(u32) -> Duration,
    ) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.failure_message = Some(message);
        self.lock_seed = None;
        self.lock_timeout = None;

        if self.max_failures.is_some_and(|max| self.failure_count >= max) {
            self.status = TaskStatus::Failed;
            self.failure_time = Some(now);
        } else {
            self.status = TaskStatus::Failing;
            self.failure_time = Some(now + retry_after(self.failure_count));
        }
    }

    /// Executing (expired) or Failing (due) -> Pending.
    pub fn reclaim(&mut self) {
        self.status = TaskStatus::Pending;
        self.lock_seed = None;
        self.lock_timeout = None;
    }

    /// Failed -> Pending with a fresh retry budget.
    pub fn revive(&mut self) {
        self.reclaim();
        self.failure_count = 0;
        self.failure_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record(max_failures: Option<u32>) -> TaskRecord {
        TaskRecord::new(
            QueueName::new("test"),
            TaskId::from_ulid(Ulid::new()),
            serde_json::json!({}),
            max_failures,
            None,
            now(),
        )
    }

    #[test]
    fn new_record_is_pending_and_unleased() {
        let r = record(Some(3));
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.failure_count, 0);
        assert!(r.lock_seed.is_none());
        assert!(r.is_eligible(now()));
    }

    #[test]
    fn start_at_in_future_is_not_eligible() {
        let mut r = record(None);
        r.start_at = Some(now() + Duration::hours(1));
        assert!(!r.is_eligible(now()));
        assert!(r.is_eligible(now() + Duration::hours(1)));
    }

    #[test]
    fn ownership_requires_matching_seed() {
        let mine = LockSeed::from_ulid(Ulid::new());
        let theirs = LockSeed::from_ulid(Ulid::new());
        let mut r = record(None);
        r.lease(mine, now() + Duration::seconds(15));

        assert!(r.is_owned_by(mine));
        assert!(!r.is_owned_by(theirs));
        assert!(!r.lease_expired(now() + Duration::seconds(14)));
        assert!(r.lease_expired(now() + Duration::seconds(15)));
    }

    #[rstest]
    #[case(Some(3), 1, TaskStatus::Failing)]
    #[case(Some(3), 2, TaskStatus::Failing)]
    #[case(Some(3), 3, TaskStatus::Failed)]
    #[case(Some(1), 1, TaskStatus::Failed)]
    #[case(None, 50, TaskStatus::Failing)]
    fn failures_stop_exactly_at_max(
        #[case] max: Option<u32>,
        #[case] failures: u32,
        #[case] expected: TaskStatus,
    ) {
        let mut r = record(max);
        for _ in 0..failures {
            r.record_failure("boom".to_string(), now(), |_| Duration::seconds(1));
        }
        assert_eq!(r.status, expected);
        assert_eq!(r.failure_count, failures);
        assert!(r.lock_seed.is_none());
    }

    #[test]
    fn failing_sets_retry_time_from_backoff() {
        let mut r = record(Some(5));
        r.record_failure("boom".to_string(), now(), |n| Duration::seconds(n as i64 * 10));
        assert_eq!(r.failure_time, Some(now() + Duration::seconds(10)));
        assert!(!r.retry_due(now()));
        assert!(r.retry_due(now() + Duration::seconds(10)));
        assert_eq!(r.failure_message.as_deref(), Some("boom"));
    }

    #[test]
    fn final_attempt_is_detected_before_failing() {
        let mut r = record(Some(2));
        assert!(!r.is_final_attempt());
        r.record_failure("x".to_string(), now(), |_| Duration::zero());
        assert!(r.is_final_attempt());
        assert!(!record(None).is_final_attempt());
    }

    #[test]
    fn revive_resets_budget() {
        let mut r = record(Some(1));
        r.record_failure("x".to_string(), now(), |_| Duration::zero());
        assert_eq!(r.status, TaskStatus::Failed);
        r.revive();
        assert_eq!(r.status, TaskStatus::Pending);
        assert_eq!(r.failure_count, 0);
    }
}
