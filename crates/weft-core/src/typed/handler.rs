//! Handler trait - payload を受け取って処理する側の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>) + 関連型 (Output)
//! - 失敗は `anyhow::Error` で返す。worker loop が Task の状態遷移に変換する
//!
//! handler はストアのトランザクションの外で呼ばれます。
//! 同じ payload で 2 回以上呼ばれうる（at-least-once）ので、冪等に書いてください。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::payload::Payload;
use crate::domain::{DelayedTask, LockSeed, QueueName, TaskId, TaskRecord};

/// Handler は payload を処理して結果を返す
///
/// # 使用例
/// ```ignore
/// struct SendEmailHandler;
///
/// #[async_trait]
/// impl Handler<SendEmail> for SendEmailHandler {
///     type Output = ();
///
///     async fn handle(&self, task: SendEmail, ctx: &ExecutionContext) -> anyhow::Result<()> {
///         mailer::send(&task.to).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Payload>: Send + Sync + 'static {
    /// Logged with the completed task.
    type Output: Serialize + Send + 'static;

    async fn handle(&self, payload: T, ctx: &ExecutionContext) -> anyhow::Result<Self::Output>;
}

/// Handler for a delayed queue. Runs on the elected driver only, once per row.
///
/// エラーを返すとその tick の処理はそこで止まり、行は Pending のまま次の tick で再実行されます。
#[async_trait]
pub trait DelayedHandler<T: Payload>: Send + Sync + 'static {
    async fn handle(&self, payload: T, task: &DelayedTask) -> anyhow::Result<()>;
}

/// What a handler knows about the attempt it is running.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    queue: QueueName,
    task_id: TaskId,
    lock_seed: LockSeed,
    failure_count: u32,
    max_failures: Option<u32>,
    start_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub(crate) fn new(task: &TaskRecord, lock_seed: LockSeed) -> Self {
        Self {
            queue: task.queue.clone(),
            task_id: task.id,
            lock_seed,
            failure_count: task.failure_count,
            max_failures: task.max_failures,
            start_at: task.start_at,
            created_at: task.created_at,
        }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn lock_seed(&self) -> LockSeed {
        self.lock_seed
    }

    /// 1 for the first attempt, 2 after one failure, ...
    pub fn attempt(&self) -> u32 {
        self.failure_count.saturating_add(1)
    }

    pub fn max_failures(&self) -> Option<u32> {
        self.max_failures
    }

    /// A failure of this attempt moves the task to `Failed`.
    pub fn is_final_attempt(&self) -> bool {
        self.max_failures.is_some_and(|max| self.attempt() >= max)
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        self.start_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    #[test]
    fn context_reports_attempt_and_final_flag() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut task = TaskRecord::new(
            QueueName::new("q"),
            TaskId::from_ulid(Ulid::new()),
            serde_json::json!({}),
            Some(3),
            None,
            now,
        );
        let seed = LockSeed::from_ulid(Ulid::new());

        let ctx = ExecutionContext::new(&task, seed);
        assert_eq!(ctx.attempt(), 1);
        assert!(!ctx.is_final_attempt());

        task.failure_count = 2;
        let ctx = ExecutionContext::new(&task, seed);
        assert_eq!(ctx.attempt(), 3);
        assert!(ctx.is_final_attempt());
        assert_eq!(ctx.task_id(), task.id);
        assert_eq!(ctx.queue().as_str(), "q");
    }
}
