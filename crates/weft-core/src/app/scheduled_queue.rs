//! ScheduledQueue - カレンダー型の繰り返しタスク
//!
//! WorkQueue<Firing> の上に載る薄い層です。
//!
//! # フロー
//! 1. start() で「active な scheduled firing が無ければ」次回分を 1 件 enqueue
//! 2. worker が firing を実行する
//! 3. scheduled firing が成功（または最後の試行で失敗）したら、次回分を enqueue
//!
//! # 実装詳細
//! - 重複防止は `insert_unless` の atomic な check-then-insert で行う。
//!   再起動を繰り返しても firing が積み上がらない
//! - 次回時刻は `max(now, due_at)` の直後から数える（同じ時刻を二重に発火しない）
//! - fire_now() の firing は `scheduled = false` なので再アームしない
//! - 内側の handler は別 task で実行する。panic しても失敗として扱い、再アームの判定は同じ

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, warn};

use super::backend::Backend;
use super::config::QueueConfig;
use super::work_queue::WorkQueue;
use super::worker_loop::panic_message;
use super::worker_group::WorkerGroup;
use crate::domain::{QueueName, Result, Schedule, TaskId, TaskRecord};
use crate::typed::payload::decode;
use crate::typed::{ExecutionContext, Handler};

/// Payload of every task on a scheduled queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firing {
    /// Calendar-triggered (re-arms on completion) as opposed to a manual `fire_now`.
    pub scheduled: bool,

    /// The occurrence this firing stands for. `None` for manual firings.
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ScheduledQueue {
    queue: WorkQueue<Firing>,
    schedule: Schedule,
}

impl ScheduledQueue {
    pub fn new(
        name: impl Into<QueueName>,
        backend: Backend,
        schedule: Schedule,
        config: QueueConfig,
    ) -> Result<Self> {
        Ok(Self {
            queue: WorkQueue::new(name, backend, config)?,
            schedule,
        })
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// The underlying work queue (inspection, extra workers).
    pub fn queue(&self) -> &WorkQueue<Firing> {
        &self.queue
    }

    /// Next occurrence from the backend's clock.
    pub fn next_occurrence(&self) -> DateTime<Utc> {
        self.schedule.next_occurrence(self.queue.backend().clock.now())
    }

    /// Enqueue the next occurrence unless a scheduled firing is already active.
    pub async fn arm(&self) -> Result<Option<TaskRecord>> {
        self.arm_at(self.next_occurrence(), None).await
    }

    /// Arm, then spawn `concurrency` workers whose completions re-arm the schedule.
    pub async fn start<H: Handler<Firing>>(&self, handler: Arc<H>, concurrency: usize) -> Result<WorkerGroup> {
        match self.arm().await? {
            Some(task) => info!(queue = %self.queue.name(), due_at = ?task.start_at, "schedule armed"),
            None => info!(queue = %self.queue.name(), "schedule already armed"),
        }
        Ok(self.queue.add_workers(Arc::new(self.rearming(handler)), concurrency))
    }

    /// Run the handler once now without touching the schedule.
    pub async fn fire_now(&self) -> Result<TaskRecord> {
        let firing = Firing {
            scheduled: false,
            due_at: None,
        };
        self.queue.enqueue(&firing).await
    }

    /// Wrap `handler` so that scheduled firings re-arm the next occurrence.
    pub fn rearming<H: Handler<Firing>>(&self, handler: Arc<H>) -> Rearming<H> {
        Rearming {
            owner: self.clone(),
            inner: handler,
        }
    }

    /// Arm the occurrence following a completed firing.
    async fn rearm(&self, completed: TaskId, due_at: Option<DateTime<Utc>>) -> Result<Option<TaskRecord>> {
        let now = self.queue.backend().clock.now();
        let from = due_at.map_or(now, |due| due.max(now)) + Duration::milliseconds(1);
        self.arm_at(self.schedule.next_occurrence(from), Some(completed)).await
    }

    async fn arm_at(&self, due_at: DateTime<Utc>, exclude: Option<TaskId>) -> Result<Option<TaskRecord>> {
        let firing = Firing {
            scheduled: true,
            due_at: Some(due_at),
        };
        let conflict = move |r: &TaskRecord| {
            Some(r.id) != exclude && decode::<Firing>(&r.payload).is_ok_and(|f| f.scheduled)
        };
        self.queue.push_unless(&firing, Some(due_at), &conflict).await
    }
}

/// Handler wrapper that re-arms after the final outcome of a scheduled firing.
pub struct Rearming<H> {
    owner: ScheduledQueue,
    inner: Arc<H>,
}

#[async_trait]
impl<H: Handler<Firing>> Handler<Firing> for Rearming<H> {
    type Output = H::Output;

    async fn handle(&self, firing: Firing, ctx: &ExecutionContext) -> anyhow::Result<H::Output> {
        let Firing { scheduled, due_at } = firing.clone();
        let inner = Arc::clone(&self.inner);
        let inner_ctx = ctx.clone();
        let joined = tokio::spawn(async move { inner.handle(firing, &inner_ctx).await }.in_current_span()).await;
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(anyhow!("handler panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Err(anyhow!("handler task aborted: {e}")),
        };

        // a retryable failure re-arms later, from its final attempt
        if scheduled && (outcome.is_ok() || ctx.is_final_attempt()) {
            match self.owner.rearm(ctx.task_id(), due_at).await {
                Ok(Some(next)) => info!(due_at = ?next.start_at, "next occurrence armed"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to arm next occurrence"),
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::worker_loop::Tick;
    use crate::domain::TaskStatus;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counter {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Handler<Firing> for Counter {
        type Output = ();

        async fn handle(&self, _firing: Firing, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("report generation failed");
            }
            Ok(())
        }
    }

    // Monday
    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn fixture(max_failures: Option<u32>) -> (FixedClock, ScheduledQueue) {
        let clock = FixedClock::new(start());
        let backend = Backend::in_memory_with_clock(Arc::new(clock.clone()));
        let config = QueueConfig {
            max_failures,
            ..QueueConfig::default()
        };
        let queue = ScheduledQueue::new("report", backend, Schedule::daily(9, 30).unwrap(), config).unwrap();
        (clock, queue)
    }

    async fn pending(queue: &ScheduledQueue) -> Vec<TaskRecord> {
        queue
            .queue()
            .backend()
            .store
            .list(queue.queue().name(), Some(TaskStatus::Pending), 100)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn arm_is_idempotent() {
        let (_, queue) = fixture(Some(5));

        let first = queue.arm().await.unwrap().unwrap();
        assert_eq!(first.start_at, Some(at(1, 9, 30)));
        assert!(queue.arm().await.unwrap().is_none());
        assert!(queue.arm().await.unwrap().is_none());

        assert_eq!(pending(&queue).await.len(), 1);
    }

    #[tokio::test]
    async fn completed_firing_arms_exactly_the_next_occurrence() {
        let (clock, queue) = fixture(Some(5));
        queue.arm().await.unwrap();
        let handler = Arc::new(Counter::default());
        let worker = queue.queue().worker(Arc::new(queue.rearming(Arc::clone(&handler))));

        assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
        clock.set(at(1, 9, 30));
        assert!(matches!(worker.run_once().await.unwrap(), Tick::Completed(_)));

        let rows = pending(&queue).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_at, Some(at(2, 9, 30)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_run_does_not_fire_the_same_day_twice() {
        let (clock, queue) = fixture(Some(5));
        queue.arm().await.unwrap();
        let worker = queue.queue().worker(Arc::new(queue.rearming(Arc::new(Counter::default()))));

        // workers were down for most of the day
        clock.set(at(1, 23, 0));
        worker.run_once().await.unwrap();

        let rows = pending(&queue).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_at, Some(at(2, 9, 30)));
    }

    #[tokio::test]
    async fn retryable_failure_does_not_rearm_but_final_failure_does() {
        let (clock, queue) = fixture(Some(2));
        queue.arm().await.unwrap();
        let handler = Arc::new(Counter {
            fail: true,
            ..Counter::default()
        });
        let worker = queue.queue().worker(Arc::new(queue.rearming(handler)));

        clock.set(at(1, 9, 30));
        assert!(matches!(worker.run_once().await.unwrap(), Tick::Retrying(_)));
        assert!(pending(&queue).await.is_empty());

        clock.advance(Duration::seconds(10));
        assert!(matches!(worker.run_once().await.unwrap(), Tick::Dead(_)));

        let rows = pending(&queue).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_at, Some(at(2, 9, 30)));
        assert_eq!(queue.queue().counts().await.unwrap().failed, 1);
    }

    struct Exploding;

    #[async_trait]
    impl Handler<Firing> for Exploding {
        type Output = ();

        async fn handle(&self, _firing: Firing, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            panic!("report template missing");
        }
    }

    #[tokio::test]
    async fn panicking_final_attempt_still_rearms() {
        let (clock, queue) = fixture(Some(1));
        queue.arm().await.unwrap();
        let worker = queue.queue().worker(Arc::new(queue.rearming(Arc::new(Exploding))));

        clock.set(at(1, 9, 30));
        assert!(matches!(worker.run_once().await.unwrap(), Tick::Dead(_)));

        let rows = pending(&queue).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_at, Some(at(2, 9, 30)));

        let failed = queue.queue().failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].failure_message.as_deref().unwrap().contains("report template missing"));
    }

    #[tokio::test]
    async fn fire_now_runs_without_rearming() {
        let (_, queue) = fixture(Some(5));
        let handler = Arc::new(Counter::default());
        let worker = queue.queue().worker(Arc::new(queue.rearming(Arc::clone(&handler))));

        let manual = queue.fire_now().await.unwrap();
        assert_eq!(worker.run_once().await.unwrap(), Tick::Completed(manual.id));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.queue().counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn fire_now_does_not_block_arming() {
        let (_, queue) = fixture(Some(5));
        queue.fire_now().await.unwrap();
        assert!(queue.arm().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restarting_never_piles_up_firings() {
        let (_, queue) = fixture(Some(5));
        for _ in 0..3 {
            let group = queue.start(Arc::new(Counter::default()), 2).await.unwrap();
            group.shutdown_and_join().await;
        }
        assert_eq!(pending(&queue).await.len(), 1);
    }
}
