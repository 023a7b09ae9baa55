//! Worker - 1 つの worker ループ（reclaim→discover→lease→execute→finalize）
//!
//! # フロー
//! 1. Reaper::sweep() で期限切れ lease / backoff 済みの行を Pending に戻す
//! 2. find_pending() + find_due() で候補を集め、ランダムに 1 件選ぶ
//! 3. modify() の中で Pending → Executing（lock_seed = 自分の seed）
//! 4. LeaseRenewal を起動して handler を別 task で実行
//! 5. 成功なら行を削除、失敗なら Failing / Failed に遷移
//!
//! # 実装詳細
//! - 排他は 3 の atomic な遷移だけで成立する（中央の coordinator はない）
//! - 4 以降の書き込みはすべて `is_owned_by(seed)` を再確認する。
//!   lease を失っていたら何もしない
//! - 候補のランダム選択で同時に起きた worker 同士の衝突を減らす
//! - handler の panic は JoinError として受け取り、失敗として記録する

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::backend::Backend;
use super::config::QueueConfig;
use super::lease::LeaseRenewal;
use super::reaper::Reaper;
use crate::domain::{LockSeed, QueueName, Result, TaskId, TaskRecord, TaskStatus};
use crate::ports::{Subscription, Write};
use crate::typed::payload::decode;
use crate::typed::{ExecutionContext, Handler, Payload};

/// What one cycle of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Nothing eligible.
    Idle,

    /// The picked candidate was taken by someone else first.
    Contended,

    /// Handler succeeded and the row was deleted.
    Completed(TaskId),

    /// Handler failed; the task will be retried after backoff.
    Retrying(TaskId),

    /// Handler failed on its last allowed attempt.
    Dead(TaskId),

    /// The lease was lost before the outcome could be written.
    LeaseLost(TaskId),
}

pub struct Worker<T, H> {
    queue: QueueName,
    seed: LockSeed,
    backend: Backend,
    config: Arc<QueueConfig>,
    handler: Arc<H>,
    reaper: Reaper,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> Worker<T, H>
where
    T: Payload,
    H: Handler<T>,
{
    pub fn new(queue: QueueName, backend: Backend, config: Arc<QueueConfig>, handler: Arc<H>) -> Self {
        let seed = backend.ids.generate_lock_seed();
        let reaper = Reaper::new(queue.clone(), backend.clone(), config.reclaim_limit);
        Self {
            queue,
            seed,
            backend,
            config,
            handler,
            reaper,
            _payload: PhantomData,
        }
    }

    pub fn seed(&self) -> LockSeed {
        self.seed
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut subscription: Option<Box<dyn Subscription>> =
            Some(self.backend.bus.subscribe(&self.queue.topic()));
        info!(queue = %self.queue, seed = %self.seed, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Tick::Completed(_)) => continue,
                Ok(tick) => debug!(queue = %self.queue, ?tick, "cycle finished"),
                Err(e) => warn!(queue = %self.queue, seed = %self.seed, error = %e, "worker cycle failed"),
            }

            let woke = match subscription.as_mut() {
                Some(sub) => tokio::select! {
                    changed = shutdown.changed() => Wait::Shutdown(changed.is_err()),
                    alive = sub.recv() => Wait::Notified(alive),
                    _ = tokio::time::sleep(self.config.poll_interval) => Wait::Timeout,
                },
                None => tokio::select! {
                    changed = shutdown.changed() => Wait::Shutdown(changed.is_err()),
                    _ = tokio::time::sleep(self.config.poll_interval) => Wait::Timeout,
                },
            };

            match woke {
                Wait::Shutdown(true) => break,
                Wait::Notified(false) => {
                    // bus closed: polling only from here on
                    warn!(queue = %self.queue, "wake-up subscription closed");
                    subscription = None;
                }
                Wait::Shutdown(false) | Wait::Notified(true) | Wait::Timeout => {}
            }
        }

        info!(queue = %self.queue, seed = %self.seed, "worker stopped");
    }

    /// One full cycle. Infrastructure errors are returned, handler errors never are.
    pub async fn run_once(&self) -> Result<Tick> {
        if let Err(e) = self.reaper.sweep().await {
            warn!(queue = %self.queue, error = %e, "reclaim sweep failed");
        }

        let now = self.backend.clock.now();
        let Some(candidate) = self.discover(now).await? else {
            return Ok(Tick::Idle);
        };

        let Some(task) = self.try_lease(candidate, now).await? else {
            debug!(queue = %self.queue, task_id = %candidate, "lease contended");
            return Ok(Tick::Contended);
        };

        let span = info_span!(
            "weft.task",
            queue = %self.queue,
            task_id = %task.id,
            attempt = task.failure_count + 1,
        );
        self.execute(task).instrument(span).await
    }

    async fn discover(&self, now: DateTime<Utc>) -> Result<Option<TaskId>> {
        let limit = self.config.discovery_limit;
        let mut candidates = self.backend.store.find_pending(&self.queue, limit).await?;
        candidates.extend(self.backend.store.find_due(&self.queue, now, limit).await?);

        let picked = candidates.choose(&mut rand::thread_rng()).map(|t| t.id);
        Ok(picked)
    }

    async fn try_lease(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<TaskRecord>> {
        let until = now + chrono_duration(self.config.lease_timeout);
        let seed = self.seed;

        let write = self
            .backend
            .store
            .modify(id, &mut |row| match row {
                Some(r) if r.is_owned_by(seed) => {
                    let mut r = r.clone();
                    r.renew(until);
                    Write::Put(r)
                }
                Some(r) if r.is_eligible(now) => {
                    let mut r = r.clone();
                    r.lease(seed, until);
                    Write::Put(r)
                }
                _ => Write::Unchanged,
            })
            .await?;

        match write {
            Write::Put(task) => Ok(Some(task)),
            _ => Ok(None),
        }
    }

    async fn execute(&self, task: TaskRecord) -> Result<Tick> {
        let id = task.id;
        debug!("task leased");

        let renewal = LeaseRenewal::start(
            self.backend.clone(),
            id,
            self.seed,
            self.config.lease_timeout,
            self.config.renew_interval,
        );
        let outcome = self.invoke(&task).await;
        renewal.stop().await;

        match outcome {
            Ok(result) => self.complete(id, result).await,
            Err(message) => self.fail(id, message).await,
        }
    }

    /// Decode and run the handler in its own task. `Err` carries the failure message.
    async fn invoke(&self, task: &TaskRecord) -> std::result::Result<serde_json::Value, String> {
        let payload: T = decode(&task.payload).map_err(|e| format!("payload decode failed: {e}"))?;
        let ctx = ExecutionContext::new(task, self.seed);
        let handler = Arc::clone(&self.handler);

        let joined = tokio::spawn(
            async move {
                let output = handler.handle(payload, &ctx).await?;
                Ok::<_, anyhow::Error>(serde_json::to_value(output)?)
            }
            .in_current_span(),
        )
        .await;

        match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(e) if e.is_panic() => Err(format!("handler panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Err(format!("handler task aborted: {e}")),
        }
    }

    async fn complete(&self, id: TaskId, result: serde_json::Value) -> Result<Tick> {
        let seed = self.seed;
        let write = self
            .backend
            .store
            .modify(id, &mut |row| match row {
                Some(r) if r.is_owned_by(seed) => Write::Delete,
                _ => Write::Unchanged,
            })
            .await?;

        if write == Write::Delete {
            info!(%result, "task completed");
            Ok(Tick::Completed(id))
        } else {
            warn!("lease lost before completion, result discarded");
            Ok(Tick::LeaseLost(id))
        }
    }

    async fn fail(&self, id: TaskId, message: String) -> Result<Tick> {
        let seed = self.seed;
        let now = self.backend.clock.now();
        let retry = self.config.retry.clone();

        let write = self
            .backend
            .store
            .modify(id, &mut |row| match row {
                Some(r) if r.is_owned_by(seed) => {
                    let mut r = r.clone();
                    r.record_failure(message.clone(), now, |n| retry.next_delay_chrono(n));
                    Write::Put(r)
                }
                _ => Write::Unchanged,
            })
            .await?;

        match write {
            Write::Put(r) if r.status == TaskStatus::Failed => {
                error!(failure_count = r.failure_count, error = %message, "task failed permanently");
                Ok(Tick::Dead(id))
            }
            Write::Put(r) => {
                warn!(
                    failure_count = r.failure_count,
                    retry_at = ?r.failure_time,
                    error = %message,
                    "task failed, will retry"
                );
                Ok(Tick::Retrying(id))
            }
            _ => {
                warn!(error = %message, "lease lost before failure could be recorded");
                Ok(Tick::LeaseLost(id))
            }
        }
    }
}

enum Wait {
    /// `true` when the sender is gone.
    Shutdown(bool),
    Notified(bool),
    Timeout,
}

pub(crate) fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use crate::ports::{Clock, FixedClock};
    use crate::typed::payload::encode;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Job {
        n: u32,
    }

    struct Doubler;

    #[async_trait]
    impl Handler<Job> for Doubler {
        type Output = u32;

        async fn handle(&self, job: Job, _ctx: &ExecutionContext) -> anyhow::Result<u32> {
            Ok(job.n * 2)
        }
    }

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler<Job> for AlwaysFails {
        type Output = ();

        async fn handle(&self, _job: Job, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("nope")
        }
    }

    struct Panics;

    #[async_trait]
    impl Handler<Job> for Panics {
        type Output = ();

        async fn handle(&self, _job: Job, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            panic!("handler exploded");
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn config() -> Arc<QueueConfig> {
        Arc::new(QueueConfig {
            max_failures: Some(3),
            retry: RetryPolicy {
                jitter: 0.0,
                ..RetryPolicy::default()
            },
            ..QueueConfig::default()
        })
    }

    async fn seed_task(backend: &Backend, payload: serde_json::Value) -> TaskId {
        let id = backend.ids.generate_task_id();
        let task = TaskRecord::new(QueueName::new("q"), id, payload, Some(3), None, backend.clock.now());
        backend.store.insert(task).await.unwrap();
        id
    }

    fn fixture() -> (FixedClock, Backend) {
        let clock = FixedClock::new(start());
        let backend = Backend::in_memory_with_clock(Arc::new(clock.clone()));
        (clock, backend)
    }

    #[tokio::test]
    async fn idle_when_queue_is_empty() {
        let (_, backend) = fixture();
        let worker = Worker::new(QueueName::new("q"), backend, config(), Arc::new(Doubler));
        assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn success_deletes_the_row() {
        let (_, backend) = fixture();
        let id = seed_task(&backend, encode(&Job { n: 21 }).unwrap()).await;
        let worker = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::new(Doubler));

        assert_eq!(worker.run_once().await.unwrap(), Tick::Completed(id));
        assert!(backend.store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_moves_to_failing_with_backoff() {
        let (_, backend) = fixture();
        let id = seed_task(&backend, encode(&Job { n: 1 }).unwrap()).await;
        let handler = Arc::new(AlwaysFails { calls: AtomicU32::new(0) });
        let worker = Worker::new(QueueName::new("q"), backend.clone(), config(), handler);

        assert_eq!(worker.run_once().await.unwrap(), Tick::Retrying(id));
        let row = backend.store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failing);
        assert_eq!(row.failure_count, 1);
        assert_eq!(row.failure_message.as_deref(), Some("nope"));
        assert_eq!(row.failure_time, Some(start() + Duration::seconds(1)));
        assert!(row.lock_seed.is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_task() {
        let (clock, backend) = fixture();
        let id = seed_task(&backend, encode(&Job { n: 1 }).unwrap()).await;
        let handler = Arc::new(AlwaysFails { calls: AtomicU32::new(0) });
        let worker = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::clone(&handler));

        assert_eq!(worker.run_once().await.unwrap(), Tick::Retrying(id));
        assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
        clock.advance(Duration::seconds(1));
        assert_eq!(worker.run_once().await.unwrap(), Tick::Retrying(id));
        clock.advance(Duration::seconds(2));
        assert_eq!(worker.run_once().await.unwrap(), Tick::Dead(id));

        let row = backend.store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Failed);
        assert_eq!(row.failure_count, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        clock.advance(Duration::days(1));
        assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn panic_is_recorded_as_failure() {
        let (_, backend) = fixture();
        let id = seed_task(&backend, encode(&Job { n: 1 }).unwrap()).await;
        let worker = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::new(Panics));

        assert_eq!(worker.run_once().await.unwrap(), Tick::Retrying(id));
        let row = backend.store.get(id).await.unwrap().unwrap();
        assert!(row.failure_message.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_failure() {
        let (_, backend) = fixture();
        let id = seed_task(&backend, serde_json::json!({ "n": "not a number" })).await;
        let worker = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::new(Doubler));

        assert_eq!(worker.run_once().await.unwrap(), Tick::Retrying(id));
        let row = backend.store.get(id).await.unwrap().unwrap();
        assert!(row.failure_message.unwrap().starts_with("payload decode failed"));
    }

    #[tokio::test]
    async fn leased_by_another_worker_is_not_taken() {
        let (_, backend) = fixture();
        let id = seed_task(&backend, encode(&Job { n: 1 }).unwrap()).await;
        let a = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::new(Doubler));
        let b = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::new(Doubler));

        let leased = a.try_lease(id, start()).await.unwrap();
        assert!(leased.is_some());
        assert!(b.try_lease(id, start()).await.unwrap().is_none());
        assert_eq!(b.run_once().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn stale_owner_cannot_finalize_after_reclaim() {
        let (clock, backend) = fixture();
        let id = seed_task(&backend, encode(&Job { n: 1 }).unwrap()).await;
        let a = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::new(Doubler));
        let b = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::new(Doubler));

        a.try_lease(id, start()).await.unwrap();
        clock.advance(Duration::seconds(15));
        b.reaper.sweep().await.unwrap();
        b.try_lease(id, clock.now()).await.unwrap();

        assert_eq!(a.complete(id, serde_json::Value::Null).await.unwrap(), Tick::LeaseLost(id));
        let row = backend.store.get(id).await.unwrap().unwrap();
        assert!(row.is_owned_by(b.seed()));
    }

    #[tokio::test]
    async fn future_start_at_is_skipped_until_due() {
        let (clock, backend) = fixture();
        let id = backend.ids.generate_task_id();
        let task = TaskRecord::new(
            QueueName::new("q"),
            id,
            encode(&Job { n: 1 }).unwrap(),
            None,
            Some(start() + Duration::hours(1)),
            start(),
        );
        backend.store.insert(task).await.unwrap();
        let worker = Worker::new(QueueName::new("q"), backend.clone(), config(), Arc::new(Doubler));

        assert_eq!(worker.run_once().await.unwrap(), Tick::Idle);
        clock.advance(Duration::hours(1));
        assert_eq!(worker.run_once().await.unwrap(), Tick::Completed(id));
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let backend = Backend::in_memory();
        let worker = Worker::new(QueueName::new("q"), backend, config(), Arc::new(Doubler));
        let (tx, rx) = watch::channel(false);
        let join = tokio::spawn(worker.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), join)
            .await
            .unwrap()
            .unwrap();
    }
}
