//! Domain model (IDs, task record, retry policy, schedules, errors).
//!
//! ここには I/O を含めません。状態遷移は `TaskRecord` のメソッドとして表現し、
//! app 層はストアの atomic な書き込みの中でそれを呼び出すだけにします。

pub mod delayed;
pub mod errors;
pub mod ids;
pub mod retry;
pub mod schedule;
pub mod task;

pub use delayed::{DelayedStatus, DelayedTask};
pub use errors::{Result, WeftError};
pub use ids::{DelayedId, LockSeed, TaskId};
pub use retry::RetryPolicy;
pub use schedule::{Recurrence, Schedule, ScheduleSpec};
pub use task::{QueueCounts, QueueName, TaskRecord, TaskStatus};
