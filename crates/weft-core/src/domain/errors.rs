//! Errors - エラー型と分類
//!
//! # 分類
//! - Store: 外部ストア（正本）の障害。ループ内ではログに残して次の周期へ
//! - Codec: payload / result の (de)serialize 失敗
//! - InvalidSchedule / Config: 起動時に検出する設定ミス（Fail-fast）
//! - NotFound / InvalidState: 運用 API（retry_failed など）の誤用
//!
//! handler の失敗はここには含めません。handler は `anyhow::Error` を返し、
//! worker loop がそれを Task の状態遷移に変換します。

use thiserror::Error;

use super::ids::TaskId;
use super::task::TaskStatus;
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum WeftError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("payload codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} is {actual}, expected {expected}")]
    InvalidState {
        id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },
}

pub type Result<T> = std::result::Result<T, WeftError>;
