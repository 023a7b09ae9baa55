//! Domain identifiers (strongly-typed IDs).
//!
//! すべての ID は ULID をベースにした `Id<T>` で表現します。
//! `T` は実行時には使わないマーカー型（PhantomData）で、
//! TaskId と LockSeed を取り違えるとコンパイルエラーになります。
//!
//! ## ULID を使う理由
//! - 分散生成可能: 複数ワーカーが同時に enqueue しても衝突しない
//! - 連番カウンタを使わないので、enqueue 同士が書き込み競合しない
//! - 時刻でソート可能: pending 一覧が作成順に並ぶ

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"task-", "seed-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Delayed task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Delayed {}

impl IdMarker for Delayed {
    fn prefix() -> &'static str {
        "delayed-"
    }
}

/// Lease 所有者のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Seed {}

impl IdMarker for Seed {
    fn prefix() -> &'static str {
        "seed-"
    }
}

/// Identifier of a task row (one unit of schedulable work).
pub type TaskId = Id<Task>;

/// Identifier of a delayed (fire-once) row.
pub type DelayedId = Id<Delayed>;

/// Token proving lease ownership. One per worker loop.
pub type LockSeed = Id<Seed>;
