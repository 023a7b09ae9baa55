//! Typed - 型付き payload / handler API
//!
//! # 二層構造
//! - **表層（Typed）**: `Payload`, `Handler<T>` - 型安全
//! - **内部**: ストアには `serde_json::Value` として保存（エンジンは中身を見ない）

pub mod handler;
pub mod payload;

pub use self::handler::{DelayedHandler, ExecutionContext, Handler};
pub use self::payload::Payload;
