//! Payload trait - キューに載せる引数の型
//!
//! # Trait Bounds
//! - `Serialize`: ストアの JSON 列に保存するため
//! - `DeserializeOwned`: ストアから復元するため（'static に対応）
//! - `Send + Sync + 'static`: worker task 間で move するため
//!
//! ストア側ではただの `serde_json::Value` で、エンジンは中身を見ません。
//! 型は `WorkQueue<T>` ごとに呼び出し側が決めます。

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::errors::Result;

pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

pub fn encode<T: Payload>(payload: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(payload)?)
}

pub fn decode<T: Payload>(value: &serde_json::Value) -> Result<T> {
    Ok(T::deserialize(value)?)
}
