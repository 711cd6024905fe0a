//! Bincode helpers for the durable records (pending blocks and per-height
//! block indexes). Round trips are bit-identical, which is all the storage
//! layer requires of the codec.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("in-memory serialization should not fail")
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
