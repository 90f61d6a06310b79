use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FormatError, Result};
use crate::Formatter;

/// JSON formatter for any serde type.
pub struct JsonFormatter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFormatter<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonFormatter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonFormatter<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonFormatter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonFormatter")
    }
}

impl<T> Formatter<T> for JsonFormatter<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| FormatError::serialize("json", e))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(|e| FormatError::deserialize("json", e))
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
