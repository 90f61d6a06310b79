use bytes::Bytes;

use crate::error::Result;
use crate::Formatter;

/// Pass-through formatter: the payload is the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFormatter;

impl Formatter<Bytes> for RawFormatter {
    fn serialize(&self, value: &Bytes) -> Result<Bytes> {
        Ok(value.clone())
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}

impl Formatter<Vec<u8>> for RawFormatter {
    fn serialize(&self, value: &Vec<u8>) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(value))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn name(&self) -> &'static str {
        "raw"
    }
}
