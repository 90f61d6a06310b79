/// Errors raised by a [`Formatter`](crate::Formatter).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The value could not be encoded.
    #[error("{format} serialization failed: {message}")]
    Serialize {
        format: &'static str,
        message: String,
    },

    /// The payload could not be decoded.
    #[error("{format} deserialization failed: {message}")]
    Deserialize {
        format: &'static str,
        message: String,
    },
}

impl FormatError {
    pub fn serialize(format: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Serialize {
            format,
            message: err.to_string(),
        }
    }

    pub fn deserialize(format: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Deserialize {
            format,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FormatError>;
