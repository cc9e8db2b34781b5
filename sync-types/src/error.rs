//! Error types for roomsync value types.

use thiserror::Error;

/// Errors raised while encoding, decoding or validating room values.
#[derive(Debug, Error)]
pub enum RoomError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// An update does not satisfy the room schema
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// The room is at the highest representable version
    #[error("room version {0} cannot be incremented")]
    VersionExhausted(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = RoomError::InvalidUpdate("empty vote value".into());
        assert_eq!(err.to_string(), "invalid update: empty vote value");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RoomError>();
    }
}
