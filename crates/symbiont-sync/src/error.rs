//! Error types for the storage coordinator.
//!
//! [`StorageError`] is what every coordinator and debouncer call surfaces.
//! It is `Clone` because one physical write can settle several
//! [`crate::WriteTicket`]s at once, and it carries only strings so it can
//! be rebuilt on the far side of the message channel.

use symbiont_store::StoreError;
use symbiont_types::CommandError;

/// Errors surfaced by the storage coordinator and the write debouncer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The owner's storage engine rejected the operation.
    #[error("storage engine error: {message}")]
    Engine {
        /// The engine's description of the failure.
        message: String,
    },

    /// The message channel could not deliver the request.
    #[error("channel error: {message}")]
    Channel {
        /// Why delivery failed.
        message: String,
    },

    /// No response arrived within the request timeout.
    #[error("storage request {request_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// The request that went unanswered.
        request_id: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The owner does not recognize the requested operation.
    #[error("unknown storage request type: {kind}")]
    UnknownRequest {
        /// The unrecognized `type`.
        kind: String,
    },

    /// The request envelope or its payload is malformed.
    #[error("invalid storage request: {message}")]
    InvalidRequest {
        /// Parser diagnostics.
        message: String,
    },

    /// The owner answered with a failure.
    #[error("{message}")]
    Remote {
        /// The `error` string of the response.
        message: String,
    },

    /// A value could not be converted to or from JSON.
    #[error("serialization error: {message}")]
    Serialization {
        /// Serializer diagnostics.
        message: String,
    },

    /// Another context already owns the database.
    #[error("another context already owns the database (instance {instance_id})")]
    OwnerConflict {
        /// Instance id reported by the existing owner.
        instance_id: String,
    },

    /// The coordinator or debouncer was closed.
    #[error("storage coordinator is closed")]
    Closed,
}

impl From<StoreError> for StorageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Closed => Self::Closed,
            other => Self::Engine {
                message: other.to_string(),
            },
        }
    }
}

impl From<CommandError> for StorageError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Unknown { kind } => Self::UnknownRequest { kind },
            invalid @ CommandError::InvalidPayload { .. } => Self::InvalidRequest {
                message: invalid.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_maps_to_unknown_request() {
        let err = StorageError::from(CommandError::Unknown {
            kind: String::from("STORAGE_DANCE"),
        });
        assert_eq!(
            err.to_string(),
            "unknown storage request type: STORAGE_DANCE"
        );
    }

    #[test]
    fn closed_store_maps_to_closed() {
        assert_eq!(StorageError::from(StoreError::Closed), StorageError::Closed);
    }

    #[test]
    fn remote_error_is_transparent() {
        let err = StorageError::Remote {
            message: String::from("invitations already contains ABC"),
        };
        assert_eq!(err.to_string(), "invitations already contains ABC");
    }
}
