//! Wire envelopes exchanged between execution contexts.
//!
//! A proxy context ships a [`StorageRequest`] to the owner context and the
//! owner answers with a [`StorageResponse`] echoing the same `requestId`.
//! The echo is the only correlation mechanism across the message boundary:
//! the channel itself gives no ordering or delivery guarantees.
//!
//! ```text
//! proxy                                   owner
//!   | -- {type, payload, requestId} -------> |
//!   | <------ {success, data|error, requestId} |
//! ```
//!
//! Storage traffic is recognized by the [`STORAGE_PREFIX`] on `type`; the
//! owner ignores everything else on the channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

/// Prefix shared by every storage request `type`.
pub const STORAGE_PREFIX: &str = "STORAGE_";

/// A request from a proxy context to the owner context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct StorageRequest {
    /// Operation name, always starting with [`STORAGE_PREFIX`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Operation arguments, absent for argument-less operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Correlation id, unique among the sender's in-flight requests.
    pub request_id: String,
}

impl StorageRequest {
    /// Whether `kind` names storage traffic.
    pub fn is_storage_kind(kind: &str) -> bool {
        kind.starts_with(STORAGE_PREFIX)
    }
}

/// The owner's answer to a [`StorageRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct StorageResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Operation result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error description on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The `requestId` of the request being answered.
    pub request_id: String,
}

impl StorageResponse {
    /// Build a successful response carrying `data`.
    pub fn ok(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            request_id: request_id.into(),
        }
    }

    /// Build a failed response carrying `error`.
    pub fn err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            request_id: request_id.into(),
        }
    }

    /// Split the response into its outcome.
    ///
    /// A successful response without `data` yields [`Value::Null`]. A failed
    /// response without an `error` string yields a generic message.
    pub fn into_outcome(self) -> Result<Value, String> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| String::from("storage request failed")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_wire_field_names() {
        let request = StorageRequest {
            kind: String::from("STORAGE_GET_ORGANISM"),
            payload: None,
            request_id: String::from("1700000000000-abc"),
        };
        let value = serde_json::to_value(&request).unwrap_or_default();
        assert_eq!(
            value,
            serde_json::json!({"type": "STORAGE_GET_ORGANISM", "requestId": "1700000000000-abc"})
        );
    }

    #[test]
    fn response_outcome() {
        let ok = StorageResponse::ok("r1", serde_json::json!(5));
        assert_eq!(ok.into_outcome(), Ok(serde_json::json!(5)));

        let err = StorageResponse::err("r2", "quota exceeded");
        assert_eq!(err.into_outcome(), Err(String::from("quota exceeded")));

        let bare = StorageResponse {
            success: false,
            data: None,
            error: None,
            request_id: String::from("r3"),
        };
        assert!(bare.into_outcome().is_err());
    }

    #[test]
    fn prefix_filter() {
        assert!(StorageRequest::is_storage_kind("STORAGE_PING"));
        assert!(!StorageRequest::is_storage_kind("ORGANISM_RENDER"));
        assert!(!StorageRequest::is_storage_kind("storage_ping"));
    }
}
