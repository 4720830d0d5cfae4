//! Typed storage operations carried inside [`StorageRequest`] envelopes.
//!
//! [`StorageCommand`] mirrors the storage engine contract one variant per
//! operation. On the wire it is flattened into the envelope's `type` and
//! `payload` fields, so the same JSON shape is produced by the Rust proxy
//! and by the extension's `TypeScript` code.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::StorageRequest;
use crate::ids::OrganismId;
use crate::records::{BehaviorRecord, Invitation, InvitationUpdate, Mutation, Organism};

/// Wire names of every storage operation.
pub mod kinds {
    /// Read an organism by id, or the most recently updated one.
    pub const GET_ORGANISM: &str = "STORAGE_GET_ORGANISM";
    /// Insert or replace an organism.
    pub const SAVE_ORGANISM: &str = "STORAGE_SAVE_ORGANISM";
    /// Read the behavior record of a URL.
    pub const GET_BEHAVIOR: &str = "STORAGE_GET_BEHAVIOR";
    /// Insert or replace a behavior record.
    pub const SAVE_BEHAVIOR: &str = "STORAGE_SAVE_BEHAVIOR";
    /// Append to the mutation log.
    pub const ADD_MUTATION: &str = "STORAGE_ADD_MUTATION";
    /// Read the newest mutation log entries.
    pub const GET_RECENT_MUTATIONS: &str = "STORAGE_GET_RECENT_MUTATIONS";
    /// Read a setting with a fallback.
    pub const GET_SETTING: &str = "STORAGE_GET_SETTING";
    /// Write a setting.
    pub const SET_SETTING: &str = "STORAGE_SET_SETTING";
    /// Store a new invitation.
    pub const ADD_INVITATION: &str = "STORAGE_ADD_INVITATION";
    /// Patch an existing invitation.
    pub const UPDATE_INVITATION: &str = "STORAGE_UPDATE_INVITATION";
    /// Read an invitation by code.
    pub const GET_INVITATION: &str = "STORAGE_GET_INVITATION";
    /// Read every invitation.
    pub const GET_ALL_INVITATIONS: &str = "STORAGE_GET_ALL_INVITATIONS";
    /// Aggregate behavior per domain.
    pub const GET_BEHAVIOR_PATTERNS: &str = "STORAGE_GET_BEHAVIOR_PATTERNS";
    /// Read behavior and mutations from a trailing window.
    pub const GET_RECENT_ACTIVITY: &str = "STORAGE_GET_RECENT_ACTIVITY";
    /// Apply the retention policy.
    pub const CLEANUP: &str = "STORAGE_CLEANUP";
    /// Read record counts and size.
    pub const GET_STORAGE_STATS: &str = "STORAGE_GET_STORAGE_STATS";
    /// Ask the owner to identify itself.
    pub const PING: &str = "STORAGE_PING";

    /// Operations that take no arguments.
    pub const UNIT: [&str; 4] = [
        GET_ALL_INVITATIONS,
        GET_BEHAVIOR_PATTERNS,
        GET_STORAGE_STATS,
        PING,
    ];

    /// Every known operation name.
    pub const ALL: [&str; 17] = [
        GET_ORGANISM,
        SAVE_ORGANISM,
        GET_BEHAVIOR,
        SAVE_BEHAVIOR,
        ADD_MUTATION,
        GET_RECENT_MUTATIONS,
        GET_SETTING,
        SET_SETTING,
        ADD_INVITATION,
        UPDATE_INVITATION,
        GET_INVITATION,
        GET_ALL_INVITATIONS,
        GET_BEHAVIOR_PATTERNS,
        GET_RECENT_ACTIVITY,
        CLEANUP,
        GET_STORAGE_STATS,
        PING,
    ];
}

/// Reasons a request envelope cannot be turned into a [`StorageCommand`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The `type` carries the storage prefix but names no known operation.
    #[error("unknown storage request type: {kind}")]
    Unknown {
        /// The unrecognized `type`.
        kind: String,
    },

    /// The `type` is known but the payload does not match its arguments.
    #[error("invalid payload for {kind}: {message}")]
    InvalidPayload {
        /// The operation whose payload failed to parse.
        kind: String,
        /// Parser diagnostics.
        message: String,
    },
}

/// A storage operation and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum StorageCommand {
    /// See [`kinds::GET_ORGANISM`].
    #[serde(rename = "STORAGE_GET_ORGANISM")]
    GetOrganism {
        /// Organism to read; `None` selects the most recently updated one.
        #[serde(default)]
        id: Option<OrganismId>,
    },
    /// See [`kinds::SAVE_ORGANISM`].
    #[serde(rename = "STORAGE_SAVE_ORGANISM")]
    SaveOrganism(Box<Organism>),
    /// See [`kinds::GET_BEHAVIOR`].
    #[serde(rename = "STORAGE_GET_BEHAVIOR")]
    GetBehavior {
        /// URL whose record to read.
        url: String,
    },
    /// See [`kinds::SAVE_BEHAVIOR`].
    #[serde(rename = "STORAGE_SAVE_BEHAVIOR")]
    SaveBehavior(Box<BehaviorRecord>),
    /// See [`kinds::ADD_MUTATION`].
    #[serde(rename = "STORAGE_ADD_MUTATION")]
    AddMutation(Box<Mutation>),
    /// See [`kinds::GET_RECENT_MUTATIONS`].
    #[serde(rename = "STORAGE_GET_RECENT_MUTATIONS")]
    GetRecentMutations {
        /// Maximum number of entries to return.
        limit: usize,
    },
    /// See [`kinds::GET_SETTING`].
    #[serde(rename = "STORAGE_GET_SETTING")]
    GetSetting {
        /// Setting name.
        key: String,
        /// Value returned when the setting is absent.
        #[serde(default)]
        default_value: Value,
    },
    /// See [`kinds::SET_SETTING`].
    #[serde(rename = "STORAGE_SET_SETTING")]
    SetSetting {
        /// Setting name.
        key: String,
        /// New value.
        value: Value,
    },
    /// See [`kinds::ADD_INVITATION`].
    #[serde(rename = "STORAGE_ADD_INVITATION")]
    AddInvitation(Box<Invitation>),
    /// See [`kinds::UPDATE_INVITATION`].
    #[serde(rename = "STORAGE_UPDATE_INVITATION")]
    UpdateInvitation {
        /// Code of the invitation to patch.
        code: String,
        /// Fields to change.
        update: InvitationUpdate,
    },
    /// See [`kinds::GET_INVITATION`].
    #[serde(rename = "STORAGE_GET_INVITATION")]
    GetInvitation {
        /// Invitation code.
        code: String,
    },
    /// See [`kinds::GET_ALL_INVITATIONS`].
    #[serde(rename = "STORAGE_GET_ALL_INVITATIONS")]
    GetAllInvitations,
    /// See [`kinds::GET_BEHAVIOR_PATTERNS`].
    #[serde(rename = "STORAGE_GET_BEHAVIOR_PATTERNS")]
    GetBehaviorPatterns,
    /// See [`kinds::GET_RECENT_ACTIVITY`].
    #[serde(rename = "STORAGE_GET_RECENT_ACTIVITY")]
    GetRecentActivity {
        /// Window length in milliseconds.
        period_ms: u64,
    },
    /// See [`kinds::CLEANUP`].
    #[serde(rename = "STORAGE_CLEANUP")]
    Cleanup {
        /// Records older than this many days are removed.
        retention_days: u32,
    },
    /// See [`kinds::GET_STORAGE_STATS`].
    #[serde(rename = "STORAGE_GET_STORAGE_STATS")]
    GetStorageStats,
    /// See [`kinds::PING`].
    #[serde(rename = "STORAGE_PING")]
    Ping,
}

impl StorageCommand {
    /// The wire `type` of this command.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::GetOrganism { .. } => kinds::GET_ORGANISM,
            Self::SaveOrganism(_) => kinds::SAVE_ORGANISM,
            Self::GetBehavior { .. } => kinds::GET_BEHAVIOR,
            Self::SaveBehavior(_) => kinds::SAVE_BEHAVIOR,
            Self::AddMutation(_) => kinds::ADD_MUTATION,
            Self::GetRecentMutations { .. } => kinds::GET_RECENT_MUTATIONS,
            Self::GetSetting { .. } => kinds::GET_SETTING,
            Self::SetSetting { .. } => kinds::SET_SETTING,
            Self::AddInvitation(_) => kinds::ADD_INVITATION,
            Self::UpdateInvitation { .. } => kinds::UPDATE_INVITATION,
            Self::GetInvitation { .. } => kinds::GET_INVITATION,
            Self::GetAllInvitations => kinds::GET_ALL_INVITATIONS,
            Self::GetBehaviorPatterns => kinds::GET_BEHAVIOR_PATTERNS,
            Self::GetRecentActivity { .. } => kinds::GET_RECENT_ACTIVITY,
            Self::Cleanup { .. } => kinds::CLEANUP,
            Self::GetStorageStats => kinds::GET_STORAGE_STATS,
            Self::Ping => kinds::PING,
        }
    }

    /// Whether the command changes stored state.
    pub const fn is_write(&self) -> bool {
        matches!(
            self,
            Self::SaveOrganism(_)
                | Self::SaveBehavior(_)
                | Self::AddMutation(_)
                | Self::SetSetting { .. }
                | Self::AddInvitation(_)
                | Self::UpdateInvitation { .. }
                | Self::Cleanup { .. }
        )
    }

    /// Wrap the command into a request envelope tagged with `request_id`.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if an argument cannot be encoded as JSON.
    pub fn into_request(
        self,
        request_id: impl Into<String>,
    ) -> Result<StorageRequest, serde_json::Error> {
        let kind = self.kind().to_owned();
        let payload = match serde_json::to_value(self)? {
            Value::Object(mut fields) => fields.remove("payload"),
            _ => None,
        };
        Ok(StorageRequest {
            kind,
            payload,
            request_id: request_id.into(),
        })
    }

    /// Recover the command carried by a request envelope.
    pub fn from_request(request: &StorageRequest) -> Result<Self, CommandError> {
        if !kinds::ALL.contains(&request.kind.as_str()) {
            return Err(CommandError::Unknown {
                kind: request.kind.clone(),
            });
        }

        let mut tagged = Map::new();
        tagged.insert(String::from("type"), Value::String(request.kind.clone()));
        let unit = kinds::UNIT.contains(&request.kind.as_str());
        match &request.payload {
            // Argument-less operations take no payload, and an empty object
            // counts as none. The rest treat a missing payload as `{}`.
            None | Some(Value::Null) => {
                if !unit {
                    tagged.insert(String::from("payload"), Value::Object(Map::new()));
                }
            }
            Some(Value::Object(fields)) if unit && fields.is_empty() => {}
            Some(payload) => {
                tagged.insert(String::from("payload"), payload.clone());
            }
        }

        serde_json::from_value(Value::Object(tagged)).map_err(|e| CommandError::InvalidPayload {
            kind: request.kind.clone(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn kinds_carry_storage_prefix() {
        for kind in kinds::ALL {
            assert!(StorageRequest::is_storage_kind(kind), "{kind}");
        }
    }

    #[test]
    fn payload_shape_for_setting() {
        let request = StorageCommand::GetSetting {
            key: String::from("theme"),
            default_value: serde_json::json!("dark"),
        }
        .into_request("r1")
        .unwrap();
        assert_eq!(request.kind, kinds::GET_SETTING);
        assert_eq!(
            request.payload,
            Some(serde_json::json!({"key": "theme", "defaultValue": "dark"}))
        );
    }

    #[test]
    fn unit_commands_have_no_payload() {
        let request = StorageCommand::GetStorageStats.into_request("r2").unwrap();
        assert_eq!(request.payload, None);
        let decoded = StorageCommand::from_request(&request).unwrap();
        assert_eq!(decoded, StorageCommand::GetStorageStats);
    }

    #[test]
    fn unit_commands_accept_an_empty_payload_object() {
        for kind in [kinds::PING, kinds::GET_ALL_INVITATIONS] {
            let request = StorageRequest {
                kind: String::from(kind),
                payload: Some(serde_json::json!({})),
                request_id: String::from("r8"),
            };
            let command = StorageCommand::from_request(&request).unwrap();
            assert_eq!(command.kind(), kind);
        }

        let request = StorageRequest {
            kind: String::from(kinds::PING),
            payload: Some(serde_json::json!({"extra": true})),
            request_id: String::from("r9"),
        };
        assert!(matches!(
            StorageCommand::from_request(&request),
            Err(CommandError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn organism_command_survives_the_wire() {
        let organism = Organism::new("Blob");
        let request = StorageCommand::SaveOrganism(Box::new(organism.clone()))
            .into_request("r3")
            .unwrap();
        let wire = serde_json::to_string(&request).unwrap();
        let parsed: StorageRequest = serde_json::from_str(&wire).unwrap();
        match StorageCommand::from_request(&parsed).unwrap() {
            StorageCommand::SaveOrganism(decoded) => assert_eq!(*decoded, organism),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let request = StorageRequest {
            kind: String::from("STORAGE_DROP_EVERYTHING"),
            payload: None,
            request_id: String::from("r4"),
        };
        assert_eq!(
            StorageCommand::from_request(&request),
            Err(CommandError::Unknown {
                kind: String::from("STORAGE_DROP_EVERYTHING")
            })
        );
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let request = StorageRequest {
            kind: String::from(kinds::GET_RECENT_MUTATIONS),
            payload: Some(serde_json::json!({"limit": "ten"})),
            request_id: String::from("r5"),
        };
        assert!(matches!(
            StorageCommand::from_request(&request),
            Err(CommandError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn missing_payload_defaults_optional_arguments() {
        let request = StorageRequest {
            kind: String::from(kinds::GET_ORGANISM),
            payload: None,
            request_id: String::from("r6"),
        };
        assert_eq!(
            StorageCommand::from_request(&request),
            Ok(StorageCommand::GetOrganism { id: None })
        );

        let request = StorageRequest {
            kind: String::from(kinds::GET_BEHAVIOR),
            payload: None,
            request_id: String::from("r7"),
        };
        assert!(matches!(
            StorageCommand::from_request(&request),
            Err(CommandError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn write_classification() {
        assert!(StorageCommand::Cleanup { retention_days: 30 }.is_write());
        assert!(!StorageCommand::Ping.is_write());
        assert!(!StorageCommand::GetOrganism { id: None }.is_write());
    }
}
