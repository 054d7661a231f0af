//! WebSocket Protocol Types
//!
//! Message types for client-server communication and the event payloads
//! that are fanned out locally and across instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::StatusRecord;

/// Locally unique id of a live connection.
pub type ConnectionId = String;

/// Room key. One user id maps to one room.
pub type GroupId = String;

/// A status change, as seen by every interested client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub subject_id: String,
    pub status: String,
    /// Human-readable name of the instance the change entered through.
    pub origin_instance: String,
    pub emitted_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(subject_id: String, status: String, origin_instance: String) -> Self {
        Self {
            subject_id,
            status,
            origin_instance,
            emitted_at: Utc::now(),
        }
    }
}

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum Audience {
    All,
    Group(GroupId),
}

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Join the room for `group_id`. Replaces any previous room.
    Join { group_id: GroupId },

    /// Set the status of this connection's subject.
    StatusUpdate { status: String },
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// First frame on every connection.
    Welcome {
        connection_id: ConnectionId,
        instance: String,
    },

    /// Acknowledges a join.
    Joined { group_id: GroupId },

    /// A data record was created through the HTTP API.
    NewData {
        record: StatusRecord,
        origin_instance: String,
    },

    /// A status was set through the HTTP API.
    StatusUpdate { subject_id: String, status: String },

    /// A status was set by a connected client.
    UserStatusChanged(StatusEvent),

    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Joined { .. } => "joined",
            Self::NewData { .. } => "newData",
            Self::StatusUpdate { .. } => "statusUpdate",
            Self::UserStatusChanged(_) => "userStatusChanged",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
