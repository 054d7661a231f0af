//! Connection Registry
//!
//! Tracks live connections on this instance and which rooms they have
//! joined. Membership is kept in both directions (connection -> rooms and
//! room -> connections) under a single lock so the two views never drift.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::ws::protocol::{ConnectionId, GroupId, ServerMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
}

/// Delivery endpoint for one connection.
///
/// Cheap to clone; the broadcaster works on snapshots of these so the
/// registry lock is never held while delivering. Every handle of one
/// connection shares a close token: cancelling it tells the socket task to
/// hang up.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    subject: String,
    tx: mpsc::Sender<ServerMessage>,
    closer: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Authenticated subject bound at connect time.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Cancelled once the connection has been removed from the registry.
    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }

    fn close(&self) {
        self.closer.cancel();
    }

    /// Queue `msg`, waiting at most `timeout` for room in the send queue.
    pub(crate) async fn deliver(
        &self,
        msg: ServerMessage,
        timeout: Duration,
    ) -> Result<(), SendTimeoutError<ServerMessage>> {
        self.tx.send_timeout(msg, timeout).await
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    groups: HashSet<GroupId>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    groups: HashMap<GroupId, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn detach(&mut self, id: &str, group: &str) -> bool {
        let Some(members) = self.groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(id);
        if members.is_empty() {
            self.groups.remove(group);
        }
        removed
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Ids must be unique among live connections.
    pub async fn register(
        &self,
        id: ConnectionId,
        subject: String,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Result<ConnectionHandle, RegistryError> {
        let mut state = self.state.write().await;
        if state.connections.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }
        let handle = ConnectionHandle {
            id: id.clone(),
            subject,
            tx,
            closer: CancellationToken::new(),
        };
        state.connections.insert(
            id,
            ConnectionEntry {
                handle: handle.clone(),
                groups: HashSet::new(),
            },
        );
        Ok(handle)
    }

    /// Add `id` to `group`. Returns false if it was already a member.
    pub async fn join(&self, id: &str, group: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.write().await;
        let entry = state
            .connections
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if !entry.groups.insert(group.to_string()) {
            return Ok(false);
        }
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(id.to_string());
        Ok(true)
    }

    /// Remove `id` from `group`. Unknown connections and groups are a no-op.
    pub async fn leave(&self, id: &str, group: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.get_mut(id) else {
            return false;
        };
        if !entry.groups.remove(group) {
            return false;
        }
        state.detach(id, group)
    }

    /// Drop a connection and every membership it holds, and close it.
    pub async fn unregister(&self, id: &str) -> Option<ConnectionHandle> {
        let mut state = self.state.write().await;
        let entry = state.connections.remove(id)?;
        for group in &entry.groups {
            state.detach(id, group);
        }
        entry.handle.close();
        Some(entry.handle)
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionHandle> {
        let state = self.state.read().await;
        state.connections.get(id).map(|e| e.handle.clone())
    }

    /// Snapshot of the current members of `group`.
    pub async fn members_of(&self, group: &str) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        let Some(members) = state.groups.get(group) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| state.connections.get(id))
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Snapshot of every live connection.
    pub async fn all(&self) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        state
            .connections
            .values()
            .map(|e| e.handle.clone())
            .collect()
    }

    pub async fn groups_of(&self, id: &str) -> Vec<GroupId> {
        let state = self.state.read().await;
        let mut groups: Vec<GroupId> = state
            .connections
            .get(id)
            .map(|e| e.groups.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    pub async fn is_member(&self, id: &str, group: &str) -> bool {
        let state = self.state.read().await;
        state
            .groups
            .get(group)
            .is_some_and(|members| members.contains(id))
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn group_count(&self) -> usize {
        self.state.read().await.groups.len()
    }

    /// Close and forget every connection. Returns how many were dropped.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.write().await;
        let n = state.connections.len();
        for entry in state.connections.values() {
            entry.handle.close();
        }
        state.connections.clear();
        state.groups.clear();
        n
    }

    /// Both membership views agree and no group is empty.
    #[cfg(test)]
    async fn is_consistent(&self) -> bool {
        let state = self.state.read().await;
        let forward_ok = state.connections.iter().all(|(id, entry)| {
            entry
                .groups
                .iter()
                .all(|g| state.groups.get(g).is_some_and(|m| m.contains(id)))
        });
        let reverse_ok = state.groups.values().all(|members| {
            !members.is_empty()
                && members.iter().all(|id| state.connections.contains_key(id))
        });
        let reverse_exact = state.groups.iter().all(|(g, members)| {
            members
                .iter()
                .all(|id| state.connections.get(id).is_some_and(|e| e.groups.contains(g)))
        });
        forward_ok && reverse_ok && reverse_exact
    }
}
