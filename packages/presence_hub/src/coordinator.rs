//! Presence Coordinator
//!
//! Glue between client actions and fanout. A [`PresenceSession`] tracks one
//! connection through `Connected -> Joined -> Disconnected`; every accepted
//! status change is persisted, delivered locally, and published to the other
//! instances. The HTTP API uses the same fanout path through
//! [`PresenceCoordinator::update_status`] and
//! [`PresenceCoordinator::create_record`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backplane::{BackplaneBridge, PublishOutcome};
use crate::broadcast::{DeliveryReport, LocalBroadcaster};
use crate::identity::InstanceIdentity;
use crate::metrics::ServerMetrics;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::store::{RecordStore, StatusRecord, StoreError};
use crate::ws::protocol::{
    Audience, ClientMessage, ConnectionId, GroupId, ServerMessage, StatusEvent,
};

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("connection is closed")]
    Disconnected,
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}

impl PresenceError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Registry(RegistryError::NotFound(_)) => "connection_not_found",
            Self::Registry(RegistryError::DuplicateConnection(_)) => "duplicate_connection",
            Self::Store(StoreError::AlreadyExists(_)) => "already_exists",
            Self::Store(StoreError::AccountExists(_)) => "account_exists",
            Self::Store(_) => "store_unavailable",
            Self::Disconnected => "disconnected",
            Self::EmptyField(_) => "invalid_request",
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::error(self.error_code(), self.to_string())
    }
}

/// Where one event went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub local: DeliveryReport,
    pub remote: PublishOutcome,
}

pub struct PresenceCoordinator {
    identity: Arc<InstanceIdentity>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<LocalBroadcaster>,
    bridge: Arc<BackplaneBridge>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<ServerMetrics>,
}

impl PresenceCoordinator {
    pub fn new(
        identity: Arc<InstanceIdentity>,
        broadcaster: Arc<LocalBroadcaster>,
        bridge: Arc<BackplaneBridge>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            identity,
            registry: broadcaster.registry().clone(),
            broadcaster,
            bridge,
            store,
            metrics,
        }
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new connection and return its session.
    pub async fn connect(
        self: &Arc<Self>,
        subject: String,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Result<PresenceSession, PresenceError> {
        let connection_id = Uuid::new_v4().to_string();
        let handle = self
            .registry
            .register(connection_id.clone(), subject.clone(), tx)
            .await?;
        info!(connection = %connection_id, subject = %subject, "connection registered");
        Ok(PresenceSession {
            coordinator: self.clone(),
            connection_id,
            subject,
            closed: handle.close_token(),
            state: SessionState::Connected,
        })
    }

    /// Status change from the HTTP API. Fanned out even if persisting fails;
    /// the store error is still returned to the caller.
    pub async fn update_status(
        &self,
        subject_id: &str,
        status: &str,
    ) -> Result<StatusRecord, PresenceError> {
        if status.trim().is_empty() {
            return Err(PresenceError::EmptyField("status"));
        }
        let persisted = self.persist_status(subject_id, status).await;
        self.metrics.status_updated();

        let event = ServerMessage::StatusUpdate {
            subject_id: subject_id.to_string(),
            status: status.to_string(),
        };
        self.fanout(Audience::Group(subject_id.to_string()), event, None)
            .await;
        Ok(persisted?)
    }

    /// Create the subject's data record and announce it to everyone.
    pub async fn create_record(
        &self,
        subject_id: &str,
        content: &str,
    ) -> Result<StatusRecord, PresenceError> {
        let record = self.store.create_record(subject_id, content).await?;
        let event = ServerMessage::NewData {
            record: record.clone(),
            origin_instance: self.identity.name.clone(),
        };
        self.fanout(Audience::All, event, None).await;
        Ok(record)
    }

    pub async fn records_for(&self, subject_id: &str) -> Result<Vec<StatusRecord>, PresenceError> {
        Ok(self
            .store
            .find_by_subject(subject_id)
            .await?
            .into_iter()
            .collect())
    }

    async fn persist_status(&self, subject_id: &str, status: &str) -> Result<StatusRecord, StoreError> {
        let persisted = self.store.upsert_status(subject_id, status).await;
        if let Err(e) = &persisted {
            self.metrics.store_error();
            warn!(subject = subject_id, error = %e, "failed to persist status; broadcasting anyway");
        }
        persisted
    }

    /// Deliver locally and hand to the backplane. The two halves are
    /// independent: a backplane outage never blocks local delivery.
    async fn fanout(
        &self,
        audience: Audience,
        event: ServerMessage,
        exclude: Option<&str>,
    ) -> FanoutReport {
        let local = self.broadcaster.broadcast(&audience, &event, exclude).await;
        let remote = self.bridge.publish(audience, event);
        FanoutReport { local, remote }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Joined(GroupId),
    Disconnected,
}

/// One live connection as seen by the coordinator.
///
/// The subject comes from the connection's token and never changes; joining a
/// room only chooses whose updates the connection watches.
pub struct PresenceSession {
    coordinator: Arc<PresenceCoordinator>,
    connection_id: ConnectionId,
    subject: String,
    closed: CancellationToken,
    state: SessionState,
}

impl PresenceSession {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Cancelled when the registry drops this connection, e.g. after it was
    /// evicted as a slow consumer or the instance is shutting down.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Apply one client message. Returns the direct reply, if any.
    pub async fn handle(&mut self, msg: ClientMessage) -> Result<Option<ServerMessage>, PresenceError> {
        match msg {
            ClientMessage::Join { group_id } => {
                self.join(&group_id).await?;
                Ok(Some(ServerMessage::Joined { group_id }))
            }
            ClientMessage::StatusUpdate { status } => {
                self.status_update(&status).await?;
                Ok(None)
            }
        }
    }

    /// Enter `group`, leaving the previous room if there was one.
    pub async fn join(&mut self, group: &str) -> Result<(), PresenceError> {
        if group.trim().is_empty() {
            return Err(PresenceError::EmptyField("groupId"));
        }
        let registry = &self.coordinator.registry;
        match &self.state {
            SessionState::Disconnected => return Err(PresenceError::Disconnected),
            SessionState::Joined(current) if current == group => return Ok(()),
            SessionState::Joined(current) => {
                registry.leave(&self.connection_id, current).await;
            }
            SessionState::Connected => {}
        }
        registry.join(&self.connection_id, group).await?;
        debug!(connection = %self.connection_id, group, "joined room");
        self.state = SessionState::Joined(group.to_string());
        Ok(())
    }

    /// Persist and fan out a status for this connection's subject.
    ///
    /// The sender's own connection is excluded from the local delivery. A
    /// store failure is returned, but only after the fanout has happened.
    pub async fn status_update(&mut self, status: &str) -> Result<FanoutReport, PresenceError> {
        if status.trim().is_empty() {
            return Err(PresenceError::EmptyField("status"));
        }
        if self.state == SessionState::Disconnected {
            return Err(PresenceError::Disconnected);
        }
        let subject = self.subject.clone();
        let coordinator = &self.coordinator;

        let persisted = coordinator.persist_status(&subject, status).await;
        coordinator.metrics.status_updated();

        let event = ServerMessage::UserStatusChanged(StatusEvent::new(
            subject.clone(),
            status.to_string(),
            coordinator.identity.name.clone(),
        ));
        let report = coordinator
            .fanout(Audience::Group(subject), event, Some(&self.connection_id))
            .await;

        persisted?;
        Ok(report)
    }

    /// Remove every trace of this connection. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.coordinator.registry.unregister(&self.connection_id).await;
        self.state = SessionState::Disconnected;
        info!(connection = %self.connection_id, "connection unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::{BridgeConfig, MemoryBackplane};
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        coordinator: Arc<PresenceCoordinator>,
        store: Arc<MemoryStore>,
    }

    async fn fixture() -> Fixture {
        let bus = MemoryBackplane::new();
        let metrics = Arc::new(ServerMetrics::new());
        let identity = Arc::new(InstanceIdentity::new("node-a"));
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(LocalBroadcaster::new(registry, metrics.clone()));
        let bridge = BackplaneBridge::start(
            Arc::new(bus),
            identity.clone(),
            broadcaster.clone(),
            metrics.clone(),
            BridgeConfig::default(),
        );
        assert!(bridge.wait_ready(Duration::from_secs(2)).await);
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(PresenceCoordinator::new(
            identity,
            broadcaster,
            bridge,
            store.clone(),
            metrics,
        ));
        Fixture { coordinator, store }
    }

    #[tokio::test]
    async fn join_then_rejoin_moves_rooms() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut session = f.coordinator.connect("u1".into(), tx).await.unwrap();
        assert_eq!(session.state(), &SessionState::Connected);

        session.join("a").await.unwrap();
        session.join("b").await.unwrap();
        assert_eq!(session.state(), &SessionState::Joined("b".into()));
        assert_eq!(
            f.coordinator.registry().groups_of(session.connection_id()).await,
            vec!["b"]
        );
    }

    #[tokio::test]
    async fn status_before_join_applies_to_own_subject() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut session = f.coordinator.connect("u5".into(), tx).await.unwrap();
        session.status_update("online").await.unwrap();
        assert_eq!(
            f.store.find_by_subject("u5").await.unwrap().unwrap().status,
            "online"
        );
    }

    #[tokio::test]
    async fn status_reaches_room_but_not_sender() {
        let f = fixture().await;
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let mut a = f.coordinator.connect("u42".into(), tx_a).await.unwrap();
        let mut b = f.coordinator.connect("u7".into(), tx_b).await.unwrap();
        a.join("u42").await.unwrap();
        b.join("u42").await.unwrap();

        let report = a.status_update("online").await.unwrap();
        assert_eq!(report.local.delivered, 1);
        assert_eq!(report.remote, PublishOutcome::Queued);
        assert!(rx_a.try_recv().is_err());
        match rx_b.try_recv().unwrap() {
            ServerMessage::UserStatusChanged(ev) => {
                assert_eq!(ev.subject_id, "u42");
                assert_eq!(ev.status, "online");
                assert_eq!(ev.origin_instance, "node-a");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            f.store.find_by_subject("u42").await.unwrap().unwrap().status,
            "online"
        );
    }

    #[tokio::test]
    async fn joining_a_room_never_changes_whose_status_is_written() {
        let f = fixture().await;
        f.store.upsert_status("victim", "online").await.unwrap();
        let (tx_victim, mut rx_victim) = mpsc::channel(8);
        let (tx, _rx) = mpsc::channel(8);
        let mut watcher = f.coordinator.connect("victim".into(), tx_victim).await.unwrap();
        watcher.join("victim").await.unwrap();

        let mut session = f.coordinator.connect("u7".into(), tx).await.unwrap();
        session.join("victim").await.unwrap();
        session.status_update("hacked").await.unwrap();

        assert_eq!(
            f.store.find_by_subject("victim").await.unwrap().unwrap().status,
            "online"
        );
        assert_eq!(
            f.store.find_by_subject("u7").await.unwrap().unwrap().status,
            "hacked"
        );
        // u7's update goes to u7's room, not the one it is watching.
        assert!(rx_victim.try_recv().is_err());
    }

    #[tokio::test]
    async fn eviction_closes_the_session() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let session = f.coordinator.connect("u1".into(), tx).await.unwrap();
        let closed = session.close_token();
        assert!(!closed.is_cancelled());

        f.coordinator.registry().unregister(session.connection_id()).await;
        assert!(closed.is_cancelled());
    }

    #[tokio::test]
    async fn handle_join_replies() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut session = f.coordinator.connect("u1".into(), tx).await.unwrap();
        let reply = session
            .handle(ClientMessage::Join {
                group_id: "u1".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            Some(ServerMessage::Joined {
                group_id: "u1".into()
            })
        );
        let reply = session
            .handle(ClientMessage::StatusUpdate {
                status: "away".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_final() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut session = f.coordinator.connect("u1".into(), tx).await.unwrap();
        session.join("u1").await.unwrap();
        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.state(), &SessionState::Disconnected);
        assert_eq!(f.coordinator.registry().connection_count().await, 0);
        assert!(matches!(
            session.join("u1").await,
            Err(PresenceError::Disconnected)
        ));
        assert!(matches!(
            session.status_update("x").await,
            Err(PresenceError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn empty_values_rejected() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut session = f.coordinator.connect("u1".into(), tx).await.unwrap();
        assert!(matches!(
            session.join("  ").await,
            Err(PresenceError::EmptyField("groupId"))
        ));
        session.join("u1").await.unwrap();
        assert!(matches!(
            session.status_update("").await,
            Err(PresenceError::EmptyField("status"))
        ));
    }

    #[tokio::test]
    async fn create_record_announces_to_everyone() {
        let f = fixture().await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let _s1 = f.coordinator.connect("u1".into(), tx1).await.unwrap();
        let _s2 = f.coordinator.connect("u2".into(), tx2).await.unwrap();

        let record = f.coordinator.create_record("u1", "hello").await.unwrap();
        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                ServerMessage::NewData { record: r, origin_instance } => {
                    assert_eq!(r, record);
                    assert_eq!(origin_instance, "node-a");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        // A second create is refused and announces nothing.
        assert!(matches!(
            f.coordinator.create_record("u1", "again").await,
            Err(PresenceError::Store(StoreError::AlreadyExists(_)))
        ));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn http_update_reaches_room() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = f.coordinator.connect("u3".into(), tx).await.unwrap();
        session.join("u9").await.unwrap();

        let record = f.coordinator.update_status("u9", "online").await.unwrap();
        assert_eq!(record.status, "online");
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::StatusUpdate {
                subject_id: "u9".into(),
                status: "online".into()
            }
        );
        assert_eq!(
            f.coordinator.records_for("u9").await.unwrap(),
            vec![record]
        );
        assert!(f.coordinator.records_for("nobody").await.unwrap().is_empty());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(PresenceError::Disconnected.error_code(), "disconnected");
        assert_eq!(
            PresenceError::Store(StoreError::Unavailable("x".into())).error_code(),
            "store_unavailable"
        );
        match PresenceError::EmptyField("status").to_message() {
            ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_request"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
