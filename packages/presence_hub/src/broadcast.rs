//! Local Broadcaster
//!
//! Delivers an event to the connections on this instance only. Sends run
//! concurrently and each waits at most the send timeout for queue space. A
//! connection that stays full or has gone away is evicted: unregistered and
//! closed, so its socket task hangs up. Neither affects the others.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::metrics::ServerMetrics;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::ws::protocol::{Audience, ConnectionId, ServerMessage};

/// How long one delivery may wait for a full send queue.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Receivers whose queue stayed full past the send timeout.
    pub timed_out: Vec<ConnectionId>,
    /// Receivers that had gone away.
    pub failed: Vec<ConnectionId>,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.timed_out.len() + self.failed.len()
    }

    /// Connections removed as a result of this delivery.
    pub fn evicted(&self) -> impl Iterator<Item = &ConnectionId> {
        self.timed_out.iter().chain(self.failed.iter())
    }
}

enum Outcome {
    Delivered,
    TimedOut(ConnectionId),
    Failed(ConnectionId),
}

pub struct LocalBroadcaster {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<ServerMetrics>,
    send_timeout: Duration,
}

impl LocalBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            registry,
            metrics,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn broadcast(
        &self,
        audience: &Audience,
        msg: &ServerMessage,
        exclude: Option<&str>,
    ) -> DeliveryReport {
        match audience {
            Audience::All => self.broadcast_to_all(msg, exclude).await,
            Audience::Group(group) => self.broadcast_to_group(group, msg, exclude).await,
        }
    }

    pub async fn broadcast_to_group(
        &self,
        group: &str,
        msg: &ServerMessage,
        exclude: Option<&str>,
    ) -> DeliveryReport {
        let targets = self.registry.members_of(group).await;
        self.deliver(targets, msg, exclude).await
    }

    pub async fn broadcast_to_all(&self, msg: &ServerMessage, exclude: Option<&str>) -> DeliveryReport {
        let targets = self.registry.all().await;
        self.deliver(targets, msg, exclude).await
    }

    async fn deliver(
        &self,
        targets: Vec<ConnectionHandle>,
        msg: &ServerMessage,
        exclude: Option<&str>,
    ) -> DeliveryReport {
        let sends = targets
            .into_iter()
            .filter(|handle| exclude != Some(handle.id()))
            .map(|handle| self.deliver_one(handle, msg.clone()));

        let mut report = DeliveryReport::default();
        for outcome in join_all(sends).await {
            match outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::TimedOut(id) => report.timed_out.push(id),
                Outcome::Failed(id) => report.failed.push(id),
            }
        }

        for id in report.evicted() {
            self.registry.unregister(id).await;
        }

        report
    }

    async fn deliver_one(&self, handle: ConnectionHandle, msg: ServerMessage) -> Outcome {
        let event = msg.event_name();
        match handle.deliver(msg, self.send_timeout).await {
            Ok(()) => {
                self.metrics.message_sent();
                Outcome::Delivered
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.metrics.message_dropped();
                warn!(
                    connection = handle.id(),
                    subject = handle.subject(),
                    event,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "send queue stayed full, evicting slow connection"
                );
                Outcome::TimedOut(handle.id().to_string())
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.metrics.delivery_failed();
                debug!(connection = handle.id(), "connection gone during delivery");
                Outcome::Failed(handle.id().to_string())
            }
        }
    }
}
