//! Backplane Bridge
//!
//! Owns the publish and subscribe links to the backplane. Outbound events go
//! through a bounded queue drained by the publisher task, so callers never
//! wait on the network. Inbound envelopes are filtered (own echoes and
//! repeats are dropped) and handed to the local broadcaster.
//!
//! Either link may drop at any time. Each task reconnects on its own with
//! capped exponential backoff and reports its state through a `watch`
//! channel that doubles as the readiness gate.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedup::RecentIds;
use super::{Backplane, BackplaneError, Envelope, Publisher};
use crate::broadcast::{DeliveryReport, LocalBroadcaster};
use crate::identity::InstanceIdentity;
use crate::metrics::ServerMetrics;
use crate::ws::protocol::{Audience, ServerMessage};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub channel: String,
    /// Longest a single PUBLISH may take before the link is treated as dead.
    pub publish_timeout: Duration,
    pub outbound_capacity: usize,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub dedup_window: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel: "presence:events".to_string(),
            publish_timeout: Duration::from_millis(500),
            outbound_capacity: 1024,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            dedup_window: 4096,
        }
    }
}

impl BridgeConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(6);
        self.reconnect_base_delay
            .saturating_mul(1u32 << exp)
            .min(self.reconnect_max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Stopped,
}

/// State of both backplane links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LinkStatus {
    pub publisher: LinkState,
    pub subscriber: LinkState,
}

impl LinkStatus {
    /// Both links up: events flow in both directions.
    pub fn is_ready(&self) -> bool {
        self.publisher == LinkState::Connected && self.subscriber == LinkState::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Queued,
    /// Link down or queue full. Remote instances miss this event.
    Dropped,
}

/// What happened to one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Delivered(DeliveryReport),
    SelfEcho,
    Duplicate,
    Undecodable,
}

pub struct BackplaneBridge {
    identity: Arc<InstanceIdentity>,
    outbound: mpsc::Sender<Envelope>,
    status: watch::Receiver<LinkStatus>,
    metrics: Arc<ServerMetrics>,
    cancel: CancellationToken,
}

impl BackplaneBridge {
    /// Spawn the publisher and subscriber tasks. Returns immediately; use
    /// [`wait_ready`](Self::wait_ready) to gate on both links being up.
    pub fn start(
        backplane: Arc<dyn Backplane>,
        identity: Arc<InstanceIdentity>,
        broadcaster: Arc<LocalBroadcaster>,
        metrics: Arc<ServerMetrics>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let status_tx = Arc::new(status_tx);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let cancel = CancellationToken::new();

        tokio::spawn(run_publisher(
            backplane.clone(),
            outbound_rx,
            status_tx.clone(),
            config.clone(),
            metrics.clone(),
            cancel.clone(),
        ));

        let inbound = Inbound {
            identity: identity.clone(),
            broadcaster,
            metrics: metrics.clone(),
            recent: RecentIds::new(config.dedup_window),
        };
        tokio::spawn(run_subscriber(
            backplane,
            inbound,
            status_tx,
            config,
            metrics.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            identity,
            outbound: outbound_tx,
            status: status_rx,
            metrics,
            cancel,
        })
    }

    /// Queue `event` for the other instances. Never blocks.
    ///
    /// Only queued while both links are up. A lost subscription usually
    /// means the publish link is gone too, it just has not failed a write
    /// yet.
    pub fn publish(&self, audience: Audience, event: ServerMessage) -> PublishOutcome {
        let status = *self.status.borrow();
        if !status.is_ready() {
            self.metrics.backplane_publish_dropped();
            debug!(
                event = event.event_name(),
                ?status,
                "backplane not ready, event stays local"
            );
            return PublishOutcome::Dropped;
        }

        let envelope = Envelope::new(self.identity.id, audience, event);
        match self.outbound.try_send(envelope) {
            Ok(()) => PublishOutcome::Queued,
            Err(e) => {
                self.metrics.backplane_publish_dropped();
                warn!(error = %e, "backplane outbound queue rejected event");
                PublishOutcome::Dropped
            }
        }
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.status().is_ready()
    }

    /// Wait until both links are up. False if `timeout` passes first.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        matches!(
            tokio::time::timeout(timeout, status.wait_for(|s| s.is_ready())).await,
            Ok(Ok(_))
        )
    }

    /// Stop both tasks. Queued outbound events are discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BackplaneBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sleep for the backoff of `attempt`. False if cancelled meanwhile.
async fn backoff(config: &BridgeConfig, attempt: u32, cancel: &CancellationToken) -> bool {
    let delay = config.backoff(attempt);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_publisher(
    backplane: Arc<dyn Backplane>,
    mut outbound: mpsc::Receiver<Envelope>,
    status: Arc<watch::Sender<LinkStatus>>,
    config: BridgeConfig,
    metrics: Arc<ServerMetrics>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;

    'outer: loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            opened = backplane.publisher() => opened,
        };

        let mut publisher = match opened {
            Ok(p) => p,
            Err(e) => {
                attempt += 1;
                status.send_modify(|s| s.publisher = LinkState::Reconnecting { attempt });
                warn!(error = %e, attempt, "backplane publish link unavailable");
                if !backoff(&config, attempt, &cancel).await {
                    break 'outer;
                }
                continue;
            }
        };

        if attempt > 0 {
            metrics.backplane_reconnect();
        }
        attempt = 0;
        status.send_modify(|s| s.publisher = LinkState::Connected);
        info!(channel = %config.channel, "backplane publish link up");

        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                next = outbound.recv() => match next {
                    Some(envelope) => envelope,
                    None => break 'outer,
                },
            };

            if let Err(e) = publish_one(publisher.as_mut(), &config, &envelope).await {
                warn!(error = %e, "backplane publish failed, reopening link");
                // The link may only be stale (server restarted); one fresh
                // attempt before backing off.
                match reopen_and_publish(backplane.as_ref(), &config, &envelope).await {
                    Ok(fresh) => {
                        publisher = fresh;
                        metrics.backplane_reconnect();
                    }
                    Err(e) => {
                        metrics.backplane_publish_dropped();
                        warn!(error = %e, "backplane publish link down");
                        break;
                    }
                }
            }
            metrics.backplane_published();
        }

        attempt = 1;
        status.send_modify(|s| s.publisher = LinkState::Reconnecting { attempt });
        // Events queued while the link was up cannot be sent now.
        while outbound.try_recv().is_ok() {
            metrics.backplane_publish_dropped();
        }
        if !backoff(&config, attempt, &cancel).await {
            break;
        }
    }

    status.send_modify(|s| s.publisher = LinkState::Stopped);
    debug!("backplane publisher stopped");
}

async fn publish_one(
    publisher: &mut dyn Publisher,
    config: &BridgeConfig,
    envelope: &Envelope,
) -> Result<(), BackplaneError> {
    let payload = envelope.encode()?;
    tokio::time::timeout(
        config.publish_timeout,
        publisher.publish(&config.channel, &payload),
    )
    .await
    .map_err(|_| BackplaneError::Timeout(config.publish_timeout))?
}

async fn reopen_and_publish(
    backplane: &dyn Backplane,
    config: &BridgeConfig,
    envelope: &Envelope,
) -> Result<Box<dyn Publisher>, BackplaneError> {
    let mut publisher = backplane.publisher().await?;
    publish_one(publisher.as_mut(), config, envelope).await?;
    Ok(publisher)
}

async fn run_subscriber(
    backplane: Arc<dyn Backplane>,
    mut inbound: Inbound,
    status: Arc<watch::Sender<LinkStatus>>,
    config: BridgeConfig,
    metrics: Arc<ServerMetrics>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;

    'outer: loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break 'outer,
            opened = backplane.subscribe(&config.channel) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                attempt += 1;
                status.send_modify(|s| s.subscriber = LinkState::Reconnecting { attempt });
                warn!(error = %e, attempt, "backplane subscribe link unavailable");
                if !backoff(&config, attempt, &cancel).await {
                    break 'outer;
                }
                continue;
            }
        };

        if attempt > 0 {
            metrics.backplane_reconnect();
        }
        attempt = 0;
        status.send_modify(|s| s.subscriber = LinkState::Connected);
        info!(channel = %config.channel, "backplane subscribe link up");

        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                next = stream.next() => match next {
                    Some(payload) => payload,
                    None => break,
                },
            };
            inbound.handle(&payload).await;
        }

        warn!("backplane subscription lost");
        attempt = 1;
        status.send_modify(|s| s.subscriber = LinkState::Reconnecting { attempt });
        if !backoff(&config, attempt, &cancel).await {
            break;
        }
    }

    status.send_modify(|s| s.subscriber = LinkState::Stopped);
    debug!("backplane subscriber stopped");
}

/// Filters inbound envelopes and delivers the survivors locally.
struct Inbound {
    identity: Arc<InstanceIdentity>,
    broadcaster: Arc<LocalBroadcaster>,
    metrics: Arc<ServerMetrics>,
    recent: RecentIds,
}

impl Inbound {
    async fn handle(&mut self, payload: &[u8]) -> InboundOutcome {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics.backplane_decode_error();
                error!(error = %e, bytes = payload.len(), "discarding undecodable backplane payload");
                return InboundOutcome::Undecodable;
            }
        };

        if envelope.origin == self.identity.id {
            self.metrics.backplane_echo_suppressed();
            return InboundOutcome::SelfEcho;
        }

        if !self.recent.insert(envelope.id) {
            self.metrics.backplane_duplicate();
            debug!(id = %envelope.id, "dropping duplicate backplane envelope");
            return InboundOutcome::Duplicate;
        }

        self.metrics.backplane_received();
        let report = self
            .broadcaster
            .broadcast(&envelope.audience, &envelope.event, None)
            .await;
        debug!(
            id = %envelope.id,
            origin = %envelope.origin,
            event = envelope.event.event_name(),
            delivered = report.delivered,
            "relayed remote event"
        );
        InboundOutcome::Delivered(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::MemoryBackplane;
    use crate::registry::ConnectionRegistry;
    use crate::ws::protocol::StatusEvent;
    use uuid::Uuid;

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
            ..BridgeConfig::default()
        }
    }

    fn status_event(subject: &str) -> ServerMessage {
        ServerMessage::UserStatusChanged(StatusEvent::new(
            subject.into(),
            "online".into(),
            "node-b".into(),
        ))
    }

    fn inbound() -> (Inbound, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(ServerMetrics::new());
        let inbound = Inbound {
            identity: Arc::new(InstanceIdentity::new("node-a")),
            broadcaster: Arc::new(LocalBroadcaster::new(registry.clone(), metrics.clone())),
            metrics,
            recent: RecentIds::new(64),
        };
        (inbound, registry)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = BridgeConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(7), Duration::from_secs(60));
        assert_eq!(config.backoff(50), Duration::from_secs(60));
    }

    #[test]
    fn backoff_saturates_on_huge_base_delay() {
        let config = BridgeConfig {
            reconnect_base_delay: Duration::from_millis(u64::MAX),
            reconnect_max_delay: Duration::from_secs(60),
            ..BridgeConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(60));
        assert_eq!(config.backoff(7), Duration::from_secs(60));
    }

    #[test]
    fn readiness_needs_both_links() {
        let mut status = LinkStatus::default();
        assert!(!status.is_ready());
        status.publisher = LinkState::Connected;
        assert!(!status.is_ready());
        status.subscriber = LinkState::Connected;
        assert!(status.is_ready());
    }

    #[tokio::test]
    async fn inbound_drops_own_echo() {
        let (mut inbound, registry) = inbound();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("c1".into(), "u1".into(), tx).await.unwrap();
        registry.join("c1", "u42").await.unwrap();

        let own = Envelope::new(
            inbound.identity.id,
            Audience::Group("u42".into()),
            status_event("u42"),
        );
        let outcome = inbound.handle(&own.encode().unwrap()).await;
        assert_eq!(outcome, InboundOutcome::SelfEcho);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_delivers_remote_once() {
        let (mut inbound, registry) = inbound();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("c1".into(), "u1".into(), tx).await.unwrap();
        registry.join("c1", "u42").await.unwrap();

        let remote = Envelope::new(
            Uuid::new_v4(),
            Audience::Group("u42".into()),
            status_event("u42"),
        );
        let bytes = remote.encode().unwrap();

        match inbound.handle(&bytes).await {
            InboundOutcome::Delivered(report) => assert_eq!(report.delivered, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(inbound.handle(&bytes).await, InboundOutcome::Duplicate);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_survives_garbage() {
        let (mut inbound, _registry) = inbound();
        assert_eq!(inbound.handle(b"\x00\x01").await, InboundOutcome::Undecodable);
        assert_eq!(
            inbound.metrics.snapshot().backplane.decode_errors,
            1
        );
    }

    fn start_bridge(bus: &MemoryBackplane) -> Arc<BackplaneBridge> {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(ServerMetrics::new());
        BackplaneBridge::start(
            Arc::new(bus.clone()),
            Arc::new(InstanceIdentity::new("node-a")),
            Arc::new(LocalBroadcaster::new(registry, metrics.clone())),
            metrics,
            fast_config(),
        )
    }

    #[tokio::test]
    async fn becomes_ready_and_publishes() {
        let bus = MemoryBackplane::new();
        let mut tap = bus.subscribe("presence:events").await.unwrap();
        let bridge = start_bridge(&bus);
        assert!(bridge.wait_ready(Duration::from_secs(2)).await);

        assert_eq!(
            bridge.publish(Audience::All, status_event("u1")),
            PublishOutcome::Queued
        );
        let payload = tokio::time::timeout(Duration::from_secs(2), tap.next())
            .await
            .unwrap()
            .unwrap();
        let envelope = Envelope::decode(&payload).unwrap();
        assert_eq!(envelope.audience, Audience::All);
        bridge.shutdown();
    }

    #[tokio::test]
    async fn not_ready_while_backplane_down() {
        let bus = MemoryBackplane::offline().await;
        let bridge = start_bridge(&bus);
        assert!(!bridge.wait_ready(Duration::from_millis(100)).await);
        assert!(matches!(
            bridge.status().publisher,
            LinkState::Reconnecting { .. }
        ));
        assert_eq!(
            bridge.publish(Audience::All, status_event("u1")),
            PublishOutcome::Dropped
        );

        bus.set_online(true).await;
        assert!(bridge.wait_ready(Duration::from_secs(2)).await);
        bridge.shutdown();
    }

    #[tokio::test]
    async fn recovers_after_outage() {
        let bus = MemoryBackplane::new();
        let bridge = start_bridge(&bus);
        assert!(bridge.wait_ready(Duration::from_secs(2)).await);

        bus.set_online(false).await;
        let mut status = bridge.status.clone();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.subscriber != LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!bridge.is_ready());

        bus.set_online(true).await;
        assert!(bridge.wait_ready(Duration::from_secs(2)).await);
        bridge.shutdown();
    }

    #[tokio::test]
    async fn publish_is_dropped_once_subscription_is_lost() {
        let bus = MemoryBackplane::new();
        let bridge = start_bridge(&bus);
        assert!(bridge.wait_ready(Duration::from_secs(2)).await);

        bus.set_online(false).await;
        let mut status = bridge.status.clone();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.subscriber != LinkState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        // No write has failed yet, so the publish link still looks up.
        assert_eq!(bridge.status().publisher, LinkState::Connected);
        assert_eq!(
            bridge.publish(Audience::All, status_event("u1")),
            PublishOutcome::Dropped
        );

        bus.set_online(true).await;
        assert!(bridge.wait_ready(Duration::from_secs(2)).await);
        assert_eq!(
            bridge.publish(Audience::All, status_event("u1")),
            PublishOutcome::Queued
        );
        bridge.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_links() {
        let bus = MemoryBackplane::new();
        let bridge = start_bridge(&bus);
        assert!(bridge.wait_ready(Duration::from_secs(2)).await);
        bridge.shutdown();

        let mut status = bridge.status.clone();
        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| {
                s.publisher == LinkState::Stopped && s.subscriber == LinkState::Stopped
            }),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
