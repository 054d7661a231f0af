//! Server metrics for observability
//!
//! Provides runtime metrics for monitoring fanout health and backplane traffic.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently active WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// WebSocket messages received from clients
    pub messages_received: AtomicU64,
    /// Messages queued to local connections
    pub messages_sent: AtomicU64,
    /// Messages dropped because a connection stayed full past the send timeout
    pub messages_dropped: AtomicU64,
    /// Deliveries that found the connection already gone
    pub delivery_failures: AtomicU64,
    /// Status changes accepted (socket and HTTP)
    pub status_updates: AtomicU64,

    // Backplane metrics
    pub backplane_published: AtomicU64,
    /// Outbound events dropped while the publish link was down
    pub backplane_publish_dropped: AtomicU64,
    pub backplane_received: AtomicU64,
    pub backplane_echo_suppressed: AtomicU64,
    pub backplane_duplicates: AtomicU64,
    pub backplane_decode_errors: AtomicU64,
    pub backplane_reconnects: AtomicU64,

    // Error metrics
    pub store_errors: AtomicU64,
    pub websocket_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    counter! {
        message_received => messages_received,
        message_sent => messages_sent,
        message_dropped => messages_dropped,
        delivery_failed => delivery_failures,
        status_updated => status_updates,
        backplane_published => backplane_published,
        backplane_publish_dropped => backplane_publish_dropped,
        backplane_received => backplane_received,
        backplane_echo_suppressed => backplane_echo_suppressed,
        backplane_duplicate => backplane_duplicates,
        backplane_decode_error => backplane_decode_errors,
        backplane_reconnect => backplane_reconnects,
        store_error => store_errors,
        websocket_error => websocket_errors,
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
                status_updates: self.status_updates.load(Ordering::Relaxed),
            },
            backplane: BackplaneMetrics {
                published: self.backplane_published.load(Ordering::Relaxed),
                publish_dropped: self.backplane_publish_dropped.load(Ordering::Relaxed),
                received: self.backplane_received.load(Ordering::Relaxed),
                echo_suppressed: self.backplane_echo_suppressed.load(Ordering::Relaxed),
                duplicates: self.backplane_duplicates.load(Ordering::Relaxed),
                decode_errors: self.backplane_decode_errors.load(Ordering::Relaxed),
                reconnects: self.backplane_reconnects.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                store: self.store_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub backplane: BackplaneMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
    pub delivery_failures: u64,
    pub status_updates: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackplaneMetrics {
    pub published: u64,
    pub publish_dropped: u64,
    pub received: u64,
    pub echo_suppressed: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub store: u64,
    pub websocket: u64,
}

/// Liveness payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    pub hostname: String,
    pub instance_id: String,
    pub connections: u64,
    pub uptime_secs: u64,
}
