//! Backplane: cross-instance pub/sub that carries fanout events between hubs.
//!
//! Every hub publishes the events that enter through it and subscribes to the
//! same channel to receive everyone else's. The [`Backplane`] trait hides the
//! transport; [`bridge::BackplaneBridge`] owns the links, their reconnection
//! and the inbound filtering.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ws::protocol::{Audience, ServerMessage};

pub mod bridge;
mod dedup;
pub mod memory;
pub mod redis_pubsub;

pub use bridge::{BackplaneBridge, BridgeConfig, LinkState, LinkStatus, PublishOutcome};
pub use memory::MemoryBackplane;
pub use redis_pubsub::RedisBackplane;

#[derive(Debug, Error)]
pub enum BackplaneError {
    #[error("backplane unavailable: {0}")]
    Unavailable(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("backplane operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Raw payloads from a subscription. The stream ends when the link drops.
pub type PayloadStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait Backplane: Send + Sync + 'static {
    /// Open the publish link.
    async fn publisher(&self) -> Result<Box<dyn Publisher>, BackplaneError>;

    /// Open the subscribe link on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BackplaneError>;
}

#[async_trait]
pub trait Publisher: Send {
    /// An error means the link is gone and must be reopened.
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), BackplaneError>;
}

/// What goes over the wire between hubs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per event; used to drop duplicate deliveries.
    pub id: Uuid,
    /// Instance that published the event.
    pub origin: Uuid,
    pub audience: Audience,
    pub event: ServerMessage,
}

impl Envelope {
    pub fn new(origin: Uuid, audience: Audience, event: ServerMessage) -> Self {
        Self {
            id: Uuid::now_v7(),
            origin,
            audience,
            event,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BackplaneError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BackplaneError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
