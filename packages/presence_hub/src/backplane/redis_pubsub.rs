//! Redis pub/sub backplane.
//!
//! Publishing and subscribing use separate connections: a Redis connection
//! in subscribe mode cannot issue PUBLISH.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use super::{Backplane, BackplaneError, PayloadStream, Publisher};

pub struct RedisBackplane {
    client: redis::Client,
}

impl RedisBackplane {
    /// Parse `url`. Does not connect; links are opened by the bridge.
    pub fn open(url: &str) -> Result<Self, BackplaneError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publisher(&self) -> Result<Box<dyn Publisher>, BackplaneError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisPublisher { conn }))
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BackplaneError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel, "redis subscription established");
        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }
}

struct RedisPublisher {
    conn: MultiplexedConnection,
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), BackplaneError> {
        let receivers: i64 = self.conn.publish(channel, payload).await?;
        debug!(channel, receivers, "published to redis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_url_rejected() {
        assert!(matches!(
            RedisBackplane::open("not a url"),
            Err(BackplaneError::Redis(_))
        ));
    }

    #[test]
    fn valid_url_does_not_connect() {
        // Nothing listens on port 1; open() must still succeed.
        assert!(RedisBackplane::open("redis://127.0.0.1:1/").is_ok());
    }

    #[tokio::test]
    async fn unreachable_server_is_error() {
        let backplane = RedisBackplane::open("redis://127.0.0.1:1/").unwrap();
        assert!(backplane.publisher().await.is_err());
        assert!(backplane.subscribe("presence:events").await.is_err());
    }
}
