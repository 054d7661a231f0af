//! In-process backplane for tests and single-node deployments.
//!
//! Hubs that share one `MemoryBackplane` behave like hubs that share one
//! Redis channel. It can be taken offline to exercise outage handling: every
//! open link is severed and new ones are refused until it comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Backplane, BackplaneError, PayloadStream, Publisher};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryBackplane {
    inner: Arc<Inner>,
}

struct Inner {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    online: AtomicBool,
    /// Cancelled when the backplane goes offline; replaced when it returns.
    epoch: Mutex<CancellationToken>,
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                epoch: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Starts unreachable; call [`set_online`](Self::set_online) to bring it up.
    pub async fn offline() -> Self {
        let bus = Self::new();
        bus.set_online(false).await;
        bus
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub async fn set_online(&self, online: bool) {
        let mut epoch = self.inner.epoch.lock().await;
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was && !online {
            epoch.cancel();
            *epoch = CancellationToken::new();
        }
    }

    /// Inject raw bytes as if another hub had published them.
    pub async fn inject(&self, channel: &str, payload: Vec<u8>) {
        let _ = self.sender(channel).await.send(payload);
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.inner.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    async fn live_epoch(&self) -> Result<CancellationToken, BackplaneError> {
        let epoch = self.inner.epoch.lock().await;
        if !self.is_online() {
            return Err(BackplaneError::Unavailable(
                "memory backplane offline".into(),
            ));
        }
        Ok(epoch.clone())
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publisher(&self) -> Result<Box<dyn Publisher>, BackplaneError> {
        let epoch = self.live_epoch().await?;
        Ok(Box::new(MemoryPublisher {
            bus: self.clone(),
            epoch,
        }))
    }

    async fn subscribe(&self, channel: &str) -> Result<PayloadStream, BackplaneError> {
        let epoch = self.live_epoch().await?;
        let rx = self.sender(channel).await.subscribe();

        let stream = futures::stream::unfold((rx, epoch), |(mut rx, epoch)| async move {
            loop {
                tokio::select! {
                    _ = epoch.cancelled() => return None,
                    recv = rx.recv() => match recv {
                        Ok(bytes) => return Some((bytes, (rx, epoch))),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "memory backplane subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        });
        Ok(stream.boxed())
    }
}

struct MemoryPublisher {
    bus: MemoryBackplane,
    epoch: CancellationToken,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), BackplaneError> {
        if self.epoch.is_cancelled() || !self.bus.is_online() {
            return Err(BackplaneError::Unavailable(
                "memory backplane offline".into(),
            ));
        }
        // No subscribers is not an error; Redis behaves the same.
        let _ = self.bus.sender(channel).await.send(payload.to_vec());
        Ok(())
    }
}
