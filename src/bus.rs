//! Message bus client.
//!
//! The agent talks to its control plane through a pub/sub message bus. The
//! rest of the code is polymorphic over the [`Bus`] capability set, so tests
//! (and future transports) can substitute their own; production uses the
//! Redis-backed [`RedisBus`].

use std::{fmt, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use ezstream_log::log;
use futures::{
    channel::mpsc,
    stream::{BoxStream, StreamExt as _},
};
use tokio::{sync::Mutex, time};

/// Upper bound on the time a single publish may block its caller.
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(200);

/// Base delay of the subscription reconnect backoff.
const RECONNECT_BASE: Duration = Duration::from_secs(2);

/// Cap of the subscription reconnect backoff.
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// Pub/sub capability set the agent requires from its message bus.
#[async_trait]
pub trait Bus: fmt::Debug + Send + Sync {
    /// Publishes the given `payload` onto the given `channel`.
    ///
    /// Returns the number of receivers if the bus reports it, `-1`
    /// otherwise. Never blocks the caller for more than a bounded time;
    /// back-pressure is absorbed by the caller's queues.
    ///
    /// # Errors
    ///
    /// If the bus is unreachable or refuses the publish within the bound.
    async fn publish(
        &self,
        channel: &str,
        payload: &[u8],
    ) -> Result<i64, anyhow::Error>;

    /// Subscribes to the given `channel`, yielding its messages as opaque
    /// byte payloads.
    ///
    /// The subscription survives bus reconnects: it's re-established under
    /// the hood with an exponential backoff, so the returned stream only
    /// finishes when dropped.
    async fn subscribe(&self, channel: &str) -> BoxStream<'static, Vec<u8>>;
}

/// [`Bus`] implementation backed by a Redis pub/sub.
pub struct RedisBus {
    /// Configured Redis client (cheap to clone, connects lazily).
    client: redis::Client,

    /// Lazily established connection used for publishing.
    ///
    /// Reset on any failure and re-established on the next publish.
    publisher: Mutex<Option<redis::aio::Connection>>,
}

impl fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBus")
            .field("client", &self.client)
            .finish()
    }
}

impl RedisBus {
    /// Creates a new [`RedisBus`] for the given endpoint.
    ///
    /// # Errors
    ///
    /// If the endpoint doesn't form a valid Redis connection info.
    pub fn new(
        host: &str,
        port: u16,
        password: Option<String>,
    ) -> Result<Self, anyhow::Error> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_owned(), port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: None,
                password,
            },
        };
        Ok(Self {
            client: redis::Client::open(info)
                .map_err(|e| anyhow!("Invalid bus endpoint: {}", e))?,
            publisher: Mutex::new(None),
        })
    }

    /// Verifies the bus is reachable.
    ///
    /// # Errors
    ///
    /// If the bus cannot be reached or doesn't answer a `PING`.
    pub async fn ping(&self) -> Result<(), anyhow::Error> {
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| anyhow!("Failed to connect to bus: {}", e))?;
        let _ = redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| anyhow!("Bus refused PING: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(
        &self,
        channel: &str,
        payload: &[u8],
    ) -> Result<i64, anyhow::Error> {
        let result = time::timeout(PUBLISH_TIMEOUT, async {
            let mut guard = self.publisher.lock().await;
            if guard.is_none() {
                *guard = Some(self.client.get_async_connection().await?);
            }
            let conn = guard.as_mut().unwrap();
            match redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<_, i64>(conn)
                .await
            {
                Ok(receivers) => Ok(receivers),
                Err(e) => {
                    // Drop the broken connection so the next publish dials
                    // afresh.
                    *guard = None;
                    Err(e)
                }
            }
        })
        .await;

        match result {
            Ok(Ok(receivers)) => Ok(receivers),
            Ok(Err(e)) => Err(anyhow!("Bus publish failed: {}", e)),
            Err(_) => {
                *self.publisher.lock().await = None;
                Err(anyhow!(
                    "Bus publish timed out after {:?}",
                    PUBLISH_TIMEOUT,
                ))
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> BoxStream<'static, Vec<u8>> {
        let (tx, rx) = mpsc::unbounded();
        drop(tokio::spawn(run_subscription(
            self.client.clone(),
            channel.to_owned(),
            tx,
        )));
        rx.boxed()
    }
}

/// Keeps one channel subscription alive, re-establishing it with an
/// exponential backoff whenever the bus connection is lost.
///
/// Finishes only once the receiving side of `tx` is dropped.
async fn run_subscription(
    client: redis::Client,
    channel: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    loop {
        if tx.is_closed() {
            return;
        }

        let connect = || async {
            client
                .get_async_connection()
                .await
                .map(redis::aio::Connection::into_pubsub)
                .map_err(|e| {
                    log::warn!(
                        "Failed to connect to bus for '{}' subscription: {}",
                        channel,
                        e,
                    );
                    backoff::Error::transient(e)
                })
        };
        let mut pubsub = match backoff::future::retry(
            ExponentialBackoff {
                initial_interval: RECONNECT_BASE,
                max_interval: RECONNECT_CAP,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
            connect,
        )
        .await
        {
            Ok(pubsub) => pubsub,
            Err(e) => {
                // Unreachable with unbounded retries, but don't spin if it
                // ever happens.
                log::error!("Bus subscription connect gave up: {}", e);
                time::sleep(RECONNECT_CAP).await;
                continue;
            }
        };

        if let Err(e) = pubsub.subscribe(&channel).await {
            log::warn!("Failed to subscribe to '{}': {}", channel, e);
            time::sleep(RECONNECT_BASE).await;
            continue;
        }
        log::info!("Subscribed to bus channel '{}'", channel);

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            if tx.unbounded_send(msg.get_payload_bytes().to_vec()).is_err() {
                return;
            }
        }

        log::warn!(
            "Bus subscription to '{}' lost, re-establishing",
            channel,
        );
    }
}

/// Returns the inbound command channel of the given host.
#[must_use]
pub fn commands_channel(host_id: i64) -> String {
    format!("vps-commands:{}", host_id)
}

/// Shared handle to the agent's [`Bus`].
pub type SharedBus = Arc<dyn Bus>;

#[cfg(test)]
mod spec {
    use super::*;

    #[test]
    fn commands_channel_is_host_scoped() {
        assert_eq!(commands_channel(42), "vps-commands:42");
    }
}
