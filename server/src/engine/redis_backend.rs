//! Redis implementations of the relay broker and the ban store, for running
//! several instances behind one load balancer.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::warn;

use super::bans::{BanError, BanStatus, BanStore};
use super::events::Payload;
use super::relay::{Broker, MessageStream, RelayError};

/// Lazily opened multiplexed connection. A failed connect is retried on the
/// next call.
struct Connector {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
}

impl Connector {
    fn open(url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.conn
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await
            .cloned()
    }
}

pub struct RedisBroker {
    connector: Connector,
}

impl RedisBroker {
    pub fn open(url: &str) -> Result<Self, RelayError> {
        Ok(Self {
            connector: Connector::open(url)?,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), RelayError> {
        let mut conn = self.connector.connection().await?;
        let _receivers: i64 = conn.publish(channel, payload.as_bytes()).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RelayError> {
        // Pub/sub needs a dedicated connection.
        let mut pubsub = self.connector.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let channel = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let decoded = msg.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match decoded {
                    Ok(text) => Some(Payload::from(text)),
                    Err(e) => {
                        warn!(%channel, error = %e, "undecodable relay payload");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

pub fn ban_key(room_id: &str, user_id: &str) -> String {
    format!("ban_{room_id}_{user_id}")
}

/// Interpret a `PTTL` reply: -2 means no key, -1 means no expiry.
pub fn status_from_pttl(pttl_millis: i64) -> BanStatus {
    match pttl_millis {
        -1 => BanStatus::Banned { remaining: None },
        ms if ms > 0 => BanStatus::Banned {
            remaining: Some(Duration::from_millis(ms as u64)),
        },
        _ => BanStatus::NotBanned,
    }
}

pub struct RedisBanStore {
    connector: Connector,
}

impl RedisBanStore {
    pub fn open(url: &str) -> Result<Self, BanError> {
        Ok(Self {
            connector: Connector::open(url)?,
        })
    }
}

#[async_trait]
impl BanStore for RedisBanStore {
    async fn ban(&self, room_id: &str, user_id: &str, ttl: Duration) -> Result<bool, BanError> {
        let mut conn = self.connector.connection().await?;
        let millis = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = redis::cmd("SET")
            .arg(ban_key(room_id, user_id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn status(&self, room_id: &str, user_id: &str) -> Result<BanStatus, BanError> {
        let mut conn = self.connector.connection().await?;
        let pttl: i64 = conn.pttl(ban_key(room_id, user_id)).await?;
        Ok(status_from_pttl(pttl))
    }
}
