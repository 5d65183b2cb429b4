use crate::config::Config;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("invalid redis address: {0}")]
    Address(String),
    #[error("subscription to {channel} closed")]
    Closed { channel: String },
}

/// A subscription that can be polled with a bounded wait.
#[async_trait]
pub trait MessageSource: Send {
    /// `Ok(None)` means nothing arrived within `timeout`.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BusError>;
}

pub struct RedisSubscriber {
    channel: String,
    messages: BoxStream<'static, redis::Msg>,
}

impl RedisSubscriber {
    pub async fn connect(config: &Config) -> Result<Self, BusError> {
        let url = config
            .redis_url()
            .map_err(|err| BusError::Address(err.to_string()))?;
        let client = redis::Client::open(url)?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&config.redis_channel).await?;
        tracing::info!(
            host = %config.redis_host,
            port = config.redis_port,
            channel = %config.redis_channel,
            "subscribed to Redis channel"
        );

        Ok(Self {
            channel: config.redis_channel.clone(),
            messages: pubsub.into_on_message().boxed(),
        })
    }
}

#[async_trait]
impl MessageSource for RedisSubscriber {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, BusError> {
        match tokio::time::timeout(timeout, self.messages.next()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(msg.get_payload_bytes().to_vec())),
            Ok(None) => Err(BusError::Closed {
                channel: self.channel.clone(),
            }),
        }
    }
}
