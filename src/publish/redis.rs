//! Redis bus writer
//!
//! Writes are queued onto a background task and flushed in pipelined
//! batches. A broken Redis connection downgrades the publisher to
//! best-effort: writes are dropped with a warning until the connection
//! recovers. Bus trouble never kills a channel.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

use super::BusWriter;

/// Batch settings for the background flush task
#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_depth: usize,
}

impl Default for RedisBusConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 100,
            queue_depth: 10_000,
        }
    }
}

/// Redis-backed bus writer
pub struct RedisBus {
    tx: mpsc::Sender<(String, String)>,
}

impl RedisBus {
    /// Connect lazily and start the background flush task
    pub fn new(redis_url: &str, config: RedisBusConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatewayError::Bus(format!("invalid Redis URL: {e}")))?;

        let (tx, rx) = mpsc::channel(config.queue_depth);
        tokio::spawn(flush_task(client, rx, config));

        Ok(Self { tx })
    }
}

async fn flush_task(
    client: redis::Client,
    mut rx: mpsc::Receiver<(String, String)>,
    config: RedisBusConfig,
) {
    let mut buffer: Vec<(String, String)> = Vec::with_capacity(config.batch_size);
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_millis(config.flush_interval_ms));
    let mut connection: Option<redis::aio::MultiplexedConnection> = None;

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(entry) => {
                        buffer.push(entry);
                        if buffer.len() >= config.batch_size {
                            flush(&client, &mut connection, &mut buffer).await;
                        }
                    },
                    // All senders gone: final flush, then exit.
                    None => {
                        flush(&client, &mut connection, &mut buffer).await;
                        break;
                    },
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&client, &mut connection, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush(
    client: &redis::Client,
    connection: &mut Option<redis::aio::MultiplexedConnection>,
    buffer: &mut Vec<(String, String)>,
) {
    if buffer.is_empty() {
        return;
    }

    if connection.is_none() {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => *connection = Some(conn),
            Err(e) => {
                warn!(error = %e, dropped = buffer.len(), "Redis unavailable, dropping bus writes");
                buffer.clear();
                return;
            },
        }
    }

    let mut pipe = redis::pipe();
    for (key, value) in buffer.iter() {
        pipe.set(key, value);
    }

    let Some(conn) = connection.as_mut() else {
        return;
    };
    let result: redis::RedisResult<()> = pipe.query_async(conn).await;
    match result {
        Ok(()) => {
            debug!(count = buffer.len(), "flushed bus writes");
            buffer.clear();
        },
        Err(e) => {
            warn!(error = %e, dropped = buffer.len(), "bus flush failed, reconnecting next time");
            *connection = None;
            buffer.clear();
        },
    }
}

#[async_trait]
impl BusWriter for RedisBus {
    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.tx
            .send((key.to_string(), value.to_string()))
            .await
            .map_err(|_| GatewayError::Bus("publisher task stopped".to_string()))
    }
}
