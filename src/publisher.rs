//! RabbitMQ publisher for the ingress gateway.
//!
//! Owns the single broker connection and channel used to enqueue stored
//! filenames for the processing workers.

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// AMQP reply code sent on graceful close
const REPLY_SUCCESS: u16 = 200;

/// Errors that can occur when talking to the message broker
#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("Failed to connect to message broker: {0}")]
    Connection(String),

    #[error("Failed to open broker channel: {0}")]
    Channel(String),

    #[error("Failed to publish to queue {queue}: {message}")]
    Publish { queue: String, message: String },
}

/// Publisher interface for sending payloads to a named queue
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), PublisherError>;

    /// Release broker resources. Invoked once at process shutdown.
    async fn close(&self);
}

/// Broker publisher owning a single connection and channel.
///
/// The channel is shared behind a mutex so concurrent handlers publish
/// one at a time over the same channel.
pub struct QueuePublisher {
    connection: Connection,
    channel: Mutex<Channel>,
    queue: String,
}

impl QueuePublisher {
    /// Connect to the broker and declare the queue.
    ///
    /// The queue is declared non-durable, matching the downstream
    /// consumers. If the channel cannot be opened or the declaration
    /// fails, the connection is released before the error is returned.
    pub async fn connect(url: &str, queue: &str) -> Result<Self, PublisherError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| PublisherError::Connection(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "").await;
                return Err(PublisherError::Channel(e.to_string()));
            }
        };

        if let Err(e) = channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
        {
            let _ = channel.close(REPLY_SUCCESS, "").await;
            let _ = connection.close(REPLY_SUCCESS, "").await;
            return Err(PublisherError::Channel(e.to_string()));
        }

        info!(queue = %queue, "Connected to message broker");

        Ok(Self {
            connection,
            channel: Mutex::new(channel),
            queue: queue.to_string(),
        })
    }

}

#[async_trait]
impl MessagePublisher for QueuePublisher {
    #[instrument(skip(self, payload), fields(queue = %queue))]
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), PublisherError> {
        let channel = self.channel.lock().await;
        // Fire-and-forget: the broker confirm is dropped without being awaited
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("text/plain".into()),
            )
            .await
            .map_err(|e| PublisherError::Publish {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        metrics::counter!("gateway.messages.published").increment(1);
        debug!(bytes = payload.len(), "Message published");

        Ok(())
    }

    /// Close the channel and connection. Errors are logged, not returned.
    async fn close(&self) {
        let channel = self.channel.lock().await;
        if let Err(e) = channel.close(REPLY_SUCCESS, "").await {
            debug!(queue = %self.queue, error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "").await {
            debug!(error = %e, "Connection close failed");
        }
        info!("Broker connection closed");
    }
}

/// In-memory publisher used by tests. Records every payload, can be
/// switched into a failing mode, can watch a path and note whether it
/// exists at the moment of each publish call, and remembers whether the
/// connection was released.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    pub(crate) messages: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
    pub(crate) fail: std::sync::atomic::AtomicBool,
    pub(crate) watch_path: std::sync::Mutex<Option<std::path::PathBuf>>,
    pub(crate) watch_seen: std::sync::Mutex<Vec<bool>>,
    pub(crate) closed: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), PublisherError> {
        if let Some(path) = self.watch_path.lock().unwrap().as_ref() {
            self.watch_seen.lock().unwrap().push(path.exists());
        }

        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PublisherError::Publish {
                queue: queue.to_string(),
                message: "broker unavailable".to_string(),
            });
        }

        self.messages
            .lock()
            .unwrap()
            .push((queue.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
