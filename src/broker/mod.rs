//! Message broker plumbing shared by the orchestrator and route synchronizer.
//!
//! Handlers never talk to the broker directly. They receive an
//! [`InboundMessage`], return `Result<(), ProcessingError>`, and the
//! [`Dispatcher`] turns that outcome into a [`Disposition`]: acknowledge,
//! requeue after a backoff delay, or reject to the dead-letter queue. Outbound
//! events go through the [`Publisher`] trait so tests can record them.

mod amqp;
mod dispatch;
mod retry;

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future;
use serde::Serialize;

use crate::contracts::idempotency_key;
use crate::error::{BrokerError, ProcessingError};

pub use amqp::{AmqpPublisher, connect, consume, declare_topology};
pub use dispatch::Dispatcher;
pub use retry::{AttemptTracker, RetryPolicy, retry_with_backoff};

/// What to tell the broker about a delivery once handling finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Return the message to the queue for redelivery.
    Requeue,
    /// Drop the message to the dead-letter exchange.
    Reject,
}

/// A consumed message as seen by handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Raw payload.
    pub body: Vec<u8>,
    /// The `message_id` property, when the publisher set one.
    pub message_id: Option<String>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
}

impl InboundMessage {
    /// A first delivery of `body` without a message id.
    #[must_use]
    pub const fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            message_id: None,
            redelivered: false,
        }
    }

    /// Attach a message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Key identifying this logical message across redeliveries.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        idempotency_key(self.message_id.as_deref(), &self.body)
    }

    /// The publisher-assigned message id, unless absent or blank.
    ///
    /// Unlike [`InboundMessage::idempotency_key`], this never falls back to
    /// the payload, so two publishes of the same body stay distinct.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.message_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// Boxed future returned by [`Publisher`] implementors.
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;

/// Boxed future returned by [`MessageHandler`] implementors.
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), ProcessingError>> + Send + 'a>>;

/// Publishes payloads to an exchange.
pub trait Publisher: Send + Sync {
    /// Publish `payload` and wait until the broker has accepted it.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: Vec<u8>,
    ) -> PublishFuture<'a>;
}

/// Processes one consumed message.
pub trait MessageHandler: Send + Sync {
    /// Handle `message`, reporting the processing outcome.
    fn handle<'a>(&'a self, message: &'a InboundMessage) -> HandlerFuture<'a>;
}

/// Serialise a message as JSON.
///
/// # Errors
///
/// Returns `BrokerError::EncodeFailed` if serialisation fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, BrokerError> {
    serde_json::to_vec(message).map_err(|error| BrokerError::EncodeFailed {
        message: error.to_string(),
    })
}

/// Serialise `message` and publish it with the event name as routing key.
///
/// # Errors
///
/// Returns `BrokerError::EncodeFailed` or the publisher's error.
pub async fn publish_json<P, T>(
    publisher: &P,
    exchange: &str,
    routing_key: &str,
    message: &T,
) -> Result<(), BrokerError>
where
    P: Publisher + ?Sized,
    T: Serialize,
{
    let payload = encode(message)?;
    publisher.publish(exchange, routing_key, payload).await
}

/// One message accepted by a [`RecordingPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Publisher that keeps messages in memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<PublishedMessage>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    /// Create a publisher that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages accepted so far.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    /// Messages accepted so far with the given routing key.
    #[must_use]
    pub fn published_with_key(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.routing_key == routing_key)
            .collect()
    }

    fn record(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let rejected = || BrokerError::PublishFailed {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message: String::from("publisher unavailable"),
        };
        if self.failing.load(Ordering::SeqCst) {
            return Err(rejected());
        }
        self.published
            .lock()
            .map_err(|_| rejected())?
            .push(PublishedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                payload,
            });
        Ok(())
    }
}

impl Publisher for RecordingPublisher {
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: Vec<u8>,
    ) -> PublishFuture<'a> {
        Box::pin(future::ready(self.record(exchange, routing_key, payload)))
    }
}
