//! AMQP transport over lapin: connection, topology, publishing and consuming.

use std::sync::Arc;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::retry::{RetryPolicy, retry_with_backoff};
use super::{Dispatcher, Disposition, InboundMessage, PublishFuture, Publisher};
use crate::error::BrokerError;

const JSON_CONTENT_TYPE: &str = "application/json";
const PERSISTENT_DELIVERY: u8 = 2;
const DEAD_LETTER_ARG: &str = "x-dead-letter-exchange";

/// Open a broker connection, retrying per `policy`.
///
/// # Errors
///
/// Returns `BrokerError::ConnectionFailed` once every attempt has failed.
pub async fn connect(url: &str, policy: &RetryPolicy) -> Result<Connection, BrokerError> {
    let connection = retry_with_backoff(policy, "broker connection", |attempt| {
        debug!(attempt, "connecting to broker");
        Connection::connect(url, ConnectionProperties::default())
    })
    .await
    .map_err(|(attempts, error)| BrokerError::ConnectionFailed {
        attempts,
        message: error.to_string(),
    })?;
    info!("connected to broker");
    Ok(connection)
}

fn topology_failed(error: lapin::Error) -> BrokerError {
    BrokerError::TopologyFailed {
        message: error.to_string(),
    }
}

/// Declare `exchange`, its dead-letter path, and one queue per routing key.
///
/// Every queue is named after the routing key it is bound with and
/// dead-letters rejected messages to the fanout exchange `{exchange}.dlx`,
/// which feeds the queue `{exchange}.dead`.
///
/// # Errors
///
/// Returns `BrokerError::TopologyFailed` if any declaration is refused.
pub async fn declare_topology(
    channel: &Channel,
    exchange: &str,
    routing_keys: &[&str],
) -> Result<(), BrokerError> {
    let durable_exchange = ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    };
    let durable_queue = QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    };
    let dead_letter_exchange = format!("{exchange}.dlx");
    let dead_letter_queue = format!("{exchange}.dead");

    channel
        .exchange_declare(exchange, ExchangeKind::Direct, durable_exchange, FieldTable::default())
        .await
        .map_err(topology_failed)?;
    channel
        .exchange_declare(
            &dead_letter_exchange,
            ExchangeKind::Fanout,
            durable_exchange,
            FieldTable::default(),
        )
        .await
        .map_err(topology_failed)?;
    channel
        .queue_declare(&dead_letter_queue, durable_queue, FieldTable::default())
        .await
        .map_err(topology_failed)?;
    channel
        .queue_bind(
            &dead_letter_queue,
            &dead_letter_exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(topology_failed)?;

    for key in routing_keys {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from(DEAD_LETTER_ARG),
            AMQPValue::LongString(LongString::from(dead_letter_exchange.clone())),
        );
        channel
            .queue_declare(key, durable_queue, arguments)
            .await
            .map_err(topology_failed)?;
        channel
            .queue_bind(key, exchange, key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(topology_failed)?;
    }

    info!(exchange, queues = routing_keys.len(), "broker topology declared");
    Ok(())
}

/// Publisher using a confirm-mode channel.
#[derive(Debug, Clone)]
pub struct AmqpPublisher {
    channel: Channel,
}

impl AmqpPublisher {
    /// Put `channel` into confirm mode and wrap it.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::TopologyFailed` if confirm mode is refused.
    pub async fn new(channel: Channel) -> Result<Self, BrokerError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(topology_failed)?;
        Ok(Self { channel })
    }

    async fn send(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let failed = |message: String| BrokerError::PublishFailed {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message,
        };
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()));

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|error| failed(error.to_string()))?
            .await
            .map_err(|error| failed(error.to_string()))?;

        if confirmation.is_nack() {
            return Err(failed(String::from("broker did not confirm the message")));
        }
        debug!(exchange, routing_key, "published message");
        Ok(())
    }
}

impl Publisher for AmqpPublisher {
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: Vec<u8>,
    ) -> PublishFuture<'a> {
        Box::pin(self.send(exchange, routing_key, payload))
    }
}

/// Consume the dispatcher's queue until `shutdown` fires.
///
/// Each delivery is handled on its own task; `prefetch` bounds how many are
/// in flight. On shutdown the consumer is cancelled and in-flight deliveries
/// are allowed to finish and settle before returning.
///
/// # Errors
///
/// Returns `BrokerError::ConsumeFailed` if the consumer cannot be started or
/// the delivery stream fails.
pub async fn consume(
    channel: Channel,
    dispatcher: Dispatcher,
    prefetch: u16,
    shutdown: CancellationToken,
) -> Result<(), BrokerError> {
    let queue = dispatcher.queue().to_owned();
    let consume_failed = |error: lapin::Error| BrokerError::ConsumeFailed {
        queue: queue.clone(),
        message: error.to_string(),
    };

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(consume_failed)?;
    let consumer_tag = format!("cestx-{queue}-{}", Uuid::new_v4().simple());
    let mut deliveries = channel
        .basic_consume(
            &queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(consume_failed)?;
    info!(queue = %queue, prefetch, "consuming");

    let shared = Arc::new(dispatcher);
    let mut in_flight = JoinSet::new();
    let mut stream_error = None;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(panic) = joined {
                    warn!(queue = %queue, error = %panic, "delivery task failed");
                }
            }
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    in_flight.spawn(settle(Arc::clone(&shared), delivery));
                }
                Some(Err(error)) => {
                    stream_error = Some(consume_failed(error));
                    break;
                }
                None => break,
            },
        }
    }

    if let Err(error) = channel
        .basic_cancel(&consumer_tag, BasicCancelOptions::default())
        .await
    {
        debug!(queue = %queue, error = %error, "consumer cancel failed");
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Err(panic) = joined {
            warn!(queue = %queue, error = %panic, "delivery task failed");
        }
    }
    info!(queue = %queue, "consumer stopped");

    stream_error.map_or(Ok(()), Err)
}

async fn settle(dispatcher: Arc<Dispatcher>, delivery: Delivery) {
    let message = InboundMessage {
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        redelivered: delivery.redelivered,
        body: delivery.data,
    };
    let disposition = dispatcher.dispatch(&message).await;

    let result = match disposition {
        Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
        Disposition::Requeue => {
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                })
                .await
        }
        Disposition::Reject => {
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                })
                .await
        }
    };
    if let Err(error) = result {
        warn!(queue = %dispatcher.queue(), ?disposition, error = %error, "failed to settle delivery");
    }
}
