use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties,
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio::sync::Mutex;

use crate::source::ATTEMPT_HEADER;
use crate::{
    Envelope,
    transport::{DeliveryKind, OutboundHeaders, Sender, ToBytes},
};

/// AMQP header carrying the dead-letter failure classification.
pub const FAILURE_CLASS_HEADER: &str = "x-failure-class";
/// AMQP header carrying the dead-letter failure reason.
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";

/// RabbitMQ transport sender.
///
/// This sender publishes messages to queues on the default exchange using a
/// shared `lapin::Channel`, with the persistence flag set so messages
/// survive a broker restart.
///
/// ## Design
///
/// - The routing key is derived from the envelope headers
/// - Envelope headers are mapped to **AMQP message headers**
/// - The message payload is serialized into bytes using `ToBytes`
/// - The send resolves only after the broker's publisher confirm, which is
///   what lets the pipeline acknowledge strictly after publication
///
/// The channel is wrapped in `Arc<Mutex<_>>` because:
/// - `lapin::Channel` is not `Sync`
/// - `Sender::send` is async and may be called concurrently
///
/// ## Type Parameters
///
/// - `M`: message payload type (phantom, inferred from `Sender`)
pub struct RabbitMq<M> {
    /// Shared AMQP channel used for publishing.
    channel: Arc<Mutex<lapin::Channel>>,
    /// Marker for the message type.
    msg: std::marker::PhantomData<M>,
}

impl<M> RabbitMq<M> {
    /// Create a sender publishing on `channel`.
    pub fn new(channel: lapin::Channel) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            msg: std::marker::PhantomData,
        }
    }
}

impl<M> Clone for RabbitMq<M> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            msg: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<H, M> Sender<H, M> for RabbitMq<M>
where
    H: RoutingKey + RabbitMqAttributes + Send + Sync + 'static,
    M: ToBytes + Send + Sync,
{
    type Error = lapin::Error;

    /// Publish a message to RabbitMQ.
    ///
    /// ## Mapping
    ///
    /// - `Envelope.headers.routing_key()` → AMQP routing key (queue name on
    ///   the default exchange)
    /// - `Envelope.headers.attributes()` → AMQP message headers
    /// - `Envelope.message` → message body
    ///
    /// The call waits for both:
    /// - the publish to be sent
    /// - the broker confirmation (publisher confirms)
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        let mut amqp_headers = FieldTable::default();
        for (k, v) in envelope.headers.attributes() {
            amqp_headers.insert(k, v);
        }

        let properties = BasicProperties::default()
            .with_headers(amqp_headers)
            .with_delivery_mode(2); // persistent

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                "",
                envelope.headers.routing_key(),
                BasicPublishOptions::default(),
                envelope.message.to_bytes(),
                properties,
            )
            .await?
            .await?;

        Ok(())
    }
}

/// Provides the routing key used when publishing to RabbitMQ.
///
/// This trait is intentionally minimal to avoid coupling the envelope
/// headers to RabbitMQ-specific types.
pub trait RoutingKey {
    /// Return the routing key for the message.
    fn routing_key(&self) -> &str;
}

/// Provides AMQP-compatible message attributes.
///
/// Implementations should return key-value pairs that can be safely
/// converted into RabbitMQ headers.
///
/// ## Notes
///
/// - Keys must be valid AMQP short strings
/// - Values must be supported `AMQPValue`s
/// - The iterator is consumed during message publishing
pub trait RabbitMqAttributes {
    /// Iterator over AMQP header key-value pairs.
    fn attributes(&self) -> impl Iterator<Item = (ShortString, AMQPValue)>;
}

impl RoutingKey for OutboundHeaders {
    fn routing_key(&self) -> &str {
        &self.queue
    }
}

impl RabbitMqAttributes for OutboundHeaders {
    /// Retry publishes carry the incremented attempt count; dead-letter
    /// publishes carry the failure classification and reason.
    fn attributes(&self) -> impl Iterator<Item = (ShortString, AMQPValue)> {
        let headers: Vec<(ShortString, AMQPValue)> = match &self.kind {
            DeliveryKind::Reply => Vec::new(),
            DeliveryKind::Retry { attempt } => vec![(
                ShortString::from(ATTEMPT_HEADER),
                AMQPValue::LongUInt(*attempt),
            )],
            DeliveryKind::DeadLetter { class, reason } => vec![
                (
                    ShortString::from(FAILURE_CLASS_HEADER),
                    AMQPValue::LongString(class.as_str().into()),
                ),
                (
                    ShortString::from(FAILURE_REASON_HEADER),
                    AMQPValue::LongString(reason.as_str().into()),
                ),
            ],
        };
        headers.into_iter()
    }
}
