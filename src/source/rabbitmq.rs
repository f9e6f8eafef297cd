use async_trait::async_trait;
use futures_core::stream::BoxStream;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::{AMQPValue, FieldTable};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::source::{ATTEMPT_HEADER, Delivery, Settle, Source};

/// RabbitMQ subscription source.
///
/// Consumes one durable queue over a shared `lapin::Channel`. The channel's
/// prefetch (set by the connection supervisor) bounds how many unsettled
/// deliveries the broker pushes at once, which is what ties broker-side flow
/// control to the pipeline's worker-pool size.
///
/// ## Mapping
///
/// - `Delivery.data` → payload bytes
/// - `x-attempt` header → attempt count; absent, the `redelivered` flag
///   still counts as one prior attempt
/// - `Delivery.acker` → the exclusive settlement handle
pub struct RabbitMqSource {
    channel: lapin::Channel,
    queue: String,
    consumer_tag: String,
}

impl RabbitMqSource {
    /// Create a source consuming `queue` on `channel`.
    pub fn new(channel: lapin::Channel, queue: impl Into<String>) -> Self {
        Self {
            channel,
            queue: queue.into(),
            consumer_tag: "courier".to_owned(),
        }
    }

    /// Set the consumer tag announced to the broker.
    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }
}

#[async_trait]
impl Source for RabbitMqSource {
    type Error = lapin::Error;

    /// Subscribe and stream deliveries.
    ///
    /// The stream ends on cancellation; a broken subscription surfaces as an
    /// `Err` item, after which the supervisor is expected to rebuild the
    /// session.
    async fn deliveries(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Delivery, Self::Error>>, Self::Error> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let stream = async_stream::stream! {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = consumer.next() => {
                        let Some(next) = next else { break };
                        match next {
                            Ok(delivery) => yield Ok(from_amqp(delivery)),
                            Err(err) => {
                                yield Err(err);
                                break;
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn from_amqp(delivery: AmqpDelivery) -> Delivery {
    let attempt = attempt_count(&delivery);
    Delivery::new(
        delivery.data,
        attempt,
        Box::new(AmqpSettler {
            acker: delivery.acker,
        }),
    )
}

/// Derive the attempt count: the explicit `x-attempt` header wins; without
/// it the boolean `redelivered` flag can only prove one prior attempt.
fn attempt_count(delivery: &AmqpDelivery) -> u32 {
    let header = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(ATTEMPT_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongUInt(n) => Some(*n),
            _ => None,
        });

    match header {
        Some(attempt) => attempt,
        None if delivery.redelivered => 1,
        None => 0,
    }
}

struct AmqpSettler {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Settle for AmqpSettler {
    async fn ack(self: Box<Self>) -> Result<(), tower::BoxError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), tower::BoxError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}
