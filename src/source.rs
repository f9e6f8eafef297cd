//! Inbound subscription abstractions and backends.
//!
//! A [`Source`] yields raw [`Delivery`] values from a durable queue. Each
//! delivery carries the payload bytes, the attempt count derived from broker
//! metadata, and an exclusive settlement handle: the delivery must be either
//! [`ack`](Delivery::ack)ed or [`reject`](Delivery::reject)ed exactly once.
//! A delivery dropped unsettled is redelivered by the broker once the
//! session closes, which is what makes the pipeline at-least-once.
//!
//! ## Backends
//!
//! - [`inmemory`]: channel-backed source for tests and local pipelines
//! - [`rabbitmq`]: AMQP consumer (feature `rabbitmq`)

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// AMQP-style header carrying the explicit delivery attempt count.
pub const ATTEMPT_HEADER: &str = "x-attempt";

/// Trait implemented by inbound subscription backends.
#[async_trait]
pub trait Source {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Subscribe and stream deliveries until cancellation or a
    /// connection-level failure.
    ///
    /// A stream item of `Err` is a session-level condition (the subscription
    /// is broken), not a per-message failure; the caller is expected to stop
    /// consuming and let its supervisor re-establish the session.
    async fn deliveries(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Delivery, Self::Error>>, Self::Error>;
}

/// One raw delivery pulled from the queue.
///
/// The settlement handle is owned exclusively by this value; consuming
/// [`ack`](Self::ack) / [`reject`](Self::reject) methods make double
/// settlement unrepresentable.
pub struct Delivery {
    /// Raw payload bytes as they arrived on the wire.
    pub payload: Vec<u8>,
    /// Prior delivery attempts (0 for a first delivery).
    pub attempt: u32,
    settler: Box<dyn Settle>,
}

impl Delivery {
    /// Wrap a payload with its settlement handle.
    pub fn new(payload: Vec<u8>, attempt: u32, settler: Box<dyn Settle>) -> Self {
        Self {
            payload,
            attempt,
            settler,
        }
    }

    /// Acknowledge the delivery: the broker removes it permanently.
    pub async fn ack(self) -> Result<(), tower::BoxError> {
        self.settler.ack().await
    }

    /// Reject the delivery. With `requeue` the broker makes it eligible for
    /// redelivery; without, the broker discards it (or applies its own
    /// dead-letter routing).
    pub async fn reject(self, requeue: bool) -> Result<(), tower::BoxError> {
        self.settler.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Broker-specific settlement of a single delivery.
#[async_trait]
pub trait Settle: Send {
    async fn ack(self: Box<Self>) -> Result<(), tower::BoxError>;
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), tower::BoxError>;
}
