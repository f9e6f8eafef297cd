use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::source::{Delivery, Settle, Source};

/// In-memory source for testing or local pipelines.
///
/// Deliveries are pushed through an [`InMemoryHandle`], which also records
/// how each one was settled so tests can assert on acknowledgment behavior.
pub struct InMemorySource {
    receiver: mpsc::Receiver<QueuedDelivery>,
    outcomes: Arc<Mutex<Vec<Settlement>>>,
}

/// Producer/inspection side of an [`InMemorySource`].
#[derive(Clone)]
pub struct InMemoryHandle {
    sender: mpsc::Sender<QueuedDelivery>,
    outcomes: Arc<Mutex<Vec<Settlement>>>,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    Discarded,
}

struct QueuedDelivery {
    payload: Vec<u8>,
    attempt: u32,
}

impl InMemorySource {
    /// Create a source with the given channel capacity, returning the
    /// producer handle alongside it.
    pub fn new(capacity: usize) -> (Self, InMemoryHandle) {
        let (sender, receiver) = mpsc::channel(capacity);
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let handle = InMemoryHandle {
            sender,
            outcomes: Arc::clone(&outcomes),
        };
        (Self { receiver, outcomes }, handle)
    }
}

impl InMemoryHandle {
    /// Enqueue a first-attempt delivery.
    pub async fn push(&self, payload: impl Into<Vec<u8>>) {
        self.push_attempt(payload, 0).await;
    }

    /// Enqueue a delivery with an explicit attempt count.
    pub async fn push_attempt(&self, payload: impl Into<Vec<u8>>, attempt: u32) {
        self.sender
            .send(QueuedDelivery {
                payload: payload.into(),
                attempt,
            })
            .await
            .expect("in-memory source dropped");
    }

    /// Settlements recorded so far, in settlement order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.outcomes
            .lock()
            .expect("settlement log poisoned")
            .clone()
    }
}

#[async_trait]
impl Source for InMemorySource {
    type Error = std::io::Error;

    /// Stream queued deliveries until cancellation or until every handle is
    /// dropped.
    async fn deliveries(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Delivery, Self::Error>>, Self::Error> {
        let outcomes = Arc::clone(&self.outcomes);
        let receiver = &mut self.receiver;

        let stream = async_stream::stream! {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    queued = receiver.recv() => {
                        let Some(queued) = queued else { break };
                        yield Ok(Delivery::new(
                            queued.payload,
                            queued.attempt,
                            Box::new(RecordingSettler {
                                outcomes: Arc::clone(&outcomes),
                            }),
                        ));
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

struct RecordingSettler {
    outcomes: Arc<Mutex<Vec<Settlement>>>,
}

#[async_trait]
impl Settle for RecordingSettler {
    async fn ack(self: Box<Self>) -> Result<(), tower::BoxError> {
        self.outcomes
            .lock()
            .expect("settlement log poisoned")
            .push(Settlement::Acked);
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), tower::BoxError> {
        self.outcomes
            .lock()
            .expect("settlement log poisoned")
            .push(if requeue {
                Settlement::Requeued
            } else {
                Settlement::Discarded
            });
        Ok(())
    }
}
