use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{Envelope, transport::Sender};

/// In-memory transport for testing or local pipelines.
///
/// This transport stores published envelopes in a shared queue and
/// implements the [`Sender`] trait. It is useful for:
/// - Unit and integration testing
/// - Simulating message delivery without a real broker
/// - Debugging message flows
///
/// Clones share the same queue, so a test can hand one clone to the
/// pipeline and keep another for inspection. A failure switch simulates a
/// broker that refuses publishes.
///
/// ## Type Parameters
///
/// - `H`: type of the message headers
/// - `M`: type of the message payload
pub struct InMemory<H, M> {
    /// Shared publish log.
    msg_queue: Arc<Mutex<Vec<Envelope<H, M>>>>,
    /// When set, every send fails.
    fail: Arc<AtomicBool>,
}

impl<H, M> InMemory<H, M> {
    /// Snapshot of everything published so far, in publish order.
    pub async fn sent(&self) -> Vec<Envelope<H, M>>
    where
        H: Clone,
        M: Clone,
    {
        self.msg_queue.lock().await.clone()
    }

    /// Toggle publish failure simulation.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

impl<M, H> Clone for InMemory<H, M> {
    fn clone(&self) -> Self {
        Self {
            msg_queue: Arc::clone(&self.msg_queue),
            fail: Arc::clone(&self.fail),
        }
    }
}

impl<H, M> Default for InMemory<H, M> {
    /// Create a new empty in-memory transport.
    fn default() -> Self {
        Self {
            msg_queue: Arc::new(Mutex::new(Vec::new())),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait::async_trait]
impl<H, M> Sender<H, M> for InMemory<H, M>
where
    H: Clone + std::fmt::Debug + Send,
    M: Clone + std::fmt::Debug + Send,
{
    type Error = std::io::Error;

    /// "Send" a message by appending it to the in-memory queue.
    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "simulated publish failure",
            ));
        }

        let mut queue = self.msg_queue.lock().await;
        queue.push(envelope.clone());
        tracing::debug!(
            headers = ?envelope.headers,
            msg = ?envelope.message,
            "Message sent to in-memory queue",
        );
        Ok(())
    }
}
