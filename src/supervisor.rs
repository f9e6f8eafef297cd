//! Connection supervision: reconnect with backoff until cancellation.
//!
//! The [`Consumer`](crate::consumer::Consumer) runs one broker session; when
//! that session breaks (connection refused, channel error, subscription
//! cancelled by the broker), the [`Supervisor`] rebuilds it after a capped
//! exponential backoff. A session that stays healthy long enough resets the
//! backoff, so a broker that flaps once does not penalize the next outage.
//!
//! Unsettled deliveries from a broken session are redelivered by the broker
//! on the next one; supervision never loses messages, only time.

use std::time::Duration;

use rand::Rng;

/// Capped exponential reconnect backoff with half-to-full jitter.
///
/// `delay()` returns the wait before the next attempt and advances the
/// schedule; `reset()` returns to the base delay after a period of
/// stability. Jitter keeps a fleet of workers from reconnecting in
/// lockstep after a broker restart.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            consecutive_failures: 0,
        }
    }

    /// The delay before the next reconnect attempt.
    pub fn delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.consecutive_failures))
            .min(self.cap);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let jittered = rand::thread_rng().gen_range(exp.as_millis() / 2..=exp.as_millis());
        Duration::from_millis(jittered as u64)
    }

    /// Return to the base delay.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(feature = "rabbitmq")]
pub use amqp::Supervisor;

#[cfg(feature = "rabbitmq")]
mod amqp {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use lapin::options::{BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions};
    use lapin::types::FieldTable;
    use lapin::{Connection, ConnectionProperties};
    use tokio_util::sync::CancellationToken;

    use super::Backoff;
    use crate::config::Config;
    use crate::consumer::{Consumer, ConversationHandler};
    use crate::source::rabbitmq::RabbitMqSource;
    use crate::transport::layers::PublishLogLayer;
    use crate::transport::{Transport, rabbitmq::RabbitMq};

    /// A session must outlive this to count as stable and reset the backoff.
    const STABLE_SESSION: Duration = Duration::from_secs(60);
    /// First reconnect delay.
    const RECONNECT_BASE: Duration = Duration::from_millis(500);
    /// Reconnect delay ceiling.
    const RECONNECT_CAP: Duration = Duration::from_secs(30);

    /// Runs broker sessions in a loop until cancellation.
    pub struct Supervisor<H> {
        config: Config,
        handler: Arc<H>,
    }

    impl<H> Supervisor<H>
    where
        H: ConversationHandler + 'static,
    {
        pub fn new(config: Config, handler: Arc<H>) -> Self {
            Self { config, handler }
        }

        /// Run sessions until `cancel` fires, reconnecting on any session
        /// failure. Message-level failures never reach this loop; they are
        /// resolved inside the pipeline by the retry policy.
        #[tracing::instrument(skip_all)]
        pub async fn run(self, cancel: CancellationToken) {
            let mut backoff = Backoff::new(RECONNECT_BASE, RECONNECT_CAP);

            while !cancel.is_cancelled() {
                let started = Instant::now();
                match self.session(cancel.clone()).await {
                    Ok(()) if cancel.is_cancelled() => break,
                    Ok(()) => tracing::warn!("Subscription ended, reconnecting"),
                    Err(error) => tracing::error!(%error, "Broker session failed"),
                }

                if started.elapsed() >= STABLE_SESSION {
                    backoff.reset();
                }
                let delay = backoff.delay();
                tracing::info!(?delay, "Waiting before reconnect");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        /// Establish one broker session and run the pipeline on it.
        ///
        /// Queues are declared durable on every connect so the worker can
        /// start before the broker has ever seen them. Consuming and
        /// publishing use separate channels: a publisher confirm must not
        /// contend with the consumer's flow control.
        async fn session(&self, cancel: CancellationToken) -> Result<(), tower::BoxError> {
            let connection =
                Connection::connect(&self.config.amqp_url, ConnectionProperties::default()).await?;

            let consume_channel = connection.create_channel().await?;
            let publish_channel = connection.create_channel().await?;
            publish_channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;

            for queue in [
                &self.config.input_queue,
                &self.config.output_queue,
                &self.config.dead_letter_queue,
            ] {
                consume_channel
                    .queue_declare(
                        queue,
                        QueueDeclareOptions {
                            durable: true,
                            ..QueueDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
            }

            // Prefetch matches the pipeline cap: the broker never hands us
            // more than we are willing to run.
            consume_channel
                .basic_qos(
                    self.config.max_concurrency.min(u16::MAX as usize) as u16,
                    BasicQosOptions::default(),
                )
                .await?;

            let source = RabbitMqSource::new(consume_channel, self.config.input_queue.clone());
            let transport = Transport::new(RabbitMq::new(publish_channel)).layer(PublishLogLayer);
            let consumer = Consumer::new(
                source,
                transport,
                Arc::clone(&self.handler),
                self.config.consumer_config(),
            );

            consumer.run(cancel).await?;
            Ok(())
        }
    }
}
