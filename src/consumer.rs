//! Delivery pipeline: receive → decode → admit → handle → publish → settle.
//!
//! The [`Consumer`] pulls raw deliveries from a [`Source`], decodes them,
//! admits them through the [`KeySerializer`] (per-conversation ordering,
//! global cap), invokes the [`ConversationHandler`], and settles each
//! delivery according to the outcome:
//!
//! - success → encode the reply, publish it, then acknowledge
//!   (**ack-after-publish**: a failed publish leaves the delivery
//!   redeliverable, never silently dropped)
//! - transient failure with attempts remaining → republish to the input
//!   queue with an incremented attempt header after a backoff delay, then
//!   acknowledge the original
//! - permanent failure or exhausted retries → publish to the dead-letter
//!   queue with the failure class and reason attached, then acknowledge
//! - hard decode failure → dead-letter immediately (malformed input cannot
//!   be retried into validity)
//!
//! No per-message failure terminates the run; only cancellation, the end of
//! the subscription, or a session-level source error does. Because
//! acknowledgment follows publication, a crash between the two can
//! duplicate a reply on redelivery — the accepted at-least-once trade-off.
//!
//! The consumer runs until cancellation, stream end, or a source error, and
//! then drains: in-flight tasks get a bounded timeout to finish, after
//! which they are aborted and their deliveries stay unacknowledged for
//! redelivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::codec;
use crate::limiter::{KeySerializer, PendingAdmission};
use crate::message::{ConversationKey, InboundMessage, OutboundMessage};
use crate::policy::{FailureClass, HandlerError, RetryPolicy, Verdict};
use crate::source::{Delivery, Source};
use crate::transport::{OutboundHeaders, RawPayload, Transport};
use crate::Envelope;

/// External collaborator boundary: turns one inbound message into a reply.
///
/// Implementations may take arbitrarily long and may fail transiently; they
/// must be safe to invoke concurrently for different conversation keys. The
/// pipeline guarantees they are never invoked concurrently for the same
/// key.
#[async_trait::async_trait]
pub trait ConversationHandler: Send + Sync {
    /// Produce the reply text for `message`.
    async fn handle(&self, message: &InboundMessage) -> Result<String, HandlerError>;
}

/// Queue names the pipeline publishes to.
#[derive(Debug, Clone)]
pub struct Routes {
    /// Queue deliveries arrive on; retries are republished here.
    pub input: String,
    /// Queue replies are published to.
    pub output: String,
    /// Queue unprocessable deliveries are routed to.
    pub dead_letter: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            input: "incoming.messages".to_owned(),
            output: "messages.to_send".to_owned(),
            dead_letter: "messages.dead_letter".to_owned(),
        }
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub routes: Routes,
    /// Global in-flight task cap (also the recommended broker prefetch).
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// How long in-flight tasks may keep running after cancellation before
    /// they are aborted.
    pub shutdown_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(routes: Routes) -> Self {
        Self {
            routes,
            max_concurrency: 16,
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// The delivery pipeline.
///
/// Generic parameters:
/// - `S`: inbound [`Source`]
/// - `T`: outbound transport service type
/// - `H`: the [`ConversationHandler`]
/// - `HK`: hook implementation for lifecycle events
pub struct Consumer<S, T, H, HK> {
    source: S,
    transport: Transport<T>,
    handler: Arc<H>,
    config: ConsumerConfig,
    hook: Arc<HK>,
}

impl<S, T, H> Consumer<S, T, H, DefaultConsumerHook> {
    /// Create a consumer with the default hook implementation.
    pub fn new(
        source: S,
        transport: Transport<T>,
        handler: Arc<H>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            transport,
            handler,
            config,
            hook: Arc::new(DefaultConsumerHook),
        }
    }
}

impl<S, T, H, HK> Consumer<S, T, H, HK>
where
    S: Source + Send,
    T: Service<Envelope<OutboundHeaders, RawPayload>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
    H: ConversationHandler + 'static,
    HK: ConsumerHook + 'static,
{
    /// Replace the consumer hook while keeping all other generics unchanged.
    ///
    /// This allows customizing behavior (logging, metrics, alerting)
    /// without rebuilding the consumer.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<S, T, H, HK2> {
        Consumer {
            source: self.source,
            transport: self.transport,
            handler: self.handler,
            config: self.config,
            hook: Arc::new(hook),
        }
    }

    /// Run the pipeline until cancellation, stream end, or a session-level
    /// source error.
    ///
    /// Message-level failures never surface here; they resolve through the
    /// retry/dead-letter policy. A returned error means the subscription
    /// itself broke and the caller (normally the connection supervisor)
    /// should rebuild the session.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumerRunError> {
        let Consumer {
            mut source,
            transport,
            handler,
            config,
            hook,
        } = self;

        hook.on_startup();
        let limiter = KeySerializer::new(config.max_concurrency);
        let mut tasks = JoinSet::new();

        let result = {
            let mut stream = source
                .deliveries(cancel.clone())
                .await
                .map_err(|e| ConsumerRunError::source(e.into()))?;

            loop {
                // Reap finished tasks so the set does not grow unbounded.
                while tasks.try_join_next().is_some() {}

                tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    next = stream.next() => match next {
                        None => break Ok(()),
                        Some(Err(err)) => {
                            let err = err.into();
                            hook.on_subscription_error(err.as_ref());
                            break Err(ConsumerRunError::source(err));
                        }
                        Some(Ok(delivery)) => {
                            hook.on_delivery(delivery.attempt);

                            match codec::decode(&delivery.payload, delivery.attempt) {
                                Ok(inbound) => {
                                    // Register before spawning: queue position
                                    // within the key is fixed by arrival order,
                                    // not by task scheduling.
                                    let pending = limiter.begin(inbound.conversation_key.clone());
                                    tasks.spawn(process(
                                        pending,
                                        inbound,
                                        delivery,
                                        transport.clone(),
                                        Arc::clone(&handler),
                                        config.routes.clone(),
                                        config.retry,
                                        Arc::clone(&hook),
                                    ));
                                }
                                Err(err) => {
                                    hook.on_decode_error(&err);
                                    let reason = err.reason();
                                    let headers = OutboundHeaders::dead_letter(
                                        &config.routes.dead_letter,
                                        FailureClass::Permanent,
                                        reason.clone(),
                                    );
                                    let mut transport = transport.clone();
                                    let hook = Arc::clone(&hook);
                                    let body = delivery.payload.clone();
                                    tasks.spawn(async move {
                                        let published = publish_then_settle(
                                            &mut transport,
                                            hook.as_ref(),
                                            headers,
                                            body,
                                            delivery,
                                        )
                                        .await;
                                        if published {
                                            hook.on_dead_letter(
                                                None,
                                                FailureClass::Permanent,
                                                &reason,
                                            );
                                        }
                                    });
                                }
                            }
                        }
                    }
                }
            }
        };

        hook.on_draining(tasks.len());
        let drained = tokio::time::timeout(config.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            // Aborted tasks leave their deliveries unacknowledged; the
            // broker redelivers them on the next session.
            hook.on_drain_timeout(tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        limiter.close();
        hook.on_shutdown();
        result
    }
}

/// One delivery, from admission to settlement.
#[allow(clippy::too_many_arguments)]
async fn process<T, H, HK>(
    pending: PendingAdmission,
    inbound: InboundMessage,
    delivery: Delivery,
    mut transport: Transport<T>,
    handler: Arc<H>,
    routes: Routes,
    retry: RetryPolicy,
    hook: Arc<HK>,
) where
    T: Service<Envelope<OutboundHeaders, RawPayload>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
    H: ConversationHandler + 'static,
    HK: ConsumerHook + 'static,
{
    let ticket = match pending.admitted().await {
        Ok(ticket) => ticket,
        Err(_) => {
            // Shutdown raced the admission; leave the delivery redeliverable.
            if let Err(err) = delivery.reject(true).await {
                hook.on_settle_error(err.as_ref());
            }
            return;
        }
    };

    // The handler runs in its own task so a panic is contained and
    // classified transient instead of tearing down the pipeline task.
    let outcome = {
        let handler = Arc::clone(&handler);
        let message = inbound.clone();
        let join = tokio::spawn(async move { handler.handle(&message).await });
        // If this task is aborted mid-drain, the handler must die with it:
        // an orphaned invocation would otherwise run concurrently with the
        // redelivered message in the next session.
        let _abort_on_drop = AbortOnDrop(join.abort_handle());
        match join.await {
            Ok(result) => result,
            Err(join_error) => Err(HandlerError::transient(join_error)),
        }
    };

    match outcome {
        Ok(reply_text) => {
            let outbound = OutboundMessage::reply_to(&inbound, reply_text);
            let wire = codec::encode(&outbound);
            let published = publish_then_settle(
                &mut transport,
                hook.as_ref(),
                OutboundHeaders::reply(&routes.output),
                wire,
                delivery,
            )
            .await;
            if published {
                hook.on_reply_published(&inbound.conversation_key);
            }
        }
        Err(error) => match retry.verdict(error.class(), inbound.attempt) {
            Verdict::Retry { delay } => {
                let next_attempt = inbound.attempt + 1;
                hook.on_retry_scheduled(&inbound.conversation_key, next_attempt, delay);
                // Backoff while holding the ticket so a newer message for
                // this key cannot overtake the retry decision.
                tokio::time::sleep(delay).await;
                let body = delivery.payload.clone();
                publish_then_settle(
                    &mut transport,
                    hook.as_ref(),
                    OutboundHeaders::retry(&routes.input, next_attempt),
                    body,
                    delivery,
                )
                .await;
            }
            Verdict::DeadLetter => {
                let reason = error.reason();
                let body = delivery.payload.clone();
                let published = publish_then_settle(
                    &mut transport,
                    hook.as_ref(),
                    OutboundHeaders::dead_letter(
                        &routes.dead_letter,
                        error.class(),
                        reason.clone(),
                    ),
                    body,
                    delivery,
                )
                .await;
                if published {
                    hook.on_dead_letter(Some(&inbound.conversation_key), error.class(), &reason);
                }
            }
        },
    }

    drop(ticket);
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Publish, then settle: acknowledge on confirmed publish, reject with
/// requeue otherwise. Returns whether the publish succeeded.
async fn publish_then_settle<T, HK>(
    transport: &mut Transport<T>,
    hook: &HK,
    headers: OutboundHeaders,
    body: Vec<u8>,
    delivery: Delivery,
) -> bool
where
    T: Service<Envelope<OutboundHeaders, RawPayload>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
    HK: ConsumerHook,
{
    let envelope = Envelope {
        headers,
        message: RawPayload::from(body),
    };

    match transport.send(envelope).await {
        Ok(()) => {
            if let Err(err) = delivery.ack().await {
                hook.on_settle_error(err.as_ref());
            }
            true
        }
        Err(err) => {
            hook.on_publish_error(&err);
            if let Err(err) = delivery.reject(true).await {
                hook.on_settle_error(err.as_ref());
            }
            false
        }
    }
}

/// Error returned when the consumer loop fails.
#[derive(Debug)]
pub struct ConsumerRunError {
    context: tracing_error::SpanTrace,
    source: tower::BoxError,
}

impl ConsumerRunError {
    fn source(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            source: error,
        }
    }
}

impl std::fmt::Display for ConsumerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Subscription error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and alerting integration.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_delivery(&self, attempt: u32);
    fn on_decode_error(&self, error: &dyn std::error::Error);
    fn on_reply_published(&self, key: &ConversationKey);
    fn on_retry_scheduled(&self, key: &ConversationKey, attempt: u32, delay: Duration);
    fn on_dead_letter(&self, key: Option<&ConversationKey>, class: FailureClass, reason: &str);
    fn on_publish_error(&self, error: &dyn std::error::Error);
    fn on_settle_error(&self, error: &dyn std::error::Error);
    fn on_subscription_error(&self, error: &dyn std::error::Error);
    fn on_draining(&self, in_flight: usize);
    fn on_drain_timeout(&self, remaining: usize);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up, waiting for messages");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_delivery(&self, attempt: u32) {
        tracing::debug!(attempt, "Delivery received");
    }

    fn on_decode_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Failed to decode envelope");
    }

    fn on_reply_published(&self, key: &ConversationKey) {
        tracing::info!(%key, "Reply published");
    }

    fn on_retry_scheduled(&self, key: &ConversationKey, attempt: u32, delay: Duration) {
        tracing::warn!(%key, attempt, ?delay, "Transient failure, retry scheduled");
    }

    fn on_dead_letter(&self, key: Option<&ConversationKey>, class: FailureClass, reason: &str) {
        tracing::error!(
            key = key.map(ConversationKey::as_str),
            class = class.as_str(),
            reason,
            "Delivery dead-lettered",
        );
    }

    fn on_publish_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Failed to publish, leaving delivery for redelivery");
    }

    fn on_settle_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Failed to settle delivery");
    }

    fn on_subscription_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Subscription broken");
    }

    fn on_draining(&self, in_flight: usize) {
        tracing::info!(in_flight, "Draining in-flight deliveries");
    }

    fn on_drain_timeout(&self, remaining: usize) {
        tracing::warn!(remaining, "Drain timeout, aborting remaining tasks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use rand::Rng;
    use serde_json::{Value, json};

    use crate::source::inmemory::{InMemoryHandle, InMemorySource, Settlement};
    use crate::transport::layers::PublishLogLayer;
    use crate::transport::{DeliveryKind, InMemory};

    type TestTransport = InMemory<OutboundHeaders, RawPayload>;

    fn wire_envelope(wa_id: &str, body: &str) -> Vec<u8> {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "display_phone_number": "15550001111" },
                        "contacts": [{ "wa_id": wa_id, "profile": { "name": "Ada" } }],
                        "messages": [{ "text": { "body": body } }],
                    }
                }]
            }]
        })
        .to_string()
        .into_bytes()
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig::new(Routes::default())
            .with_max_concurrency(8)
            .with_retry(RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(2),
            })
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Handler recording every invocation, with optional random latency.
    struct Recording {
        calls: StdMutex<Vec<(String, Option<String>)>>,
        jitter: bool,
        result: Box<dyn Fn(u32) -> Result<String, HandlerError> + Send + Sync>,
        invocations: AtomicU32,
    }

    impl Recording {
        fn echo() -> Self {
            Self::with_result(|_| Ok("echo".to_owned()))
        }

        fn with_result(
            result: impl Fn(u32) -> Result<String, HandlerError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                jitter: false,
                result: Box::new(result),
                invocations: AtomicU32::new(0),
            }
        }

        fn with_jitter(mut self) -> Self {
            self.jitter = true;
            self
        }

        fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ConversationHandler for Recording {
        async fn handle(&self, message: &InboundMessage) -> Result<String, HandlerError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.jitter {
                let latency = rand::thread_rng().gen_range(0..5);
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            self.calls.lock().unwrap().push((
                message.conversation_key.as_str().to_owned(),
                message.text.clone(),
            ));
            (self.result)(n)
        }
    }

    struct Running {
        cancel: CancellationToken,
        join: tokio::task::JoinHandle<Result<(), ConsumerRunError>>,
    }

    impl Running {
        async fn stop(self) -> Result<(), ConsumerRunError> {
            self.cancel.cancel();
            self.join.await.expect("consumer task panicked")
        }
    }

    fn start(
        handler: Arc<Recording>,
        config: ConsumerConfig,
    ) -> (Running, InMemoryHandle, TestTransport) {
        let (source, handle) = InMemorySource::new(64);
        let sender = TestTransport::default();
        let transport = Transport::new(sender.clone()).layer(PublishLogLayer);
        let consumer = Consumer::new(source, transport, handler, config);

        let cancel = CancellationToken::new();
        let join = tokio::spawn(consumer.run(cancel.clone()));
        (Running { cancel, join }, handle, sender)
    }

    #[tokio::test]
    async fn reply_is_published_then_acked() {
        let handler = Arc::new(Recording::with_result(|_| Ok("the answer".to_owned())));
        let (running, handle, sender) = start(Arc::clone(&handler), test_config());

        handle.push(wire_envelope("15559998888", "a question")).await;
        wait_until(|| handle.settlements().len() == 1).await;

        assert_eq!(handle.settlements(), vec![Settlement::Acked]);
        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.queue, "messages.to_send");
        assert_eq!(sent[0].headers.kind, DeliveryKind::Reply);

        // Reply merged into a copy of the original envelope.
        let wire: Value = serde_json::from_slice(sent[0].message.as_bytes()).unwrap();
        assert_eq!(wire["content"]["text"]["body"], "the answer");
        assert_eq!(wire["object"], "whatsapp_business_account");

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn publish_failure_leaves_delivery_redeliverable() {
        let handler = Arc::new(Recording::echo());
        let (running, handle, sender) = start(Arc::clone(&handler), test_config());

        sender.set_failing(true);
        handle.push(wire_envelope("15559998888", "hello")).await;
        wait_until(|| handle.settlements().len() == 1).await;

        // Never acked: requeued for redelivery, nothing published.
        assert_eq!(handle.settlements(), vec![Settlement::Requeued]);
        assert!(sender.sent().await.is_empty());

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_exactly_once() {
        let handler = Arc::new(Recording::with_result(|_| {
            Err(HandlerError::permanent("bad business data"))
        }));
        let (running, handle, sender) = start(Arc::clone(&handler), test_config());

        handle.push(wire_envelope("15559998888", "hello")).await;
        wait_until(|| handle.settlements().len() == 1).await;

        // One dead-letter entry, one ack, zero redeliveries.
        assert_eq!(handle.settlements(), vec![Settlement::Acked]);
        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.queue, "messages.dead_letter");
        assert_eq!(
            sent[0].headers.kind,
            DeliveryKind::DeadLetter {
                class: FailureClass::Permanent,
                reason: "bad business data".to_owned(),
            }
        );
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 1);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_retry_until_exhaustion() {
        let handler = Arc::new(Recording::with_result(|_| {
            Err(HandlerError::transient("agent unreachable"))
        }));
        let (running, handle, sender) = start(Arc::clone(&handler), test_config());

        // Feed retries back into the source the way the broker would.
        handle.push(wire_envelope("15559998888", "hello")).await;
        let mut settled = 0;
        let dead_lettered = loop {
            wait_until(|| handle.settlements().len() > settled).await;
            settled = handle.settlements().len();

            let sent = sender.sent().await;
            let last = sent.last().expect("each settlement publishes");
            match &last.headers.kind {
                DeliveryKind::Retry { attempt } => {
                    assert_eq!(last.headers.queue, "incoming.messages");
                    handle
                        .push_attempt(last.message.as_bytes().to_vec(), *attempt)
                        .await;
                }
                DeliveryKind::DeadLetter { class, .. } => {
                    assert_eq!(*class, FailureClass::Transient);
                    break sent.len();
                }
                DeliveryKind::Reply => panic!("handler never succeeds"),
            }
        };

        // max_attempts = 3: two retry publishes, then the dead letter.
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 3);
        assert_eq!(dead_lettered, 3);
        assert!(handle
            .settlements()
            .iter()
            .all(|s| *s == Settlement::Acked));

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_dead_letters_without_handler() {
        let handler = Arc::new(Recording::echo());
        let (running, handle, sender) = start(Arc::clone(&handler), test_config());

        handle.push(b"{definitely not json".to_vec()).await;
        wait_until(|| handle.settlements().len() == 1).await;

        assert_eq!(handle.settlements(), vec![Settlement::Acked]);
        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].headers.queue, "messages.dead_letter");
        assert!(matches!(
            &sent[0].headers.kind,
            DeliveryKind::DeadLetter { class: FailureClass::Permanent, .. }
        ));
        // Original payload passed through untouched.
        assert_eq!(sent[0].message.as_bytes(), b"{definitely not json");
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 0);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn envelope_without_messages_still_reaches_handler() {
        let handler = Arc::new(Recording::echo());
        let (running, handle, _sender) = start(Arc::clone(&handler), test_config());

        let raw = json!({ "entry": [{ "changes": [{ "value": { "messages": [] } }] }] })
            .to_string()
            .into_bytes();
        handle.push(raw).await;
        wait_until(|| handle.settlements().len() == 1).await;

        let calls = handler.calls();
        assert_eq!(calls, vec![("unknown.unknown".to_owned(), None)]);
        assert_eq!(handle.settlements(), vec![Settlement::Acked]);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn same_conversation_is_processed_in_arrival_order() {
        let handler = Arc::new(Recording::echo().with_jitter());
        let (running, handle, _sender) = start(Arc::clone(&handler), test_config());

        for i in 0..10 {
            handle
                .push(wire_envelope("15559998888", &format!("turn {i}")))
                .await;
        }
        wait_until(|| handle.settlements().len() == 10).await;

        let texts: Vec<_> = handler
            .calls()
            .into_iter()
            .map(|(_, text)| text.unwrap())
            .collect();
        let expected: Vec<_> = (0..10).map(|i| format!("turn {i}")).collect();
        assert_eq!(texts, expected);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn distinct_conversations_are_parallel() {
        // Handler that blocks until all participants have arrived; passes
        // only if the pipeline admits the conversations concurrently.
        struct Rendezvous(tokio::sync::Barrier);

        #[async_trait::async_trait]
        impl ConversationHandler for Rendezvous {
            async fn handle(&self, _message: &InboundMessage) -> Result<String, HandlerError> {
                self.0.wait().await;
                Ok("together".to_owned())
            }
        }

        let participants = 4;
        let handler = Arc::new(Rendezvous(tokio::sync::Barrier::new(participants)));

        let (source, handle) = InMemorySource::new(64);
        let sender = TestTransport::default();
        let transport = Transport::new(sender.clone());
        let consumer = Consumer::new(
            source,
            transport,
            handler,
            test_config().with_max_concurrency(participants),
        );
        let cancel = CancellationToken::new();
        let join = tokio::spawn(consumer.run(cancel.clone()));

        for i in 0..participants {
            handle.push(wire_envelope(&format!("1555000{i}"), "hi")).await;
        }

        // Deadlocks (and times out) if any conversation is serialized
        // behind another.
        wait_until(|| handle.settlements().len() == participants).await;

        cancel.cancel();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handler_panic_is_contained_and_retried() {
        let handler = Arc::new(Recording::with_result(|n| {
            if n == 0 {
                panic!("handler blew up");
            }
            Ok("recovered".to_owned())
        }));
        let (running, handle, sender) = start(Arc::clone(&handler), test_config());

        handle.push(wire_envelope("15559998888", "hello")).await;
        wait_until(|| handle.settlements().len() == 1).await;

        // Panic classified transient: the delivery was republished with an
        // incremented attempt, not dead-lettered.
        let sent = sender.sent().await;
        assert_eq!(sent[0].headers.kind, DeliveryKind::Retry { attempt: 1 });

        // Redeliver; the second invocation succeeds.
        handle
            .push_attempt(sent[0].message.as_bytes().to_vec(), 1)
            .await;
        wait_until(|| handle.settlements().len() == 2).await;
        assert_eq!(
            sender.sent().await.last().unwrap().headers.kind,
            DeliveryKind::Reply
        );

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_deliveries() {
        struct Slow;

        #[async_trait::async_trait]
        impl ConversationHandler for Slow {
            async fn handle(&self, _message: &InboundMessage) -> Result<String, HandlerError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok("eventually".to_owned())
            }
        }

        let (source, handle) = InMemorySource::new(64);
        let sender = TestTransport::default();
        let transport = Transport::new(sender.clone());
        let consumer = Consumer::new(source, transport, Arc::new(Slow), test_config());
        let cancel = CancellationToken::new();
        let join = tokio::spawn(consumer.run(cancel.clone()));

        handle.push(wire_envelope("15559998888", "hello")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        join.await.unwrap().unwrap();

        // The in-flight delivery finished and was settled during the drain.
        assert_eq!(handle.settlements(), vec![Settlement::Acked]);
        assert_eq!(sender.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn drain_timeout_abort_kills_the_handler_invocation() {
        // A handler invocation orphaned by the drain-timeout abort must not
        // keep running: the broker redelivers the unsettled message to the
        // next session, and an overlap would break the one-per-key contract.
        struct Tracking {
            running: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
            calls: AtomicU32,
        }

        #[async_trait::async_trait]
        impl ConversationHandler for Tracking {
            async fn handle(&self, _message: &InboundMessage) -> Result<String, HandlerError> {
                struct InFlight(Arc<AtomicUsize>);
                impl Drop for InFlight {
                    fn drop(&mut self) {
                        self.0.fetch_sub(1, Ordering::SeqCst);
                    }
                }

                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                let _in_flight = InFlight(Arc::clone(&self.running));
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // First invocation stalls far past the drain timeout.
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok("done".to_owned())
            }
        }

        let handler = Arc::new(Tracking {
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            calls: AtomicU32::new(0),
        });
        let config = test_config().with_shutdown_timeout(Duration::from_millis(50));

        // Session one: the stalled handler outlives the drain and is aborted.
        let (source, handle) = InMemorySource::new(64);
        let consumer = Consumer::new(
            source,
            Transport::new(TestTransport::default()),
            Arc::clone(&handler),
            config.clone(),
        );
        let cancel = CancellationToken::new();
        let join = tokio::spawn(consumer.run(cancel.clone()));

        handle.push(wire_envelope("15559998888", "hello")).await;
        wait_until(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        cancel.cancel();
        join.await.unwrap().unwrap();

        // The delivery stayed unsettled and the aborted invocation is gone.
        assert!(handle.settlements().is_empty());
        wait_until(|| handler.running.load(Ordering::SeqCst) == 0).await;

        // Session two: redelivery of the same conversation must not overlap
        // with a leftover invocation from session one.
        let (source, handle) = InMemorySource::new(64);
        let consumer = Consumer::new(
            source,
            Transport::new(TestTransport::default()),
            Arc::clone(&handler),
            config,
        );
        let cancel = CancellationToken::new();
        let join = tokio::spawn(consumer.run(cancel.clone()));

        handle
            .push_attempt(wire_envelope("15559998888", "hello"), 1)
            .await;
        wait_until(|| handle.settlements().len() == 1).await;

        assert_eq!(handle.settlements(), vec![Settlement::Acked]);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);

        cancel.cancel();
        join.await.unwrap().unwrap();
    }

    /// Hook counting dead-letter and publish-failure events; everything else
    /// is a no-op.
    struct CountingHook {
        dead_letters: Arc<AtomicU32>,
        publish_errors: Arc<AtomicU32>,
    }

    impl ConsumerHook for CountingHook {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}
        fn on_delivery(&self, _attempt: u32) {}
        fn on_decode_error(&self, _error: &dyn std::error::Error) {}
        fn on_reply_published(&self, _key: &ConversationKey) {}
        fn on_retry_scheduled(&self, _key: &ConversationKey, _attempt: u32, _delay: Duration) {}
        fn on_dead_letter(
            &self,
            _key: Option<&ConversationKey>,
            _class: FailureClass,
            _reason: &str,
        ) {
            self.dead_letters.fetch_add(1, Ordering::SeqCst);
        }
        fn on_publish_error(&self, _error: &dyn std::error::Error) {
            self.publish_errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_settle_error(&self, _error: &dyn std::error::Error) {}
        fn on_subscription_error(&self, _error: &dyn std::error::Error) {}
        fn on_draining(&self, _in_flight: usize) {}
        fn on_drain_timeout(&self, _remaining: usize) {}
    }

    struct Counters {
        dead_letters: Arc<AtomicU32>,
        publish_errors: Arc<AtomicU32>,
    }

    fn start_counting(handler: Arc<Recording>) -> (Running, InMemoryHandle, TestTransport, Counters) {
        let dead_letters = Arc::new(AtomicU32::new(0));
        let publish_errors = Arc::new(AtomicU32::new(0));

        let (source, handle) = InMemorySource::new(64);
        let sender = TestTransport::default();
        let consumer = Consumer::new(
            source,
            Transport::new(sender.clone()),
            handler,
            test_config(),
        )
        .with_hook(CountingHook {
            dead_letters: Arc::clone(&dead_letters),
            publish_errors: Arc::clone(&publish_errors),
        });

        let cancel = CancellationToken::new();
        let join = tokio::spawn(consumer.run(cancel.clone()));
        (
            Running { cancel, join },
            handle,
            sender,
            Counters {
                dead_letters,
                publish_errors,
            },
        )
    }

    #[tokio::test]
    async fn dead_letter_event_waits_for_confirmed_publish() {
        let handler = Arc::new(Recording::with_result(|_| {
            Err(HandlerError::permanent("bad business data"))
        }));
        let (running, handle, sender, counters) = start_counting(handler);

        // Publish refused: the delivery is requeued and no dead-letter event
        // may be reported.
        sender.set_failing(true);
        handle.push(wire_envelope("15559998888", "hello")).await;
        wait_until(|| handle.settlements().len() == 1).await;

        assert_eq!(handle.settlements(), vec![Settlement::Requeued]);
        assert_eq!(counters.dead_letters.load(Ordering::SeqCst), 0);
        assert_eq!(counters.publish_errors.load(Ordering::SeqCst), 1);

        // Redelivery with a healthy broker dead-letters exactly once.
        sender.set_failing(false);
        handle.push(wire_envelope("15559998888", "hello")).await;
        wait_until(|| handle.settlements().len() == 2).await;

        assert_eq!(handle.settlements()[1], Settlement::Acked);
        assert_eq!(counters.dead_letters.load(Ordering::SeqCst), 1);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_dead_letter_event_waits_for_confirmed_publish() {
        let handler = Arc::new(Recording::echo());
        let (running, handle, sender, counters) = start_counting(handler);

        sender.set_failing(true);
        handle.push(b"{definitely not json".to_vec()).await;
        wait_until(|| handle.settlements().len() == 1).await;

        assert_eq!(handle.settlements(), vec![Settlement::Requeued]);
        assert_eq!(counters.dead_letters.load(Ordering::SeqCst), 0);

        sender.set_failing(false);
        handle.push(b"{definitely not json".to_vec()).await;
        wait_until(|| handle.settlements().len() == 2).await;

        assert_eq!(handle.settlements()[1], Settlement::Acked);
        assert_eq!(counters.dead_letters.load(Ordering::SeqCst), 1);

        running.stop().await.unwrap();
    }
}
