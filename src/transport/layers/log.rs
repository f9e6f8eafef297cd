use std::{future::Future, pin::Pin};

use tower::{Layer, Service};

use crate::Envelope;
use crate::transport::{DeliveryKind, OutboundHeaders};

/// Tower `Service` wrapper that traces every publish.
///
/// Emits one structured event per envelope with the destination queue and
/// the delivery kind (reply, retry, dead-letter), plus an error event when
/// the inner service refuses the publish. Sits between the pipeline and a
/// sender backend so all three outbound destinations share one log point.
#[derive(Clone)]
pub struct PublishLogService<T> {
    inner: T,
}

impl<T, M> Service<Envelope<OutboundHeaders, M>> for PublishLogService<T>
where
    M: Send + 'static,
    T: Service<Envelope<OutboundHeaders, M>> + Clone + Send + 'static,
    <T as Service<Envelope<OutboundHeaders, M>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<OutboundHeaders, M>) -> Self::Future {
        let mut inner = self.inner.clone();
        let queue = req.headers.queue.clone();
        let kind = kind_label(&req.headers.kind);

        Box::pin(async move {
            match inner.call(req).await.map_err(Into::into) {
                Ok(response) => {
                    tracing::debug!(%queue, kind, "Envelope published");
                    Ok(response)
                }
                Err(err) => {
                    tracing::error!(%queue, kind, error = %err, "Publish failed");
                    Err(err)
                }
            }
        })
    }
}

fn kind_label(kind: &DeliveryKind) -> &'static str {
    match kind {
        DeliveryKind::Reply => "reply",
        DeliveryKind::Retry { .. } => "retry",
        DeliveryKind::DeadLetter { .. } => "dead-letter",
    }
}

/// Tower `Layer` that applies [`PublishLogService`] to a service stack.
pub struct PublishLogLayer;

impl<S> Layer<S> for PublishLogLayer {
    type Service = PublishLogService<S>;

    fn layer(&self, service: S) -> Self::Service {
        PublishLogService { inner: service }
    }
}
