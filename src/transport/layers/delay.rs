use std::{future::Future, pin::Pin};

use chrono::Utc;
use tower::{Layer, Service};

use crate::{DeliveryHeaders, Envelope, schedule};

/// Tower `Service` that holds each envelope until its scheduled instant.
///
/// This is the client-timed publish strategy: the broker sees the message only
/// once it is due. Every send is serialized behind its wait and the connection
/// stays open for the whole batch window, so prefer broker-side deferral when
/// the broker supports it.
#[derive(Clone)]
pub struct DelayUntil<T> {
    inner: T,
}

impl<T, M> Service<Envelope<DeliveryHeaders, M>> for DelayUntil<T>
where
    M: Send + 'static,
    T: Service<Envelope<DeliveryHeaders, M>> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
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

    fn call(&mut self, req: Envelope<DeliveryHeaders, M>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let wait = schedule::delay_until(req.headers.scheduled_time, Utc::now());
            if !wait.is_zero() {
                tracing::debug!(?wait, to = %req.headers.to, "Holding message until due");
                tokio::time::sleep(wait).await;
            }
            inner.call(req).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies [`DelayUntil`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayUntilLayer;

impl<S> Layer<S> for DelayUntilLayer {
    type Service = DelayUntil<S>;

    fn layer(&self, service: S) -> Self::Service {
        DelayUntil { inner: service }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{Reminder, Transport, transport::InMemory};

    fn envelope_due_in(delay: chrono::Duration) -> Envelope<DeliveryHeaders, Reminder> {
        Envelope {
            headers: DeliveryHeaders {
                to: "+15550100".into(),
                scheduled_time: Utc::now() + delay,
            },
            message: Reminder {
                to: "+15550100".into(),
                body: "Hello".into(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publish_waits_until_scheduled_time() {
        let sender: InMemory<DeliveryHeaders, Reminder> = InMemory::default();
        let mut transport = Transport::new(sender.clone()).layer(DelayUntilLayer);

        let started = tokio::time::Instant::now();
        transport
            .send(envelope_due_in(chrono::Duration::minutes(5)))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(299));
        assert_eq!(sender.sent_messages().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_message_is_forwarded_immediately() {
        let sender: InMemory<DeliveryHeaders, Reminder> = InMemory::default();
        let mut transport = Transport::new(sender.clone()).layer(DelayUntilLayer);

        let started = tokio::time::Instant::now();
        transport
            .send(envelope_due_in(chrono::Duration::minutes(-1)))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(sender.sent_messages().await.len(), 1);
    }
}
