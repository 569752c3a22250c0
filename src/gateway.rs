//! Outbound notification channel.
//!
//! The consumer does not care how a reminder reaches its recipient. A
//! [`NotificationGateway`] sends one text to one address; [`Notify`] plugs a
//! gateway into a [`Consumer`](crate::Consumer) as its [`Handler`].

#[cfg(feature = "twilio")]
pub mod twilio;

use async_trait::async_trait;
use tracing_error::SpanTrace;

use crate::consumer::Handler;

/// Identifier the gateway assigned to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub id: String,
}

/// Sends a single text message.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, GatewayError>;
}

/// [`Handler`] that forwards each delivery to a gateway.
///
/// A gateway failure is logged and returned, so the delivery is abandoned and
/// comes back later.
pub struct Notify<G> {
    gateway: G,
}

impl<G> Notify<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl<G> Handler for Notify<G>
where
    G: NotificationGateway,
{
    #[tracing::instrument(skip(self, body))]
    async fn handle(&self, to: &str, body: &str) -> Result<(), tower::BoxError> {
        tracing::debug!(body, "Received message");
        match self.gateway.send(to, body).await {
            Ok(receipt) => {
                tracing::info!(id = %receipt.id, "Notification sent");
                Ok(())
            }
            Err(error) => {
                tracing::error!(%error, "Notification failed");
                Err(error.into())
            }
        }
    }
}

/// Error returned by a [`NotificationGateway`].
#[derive(Debug)]
pub struct GatewayError {
    context: SpanTrace,
    kind: GatewayErrorKind,
}

/// Gateway error kinds.
#[derive(Debug)]
pub enum GatewayErrorKind {
    /// The request never produced a response.
    Request(tower::BoxError),
    /// The gateway answered with a non-success status.
    Rejected { status: u16, message: String },
    /// The response could not be understood.
    Response(tower::BoxError),
}

impl GatewayError {
    pub fn request(err: impl Into<tower::BoxError>) -> Self {
        Self::new(GatewayErrorKind::Request(err.into()))
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Rejected {
            status,
            message: message.into(),
        })
    }

    pub fn response(err: impl Into<tower::BoxError>) -> Self {
        Self::new(GatewayErrorKind::Response(err.into()))
    }

    fn new(kind: GatewayErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &GatewayErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            GatewayErrorKind::Request(err) => writeln!(f, "Gateway request failed: {err}"),
            GatewayErrorKind::Rejected { status, message } => {
                writeln!(f, "Gateway rejected message ({status}): {message}")
            }
            GatewayErrorKind::Response(err) => writeln!(f, "Invalid gateway response: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            GatewayErrorKind::Request(err) | GatewayErrorKind::Response(err) => Some(err.as_ref()),
            GatewayErrorKind::Rejected { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use super::*;
    use crate::{
        Consumer, Reminder,
        consumer::{Settled, inmemory::InMemoryQueue},
        fault::FaultClassifier,
    };

    #[derive(Clone, Default)]
    struct FakeGateway {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        down: bool,
    }

    #[async_trait]
    impl NotificationGateway for FakeGateway {
        async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, GatewayError> {
            if self.down {
                return Err(GatewayError::rejected(503, "unavailable"));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((to.to_owned(), body.to_owned()));
            Ok(DeliveryReceipt {
                id: format!("SM{}", sent.len()),
            })
        }
    }

    #[tokio::test]
    async fn forwards_address_and_body_to_the_gateway() {
        let gateway = FakeGateway::default();
        let notify = Notify::new(gateway.clone());

        notify.handle("+15550100", "Hello Ada").await.unwrap();

        assert_eq!(
            *gateway.sent.lock().unwrap(),
            vec![("+15550100".to_owned(), "Hello Ada".to_owned())]
        );
    }

    #[tokio::test]
    async fn gateway_failure_becomes_a_handler_error() {
        let notify = Notify::new(FakeGateway {
            down: true,
            ..Default::default()
        });

        let err = notify.handle("+15550100", "Hello").await.unwrap_err();
        let err = err.downcast_ref::<GatewayError>().unwrap();
        assert!(matches!(
            err.kind(),
            GatewayErrorKind::Rejected { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn failed_notification_is_abandoned_by_the_consumer() {
        let queue = InMemoryQueue::default();
        let id = queue.publish(
            Reminder {
                to: "+15550100".into(),
                body: "Hello".into(),
            },
            Utc::now(),
        );
        let notify = Notify::new(FakeGateway {
            down: true,
            ..Default::default()
        });

        let consumer = Consumer::new(queue.clone(), notify, FaultClassifier::default());
        let subscription = consumer.subscription();
        let running = tokio::spawn(consumer.run());

        while queue.settlements().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        subscription.stop();
        running.await.unwrap().unwrap();

        assert_eq!(queue.settlements()[0], (id, Settled::Abandoned));
    }
}
