//! Publish path towards the queue.
//!
//! Publishing is built on Tower's `Service` abstraction: a concrete
//! [`Sender`] (RabbitMQ, in-memory) sits at the bottom and layers such as
//! [`layers::JsonLayer`] or [`layers::DelayUntilLayer`] are stacked on top.
//!
//! ## Key components
//!
//! - [`Transport`]: public wrapper implementing `tower::Service`
//! - [`SenderService`]: adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: trait implemented by broker backends
//! - [`TransportError`]: unified error type with tracing context

mod inmemory;

pub mod layers;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::Service;
use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::InMemory;

/// Generic Tower-compatible transport wrapper.
///
/// Normalizes every failure of the wrapped service into a [`TransportError`]
/// and offers [`send`](Transport::send) for callers that do not want to drive
/// the `Service` API themselves.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a transport on top of a sender backend.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Wrap the current service stack in a Tower layer.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }
}

impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::classify(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::classify(e.into()))?;
            Ok(())
        })
    }
}

impl<S> Transport<S> {
    /// Publish one [`Envelope`].
    pub async fn send<H, M>(&mut self, envelope: Envelope<H, M>) -> Result<(), TransportError>
    where
        M: Send + 'static,
        S: Service<Envelope<H, M>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        service
            .call(envelope)
            .await
            .map_err(|e| TransportError::classify(e.into()))?;
        Ok(())
    }
}

/// Error returned by transport operations.
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport error kinds.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The broker backend refused or failed the publish.
    Sender(tower::BoxError),
    /// The payload could not be encoded.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    /// Encoding failures surface from layers as boxed `serde_json` errors.
    fn classify(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) if err.is::<serde_json::Error>() => Self::serde(err),
            Err(err) => Self::sender(err),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

impl<H, M, D> Service<Envelope<H, M>> for SenderService<D>
where
    H: Send + 'static,
    M: Send + 'static,
    D: Sender<H, M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Envelope<H, M>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Implemented by broker backends.
///
/// A sender makes exactly one publish attempt per call and must honour the
/// delivery instruction carried by the envelope headers.
#[async_trait::async_trait]
pub trait Sender<H, M> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Publish an envelope.
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error>;
}

/// Encoded payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Values that can be published as a message body without copying.
pub trait ToBytes {
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_payload_is_published_as_is() {
        let payload = RawPayload::from(br#"{"to":"+15550100"}"#.to_vec());
        assert_eq!(payload.to_bytes(), br#"{"to":"+15550100"}"#);
        assert_eq!(payload.into_inner().len(), 18);
    }

    #[test]
    fn boxed_serde_errors_are_classified_as_serde() {
        let serde_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = TransportError::classify(Box::new(serde_err));
        assert!(matches!(err.kind(), TransportErrorKind::Serde(_)));

        let io_err = std::io::Error::other("broker unreachable");
        let err = TransportError::classify(Box::new(io_err));
        assert!(matches!(err.kind(), TransportErrorKind::Sender(_)));
    }

    #[test]
    fn nested_transport_errors_are_not_rewrapped() {
        let inner = TransportError::serde(Box::new(std::io::Error::other("bad payload")));
        let err = TransportError::classify(Box::new(inner));
        assert!(matches!(err.kind(), TransportErrorKind::Serde(_)));
    }
}
