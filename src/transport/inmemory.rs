use std::{marker::PhantomData, sync::Arc};

use tokio::sync::Mutex;

use crate::{Envelope, transport::Sender};

type Rejection<H, M> = Arc<dyn Fn(&Envelope<H, M>) -> bool + Send + Sync>;

/// In-memory sender that records every publish call.
///
/// Intended for tests and dry runs: envelopes are appended to a shared list
/// instead of reaching a broker. A rejection predicate can be installed to
/// make selected publishes fail.
pub struct InMemory<H, M> {
    sent: Arc<Mutex<Vec<Envelope<H, M>>>>,
    reject: Option<Rejection<H, M>>,
    _marker: PhantomData<(H, M)>,
}

impl<H, M> InMemory<H, M> {
    /// Fail every publish for which `predicate` returns `true`.
    pub fn rejecting<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Envelope<H, M>) -> bool + Send + Sync + 'static,
    {
        self.reject = Some(Arc::new(predicate));
        self
    }

    /// Take every envelope published so far.
    pub async fn sent_messages(&self) -> Vec<Envelope<H, M>> {
        let mut sent = self.sent.lock().await;
        std::mem::take(&mut *sent)
    }
}

impl<H, M> Clone for InMemory<H, M> {
    fn clone(&self) -> Self {
        Self {
            sent: Arc::clone(&self.sent),
            reject: self.reject.clone(),
            _marker: PhantomData,
        }
    }
}

impl<H, M> Default for InMemory<H, M> {
    fn default() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            reject: None,
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<H, M> Sender<H, M> for InMemory<H, M>
where
    H: std::fmt::Debug + Send + Sync,
    M: std::fmt::Debug + Send + Sync,
{
    type Error = std::io::Error;

    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        if self.reject.as_ref().is_some_and(|reject| reject(&envelope)) {
            return Err(std::io::Error::other("publish rejected by in-memory sender"));
        }

        tracing::info!(
            headers = ?envelope.headers,
            msg = ?envelope.message,
            "Message recorded by in-memory sender",
        );
        self.sent.lock().await.push(envelope);
        Ok(())
    }
}
