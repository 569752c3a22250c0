//! Subscription loop that dispatches delivered reminders and settles them.
//!
//! A [`Consumer`] owns one [`Receiver`] for its whole life. Its
//! [`Subscription`] moves through
//! `Idle -> Subscribed -> (Processing <-> Subscribed) -> Closed`; `Closed` is
//! terminal.
//!
//! For every delivery the [`Handler`] runs first, then the delivery is settled
//! exactly once: completed if the handler succeeded, abandoned (and therefore
//! redelivered by the broker) if it failed. Delivery is at-least-once, so
//! handlers must tolerate seeing the same reminder more than once.
//!
//! Faults reported by the receiver go through the [`FaultClassifier`]; only a
//! [`FaultAction::Stop`] ends the loop with an error.

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::fault::{BrokerFault, FaultAction, FaultClassifier};

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Subscribed,
    Processing,
    Closed,
}

/// Shared handle on a consumer's lifecycle.
///
/// Cloneable and usable from other tasks, e.g. a Ctrl+C handler.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<Mutex<SubscriptionState>>,
    stop: CancellationToken,
}

impl Subscription {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SubscriptionState::Idle)),
            stop: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        *self.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// Ask the consumer to stop.
    ///
    /// A delivery being processed is finished and settled first; nothing new
    /// is received afterwards. Calling this on a closed subscription does
    /// nothing.
    pub fn stop(&self) {
        self.stop.cancel();
        let mut state = self.lock();
        if *state == SubscriptionState::Idle {
            *state = SubscriptionState::Closed;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<(), SubscriptionState> {
        let mut state = self.lock();
        match *state {
            SubscriptionState::Idle => {
                *state = SubscriptionState::Subscribed;
                Ok(())
            }
            other => Err(other),
        }
    }

    fn enter_processing(&self) {
        let mut state = self.lock();
        if *state == SubscriptionState::Subscribed {
            *state = SubscriptionState::Processing;
        }
    }

    fn leave_processing(&self) {
        let mut state = self.lock();
        if *state == SubscriptionState::Processing {
            *state = SubscriptionState::Subscribed;
        }
    }

    /// Returns `true` only for the call that actually closed the subscription.
    fn close(&self) -> bool {
        let mut state = self.lock();
        let first = *state != SubscriptionState::Closed;
        *state = SubscriptionState::Closed;
        first
    }
}

/// One message handed out by a [`Receiver`].
pub struct Delivery<S> {
    to: String,
    body: String,
    delivery_count: u32,
    settlement: S,
}

impl<S> Delivery<S> {
    pub fn new(to: String, body: String, delivery_count: u32, settlement: S) -> Self {
        Self {
            to,
            body,
            delivery_count,
            settlement,
        }
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// How many times the broker has handed this message out, starting at 1.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// Permanently removed from the queue.
    Completed,
    /// Returned to the queue for redelivery.
    Abandoned,
}

/// Broker settlement primitives for a single delivery.
///
/// Both methods consume the settlement, so a delivery can be settled once.
#[async_trait::async_trait]
pub trait Settlement: Send + Sized + 'static {
    async fn complete(self) -> Result<(), BrokerFault>;
    async fn abandon(self) -> Result<(), BrokerFault>;
}

/// Receive side of the queue boundary.
#[async_trait::async_trait]
pub trait Receiver: Send {
    type Settlement: Settlement;

    /// Open the receive channel.
    async fn subscribe(&mut self) -> Result<(), BrokerFault>;

    /// Wait for the next delivery or fault. `None` means the broker ended the
    /// subscription.
    async fn next(&mut self) -> Option<Result<Delivery<Self::Settlement>, BrokerFault>>;

    /// Release the subscription. Must be idempotent.
    async fn close(&mut self) -> Result<(), BrokerFault>;
}

/// Processing callback for delivered reminders.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, to: &str, body: &str) -> Result<(), tower::BoxError>;
}

#[async_trait::async_trait]
impl<T> Handler for Arc<T>
where
    T: Handler + ?Sized,
{
    async fn handle(&self, to: &str, body: &str) -> Result<(), tower::BoxError> {
        (**self).handle(to, body).await
    }
}

enum Flow {
    Continue,
    Stop(BrokerFault),
}

enum Started {
    Subscribed,
    /// Stopped while waiting to retry a failed subscribe.
    Stopped,
}

/// Subscription loop.
///
/// Generic parameters:
/// - `R`: receiver backend
/// - `HD`: processing callback
/// - `HK`: lifecycle hook
pub struct Consumer<R, HD, HK = DefaultConsumerHook> {
    receiver: R,
    handler: HD,
    classifier: FaultClassifier,
    hook: HK,
    subscription: Subscription,
}

impl<R, HD> Consumer<R, HD, DefaultConsumerHook>
where
    R: Receiver,
    HD: Handler,
{
    pub fn new(receiver: R, handler: HD, classifier: FaultClassifier) -> Self {
        Self {
            receiver,
            handler,
            classifier,
            hook: DefaultConsumerHook,
            subscription: Subscription::new(),
        }
    }
}

impl<R, HD, HK> Consumer<R, HD, HK>
where
    R: Receiver,
    HD: Handler,
    HK: ConsumerHook,
{
    /// Replace the lifecycle hook.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<R, HD, HK2> {
        Consumer {
            receiver: self.receiver,
            handler: self.handler,
            classifier: self.classifier,
            hook,
            subscription: self.subscription,
        }
    }

    /// Handle for observing or stopping the subscription from elsewhere.
    pub fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }

    /// Subscribe and process deliveries until stopped or a fatal fault.
    ///
    /// Returns `Ok(())` after [`Subscription::stop`] or when the broker ends
    /// the stream, and [`ConsumerErrorKind::Fatal`] when a fault is classified
    /// as [`FaultAction::Stop`]. Faults while subscribing go through the same
    /// classification; the subscribe call is retried unless it is fatal. The
    /// receiver is closed in every case.
    #[tracing::instrument(skip(self))]
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        let outcome = match self.start().await {
            Ok(Started::Subscribed) => self.receive().await,
            Ok(Started::Stopped) => Ok(()),
            Err(err) => Err(err),
        };
        self.shutdown().await;
        outcome
    }

    async fn start(&mut self) -> Result<Started, ConsumerError> {
        self.subscription
            .begin()
            .map_err(ConsumerError::invalid_state)?;
        let stop = self.subscription.stop.clone();

        loop {
            let fault = match self.receiver.subscribe().await {
                Ok(()) => {
                    self.hook.on_subscribed();
                    return Ok(Started::Subscribed);
                }
                Err(fault) => fault,
            };

            let action = self.classifier.classify(fault.kind());
            self.hook.on_fault(&fault, action);

            let pause = match action {
                FaultAction::Stop => return Err(ConsumerError::fatal(fault)),
                FaultAction::Backoff(pause) => pause,
                FaultAction::LogAndContinue => self.classifier.busy_backoff(),
            };

            tokio::select! {
                _ = stop.cancelled() => {
                    self.hook.on_stop_requested();
                    return Ok(Started::Stopped);
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn receive(&mut self) -> Result<(), ConsumerError> {
        let stop = self.subscription.stop.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                next = self.receiver.next() => Some(next),
            };

            let flow = match next {
                None => {
                    self.hook.on_stop_requested();
                    return Ok(());
                }
                Some(None) => {
                    self.hook.on_stream_end();
                    return Ok(());
                }
                Some(Some(Ok(delivery))) => self.process(delivery).await,
                Some(Some(Err(fault))) => self.on_fault(fault).await,
            };

            if let Flow::Stop(fault) = flow {
                return Err(ConsumerError::fatal(fault));
            }
        }
    }

    async fn process(&mut self, delivery: Delivery<R::Settlement>) -> Flow {
        let Delivery {
            to,
            body,
            delivery_count,
            settlement,
        } = delivery;

        self.subscription.enter_processing();
        self.hook.on_message(&to, delivery_count);

        let settled = match self.handler.handle(&to, &body).await {
            Ok(()) => settlement.complete().await.map(|()| Settled::Completed),
            Err(error) => {
                self.hook.on_handler_error(&to, error.as_ref());
                settlement.abandon().await.map(|()| Settled::Abandoned)
            }
        };

        self.subscription.leave_processing();

        match settled {
            Ok(settled) => {
                self.hook.on_settled(&to, settled);
                Flow::Continue
            }
            Err(fault) => self.on_fault(fault).await,
        }
    }

    async fn on_fault(&mut self, fault: BrokerFault) -> Flow {
        let action = self.classifier.classify(fault.kind());
        self.hook.on_fault(&fault, action);

        match action {
            FaultAction::Stop => Flow::Stop(fault),
            FaultAction::LogAndContinue => Flow::Continue,
            FaultAction::Backoff(pause) => {
                let stop = self.subscription.stop.clone();
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
                Flow::Continue
            }
        }
    }

    async fn shutdown(&mut self) {
        if !self.subscription.close() {
            return;
        }
        if let Err(fault) = self.receiver.close().await {
            self.hook.on_close_error(&fault);
        }
        self.hook.on_closed();
    }
}

/// Error returned when the subscription loop cannot continue.
#[derive(Debug)]
pub struct ConsumerError {
    context: SpanTrace,
    kind: ConsumerErrorKind,
}

/// Consumer error kinds.
#[derive(Debug)]
pub enum ConsumerErrorKind {
    /// A broker fault classified as fatal closed the subscription.
    Fatal(BrokerFault),
    /// `run` was called on a consumer that is not idle.
    InvalidState(SubscriptionState),
}

impl ConsumerError {
    fn fatal(fault: BrokerFault) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::Fatal(fault),
        }
    }

    fn invalid_state(state: SubscriptionState) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumerErrorKind::InvalidState(state),
        }
    }

    pub fn kind(&self) -> &ConsumerErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerErrorKind::Fatal(fault) => writeln!(f, "Subscription stopped: {fault}"),
            ConsumerErrorKind::InvalidState(state) => {
                writeln!(f, "Cannot start a subscription in state {state:?}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerErrorKind::Fatal(fault) => Some(fault),
            ConsumerErrorKind::InvalidState(_) => None,
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously from the subscription loop and should not
/// block.
pub trait ConsumerHook: Send + Sync {
    fn on_subscribed(&self);
    fn on_message(&self, to: &str, delivery_count: u32);
    fn on_handler_error(&self, to: &str, error: &dyn std::error::Error);
    fn on_settled(&self, to: &str, settled: Settled);
    fn on_fault(&self, fault: &BrokerFault, action: FaultAction);
    fn on_stop_requested(&self);
    fn on_stream_end(&self);
    fn on_close_error(&self, fault: &BrokerFault);
    fn on_closed(&self);
}

/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_subscribed(&self) {
        tracing::info!("Receiving messages");
    }

    fn on_message(&self, to: &str, delivery_count: u32) {
        tracing::debug!(to, delivery_count, "Message received");
    }

    fn on_handler_error(&self, to: &str, error: &dyn std::error::Error) {
        tracing::warn!(to, %error, "Processing failed, abandoning message");
    }

    fn on_settled(&self, to: &str, settled: Settled) {
        tracing::info!(to, ?settled, "Message settled");
    }

    fn on_fault(&self, fault: &BrokerFault, action: FaultAction) {
        match action {
            FaultAction::Stop => {
                tracing::error!(kind = %fault.kind(), %fault, "Unrecoverable broker fault, stopping")
            }
            FaultAction::LogAndContinue => {
                tracing::warn!(kind = %fault.kind(), %fault, "Broker fault")
            }
            FaultAction::Backoff(pause) => {
                tracing::warn!(kind = %fault.kind(), ?pause, "Broker busy, backing off")
            }
        }
    }

    fn on_stop_requested(&self) {
        tracing::info!("Stop requested");
    }

    fn on_stream_end(&self) {
        tracing::info!("Broker ended the subscription");
    }

    fn on_close_error(&self, fault: &BrokerFault) {
        tracing::error!(%fault, "Failed to close subscription");
    }

    fn on_closed(&self) {
        tracing::info!("Subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use chrono::Utc;
    use tokio::time::Instant;

    use super::*;
    use crate::{Reminder, consumer::inmemory::InMemoryQueue, fault::FaultKind};

    /// Records every call and fails the first `failures` of them.
    #[derive(Clone, Default)]
    struct Script {
        calls: Arc<Mutex<Vec<(String, String, Instant)>>>,
        failures: Arc<AtomicUsize>,
    }

    impl Script {
        fn failing(failures: usize) -> Self {
            let script = Self::default();
            script.failures.store(failures, Ordering::SeqCst);
            script
        }

        fn calls(&self) -> Vec<(String, String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Handler for Script {
        async fn handle(&self, to: &str, body: &str) -> Result<(), tower::BoxError> {
            self.calls
                .lock()
                .unwrap()
                .push((to.to_owned(), body.to_owned(), Instant::now()));
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                Err("gateway rejected message".into())
            } else {
                Ok(())
            }
        }
    }

    fn reminder(to: &str) -> Reminder {
        Reminder {
            to: to.into(),
            body: format!("Hello {to}"),
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn successful_processing_completes_the_message() {
        let queue = InMemoryQueue::default();
        let id = queue.publish(reminder("+15550100"), Utc::now());
        let script = Script::default();

        let consumer = Consumer::new(queue.clone(), script.clone(), FaultClassifier::default());
        let subscription = consumer.subscription();
        let running = tokio::spawn(consumer.run());

        eventually(|| !queue.settlements().is_empty()).await;
        subscription.stop();
        running.await.unwrap().unwrap();

        assert_eq!(queue.settlements(), vec![(id, Settled::Completed)]);
        assert_eq!(script.calls().len(), 1);
        assert_eq!(queue.ready(), 0);
        assert_eq!(subscription.state(), SubscriptionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_processing_abandons_and_the_message_comes_back() {
        let queue = InMemoryQueue::default();
        let id = queue.publish(reminder("+15550100"), Utc::now());
        let script = Script::failing(1);

        let consumer = Consumer::new(queue.clone(), script.clone(), FaultClassifier::default());
        let subscription = consumer.subscription();
        let running = tokio::spawn(consumer.run());

        eventually(|| queue.settlements().len() == 2).await;
        subscription.stop();
        running.await.unwrap().unwrap();

        assert_eq!(
            queue.settlements(),
            vec![(id, Settled::Abandoned), (id, Settled::Completed)]
        );
        let calls = script.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!((&calls[0].0, &calls[0].1), (&calls[1].0, &calls[1].1));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_fault_closes_the_subscription() {
        let queue = InMemoryQueue::default();
        queue.inject_fault(FaultKind::EntityNotFound);
        queue.publish(reminder("+15550100"), Utc::now());
        let script = Script::default();

        let consumer = Consumer::new(queue.clone(), script.clone(), FaultClassifier::default());
        let subscription = consumer.subscription();

        let err = consumer.run().await.unwrap_err();

        assert!(matches!(
            err.kind(),
            ConsumerErrorKind::Fatal(fault) if fault.kind() == FaultKind::EntityNotFound
        ));
        assert_eq!(subscription.state(), SubscriptionState::Closed);
        assert!(queue.is_closed());
        assert!(script.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_fault_pauses_then_keeps_receiving() {
        let queue = InMemoryQueue::default();
        queue.inject_fault(FaultKind::ServiceBusy);
        queue.publish(reminder("+15550100"), Utc::now());
        let script = Script::default();

        let classifier = FaultClassifier::new(Duration::from_millis(1000));
        let consumer = Consumer::new(queue.clone(), script.clone(), classifier);
        let subscription = consumer.subscription();
        let started = Instant::now();
        let running = tokio::spawn(consumer.run());

        eventually(|| !script.calls().is_empty()).await;
        assert_ne!(subscription.state(), SubscriptionState::Closed);

        subscription.stop();
        running.await.unwrap().unwrap();

        let (_, _, received_at) = script.calls()[0].clone();
        assert!(received_at.duration_since(started) >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn other_faults_are_logged_and_ignored() {
        let queue = InMemoryQueue::default();
        queue.inject_fault(FaultKind::Other);
        queue.inject_fault(FaultKind::MessageLockLost);
        let id = queue.publish(reminder("+15550100"), Utc::now());

        let consumer = Consumer::new(queue.clone(), Script::default(), FaultClassifier::default());
        let subscription = consumer.subscription();
        let running = tokio::spawn(consumer.run());

        eventually(|| !queue.settlements().is_empty()).await;
        subscription.stop();
        running.await.unwrap().unwrap();

        assert_eq!(queue.settlements(), vec![(id, Settled::Completed)]);
    }

    /// Loses every lock on its first call.
    struct LoseLocksOnce {
        queue: InMemoryQueue,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Handler for LoseLocksOnce {
        async fn handle(&self, _to: &str, _body: &str) -> Result<(), tower::BoxError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.queue.lose_locks();
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lock_on_settlement_leads_to_redelivery() {
        let queue = InMemoryQueue::default();
        let id = queue.publish(reminder("+15550100"), Utc::now());
        let handler = Arc::new(LoseLocksOnce {
            queue: queue.clone(),
            calls: AtomicUsize::new(0),
        });

        let consumer = Consumer::new(queue.clone(), handler.clone(), FaultClassifier::default());
        let subscription = consumer.subscription();
        let running = tokio::spawn(consumer.run());

        eventually(|| !queue.settlements().is_empty()).await;
        subscription.stop();
        running.await.unwrap().unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.settlements(), vec![(id, Settled::Completed)]);
    }

    /// Blocks until released, so the test can stop the consumer mid-processing.
    struct Gate {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl Handler for Gate {
        async fn handle(&self, _to: &str, _body: &str) -> Result<(), tower::BoxError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_the_in_flight_message_settle_and_accepts_nothing_new() {
        let queue = InMemoryQueue::default();
        let first = queue.publish(reminder("+15550100"), Utc::now());
        queue.publish(reminder("+15550101"), Utc::now());
        let gate = Arc::new(Gate {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });

        let consumer = Consumer::new(queue.clone(), gate.clone(), FaultClassifier::default());
        let subscription = consumer.subscription();
        let running = tokio::spawn(consumer.run());

        gate.entered.notified().await;
        assert_eq!(subscription.state(), SubscriptionState::Processing);
        subscription.stop();
        gate.release.notify_one();
        running.await.unwrap().unwrap();

        assert_eq!(queue.settlements(), vec![(first, Settled::Completed)]);
        assert_eq!(queue.ready(), 1);
        assert_eq!(subscription.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let queue = InMemoryQueue::default();
        let consumer = Consumer::new(queue.clone(), Script::default(), FaultClassifier::default());
        let subscription = consumer.subscription();

        subscription.stop();
        subscription.stop();
        assert_eq!(subscription.state(), SubscriptionState::Closed);

        let err = consumer.run().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            ConsumerErrorKind::InvalidState(SubscriptionState::Closed)
        ));

        subscription.stop();
        assert_eq!(subscription.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn failed_subscribe_is_fatal() {
        let queue = InMemoryQueue::default();
        queue.fail_subscribe(FaultKind::Unauthorized);

        let consumer = Consumer::new(queue.clone(), Script::default(), FaultClassifier::default());
        let subscription = consumer.subscription();

        let err = consumer.run().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            ConsumerErrorKind::Fatal(fault) if fault.kind() == FaultKind::Unauthorized
        ));
        assert!(subscription.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_subscribe_backs_off_and_retries() {
        let queue = InMemoryQueue::default();
        queue.fail_subscribe(FaultKind::ServiceBusy);
        queue.fail_subscribe(FaultKind::Other);
        let id = queue.publish(reminder("+15550100"), Utc::now());
        let script = Script::default();

        let classifier = FaultClassifier::new(Duration::from_millis(1000));
        let consumer = Consumer::new(queue.clone(), script.clone(), classifier);
        let subscription = consumer.subscription();
        let started = Instant::now();
        let running = tokio::spawn(consumer.run());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_ne!(subscription.state(), SubscriptionState::Closed);
        assert_eq!(queue.settlements(), vec![(id, Settled::Completed)]);

        subscription.stop();
        running.await.unwrap().unwrap();

        let (_, _, received_at) = script.calls()[0].clone();
        assert!(received_at.duration_since(started) >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_retrying_subscribe_closes_cleanly() {
        let queue = InMemoryQueue::default();
        for _ in 0..100 {
            queue.fail_subscribe(FaultKind::ServiceBusy);
        }

        let consumer = Consumer::new(queue.clone(), Script::default(), FaultClassifier::default());
        let subscription = consumer.subscription();
        let running = tokio::spawn(consumer.run());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        subscription.stop();

        running.await.unwrap().unwrap();
        assert!(subscription.is_closed());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn stream_end_closes_without_error() {
        let queue = InMemoryQueue::default();
        let consumer = Consumer::new(queue.clone(), Script::default(), FaultClassifier::default());
        let subscription = consumer.subscription();

        let running = tokio::spawn(consumer.run());
        eventually(|| subscription.state() == SubscriptionState::Subscribed).await;
        queue.end_stream();

        running.await.unwrap().unwrap();
        assert!(subscription.is_closed());
    }
}
