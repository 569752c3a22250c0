//! Batch publisher for scheduled reminders.
//!
//! A [`Publisher`] turns each [`Record`] into a [`ScheduledMessage`], drops the
//! ones whose delivery instant is not strictly in the future, and hands the rest
//! to a [`Transport`]. Every record gets exactly one [`RecordOutcome`]; a failed
//! publish never stops the batch.
//!
//! Whether the broker or the publisher waits for the scheduled instant is a
//! property of the transport stack, see
//! [`DelayUntilLayer`](crate::transport::layers::DelayUntilLayer).

use chrono::{DateTime, Utc};
use tower::Service;

use crate::{
    DeliveryHeaders, Envelope, Record, Reminder,
    schedule::{self, Clock, Schedule, ScheduledMessage, SystemClock},
    transport::{Transport, TransportError},
};

/// Publishes one batch of records through a transport.
///
/// Generic parameters:
/// - `T`: transport service stack
/// - `C`: clock used for the eligibility decision
/// - `HK`: hook implementation for lifecycle events
pub struct Publisher<T, C = SystemClock, HK = DefaultPublisherHook> {
    transport: Transport<T>,
    schedule: Schedule,
    clock: C,
    hook: HK,
}

impl<T> Publisher<T, SystemClock, DefaultPublisherHook> {
    pub fn new(transport: Transport<T>, schedule: Schedule) -> Self {
        Self {
            transport,
            schedule,
            clock: SystemClock,
            hook: DefaultPublisherHook,
        }
    }
}

impl<T, C, HK> Publisher<T, C, HK> {
    /// Replace the clock, e.g. with a fixed instant in tests.
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Publisher<T, C2, HK> {
        Publisher {
            transport: self.transport,
            schedule: self.schedule,
            clock,
            hook: self.hook,
        }
    }

    /// Replace the publisher hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: PublisherHook>(self, hook: HK2) -> Publisher<T, C, HK2> {
        Publisher {
            transport: self.transport,
            schedule: self.schedule,
            clock: self.clock,
            hook,
        }
    }
}

impl<T, C, HK> Publisher<T, C, HK>
where
    T: Service<Envelope<DeliveryHeaders, Reminder>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
    C: Clock,
    HK: PublisherHook,
{
    /// Publish every eligible record, in order.
    ///
    /// Eligibility is decided against the clock right before each record is
    /// published, so a slow transport cannot push a reminder past its instant
    /// unnoticed.
    #[tracing::instrument(skip_all)]
    pub async fn publish_batch<I>(&mut self, records: I) -> PublishReport
    where
        I: IntoIterator<Item = Record>,
    {
        self.hook.on_batch_start();
        let mut outcomes = Vec::new();

        for record in records {
            let message = self.schedule.message_for(&record);
            let now = self.clock.now();

            if !schedule::is_eligible(message.scheduled_time, now) {
                self.hook.on_skipped(&message, now);
                outcomes.push(RecordOutcome::new(&message, OutcomeStatus::Skipped));
                continue;
            }

            let status = match self.transport.send(message.clone().into_envelope()).await {
                Ok(()) => {
                    self.hook.on_published(&message);
                    OutcomeStatus::Published
                }
                Err(error) => {
                    self.hook.on_publish_error(&message, &error);
                    OutcomeStatus::Failed(error)
                }
            };
            outcomes.push(RecordOutcome::new(&message, status));
        }

        let report = PublishReport { outcomes };
        self.hook.on_batch_end(&report);
        report
    }
}

/// Result of publishing one record.
#[derive(Debug)]
pub struct RecordOutcome {
    pub contact: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: OutcomeStatus,
}

impl RecordOutcome {
    fn new(message: &ScheduledMessage, status: OutcomeStatus) -> Self {
        Self {
            contact: message.to.clone(),
            scheduled_time: message.scheduled_time,
            status,
        }
    }
}

#[derive(Debug)]
pub enum OutcomeStatus {
    Published,
    /// The delivery instant was not in the future; nothing was sent.
    Skipped,
    Failed(TransportError),
}

/// Per-record outcomes of one batch, in source order.
#[derive(Debug, Default)]
pub struct PublishReport {
    outcomes: Vec<RecordOutcome>,
}

impl PublishReport {
    pub fn outcomes(&self) -> &[RecordOutcome] {
        &self.outcomes
    }

    pub fn sent(&self) -> usize {
        self.count(|s| matches!(s, OutcomeStatus::Published))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, OutcomeStatus::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, OutcomeStatus::Failed(_)))
    }

    fn count(&self, f: impl Fn(&OutcomeStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(&o.status)).count()
    }
}

/// Hook trait for observing publisher lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait PublisherHook: Send + Sync {
    fn on_batch_start(&self);
    fn on_skipped(&self, message: &ScheduledMessage, now: DateTime<Utc>);
    fn on_published(&self, message: &ScheduledMessage);
    fn on_publish_error(&self, message: &ScheduledMessage, error: &dyn std::error::Error);
    fn on_batch_end(&self, report: &PublishReport);
}

/// Logs lifecycle events using `tracing`.
pub struct DefaultPublisherHook;

impl PublisherHook for DefaultPublisherHook {
    fn on_batch_start(&self) {
        tracing::info!("Publishing batch");
    }

    fn on_skipped(&self, message: &ScheduledMessage, now: DateTime<Utc>) {
        tracing::debug!(
            to = %message.to,
            scheduled_time = %message.scheduled_time,
            %now,
            "Delivery time already passed, skipping"
        );
    }

    fn on_published(&self, message: &ScheduledMessage) {
        tracing::info!(
            to = %message.to,
            scheduled_time = %message.scheduled_time,
            "Message scheduled"
        );
    }

    fn on_publish_error(&self, message: &ScheduledMessage, error: &dyn std::error::Error) {
        tracing::error!(to = %message.to, %error, "Error publishing message");
    }

    fn on_batch_end(&self, report: &PublishReport) {
        tracing::info!(
            sent = report.sent(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Batch finished"
        );
    }
}
