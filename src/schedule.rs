//! Delivery-time arithmetic.
//!
//! A reminder is due `lead_time` before the record's target time. Only
//! reminders whose instant is still strictly in the future are published;
//! overdue ones are dropped rather than sent late.

use chrono::{DateTime, Duration, Utc};

use crate::{DeliveryHeaders, Envelope, Record, Reminder};

/// Lead time applied when none is configured.
pub const DEFAULT_LEAD_TIME_MINUTES: i64 = 15;

/// Compute the delivery instant for a target time.
pub fn scheduled_time(target_time: DateTime<Utc>, lead_time: Duration) -> DateTime<Utc> {
    target_time - lead_time
}

/// Whether a message scheduled at `scheduled` may still be published at `now`.
pub fn is_eligible(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    scheduled > now
}

/// Time left until `scheduled`, zero if it has already passed.
pub fn delay_until(scheduled: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (scheduled - now).to_std().unwrap_or(std::time::Duration::ZERO)
}

/// Source of the current instant used for eligibility decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<F> Clock for F
where
    F: Fn() -> DateTime<Utc> + Send + Sync,
{
    fn now(&self) -> DateTime<Utc> {
        self()
    }
}

/// A message derived from exactly one [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledMessage {
    pub to: String,
    pub body: String,
    pub scheduled_time: DateTime<Utc>,
}

impl ScheduledMessage {
    /// Split into delivery headers and the queued payload.
    pub fn into_envelope(self) -> Envelope<DeliveryHeaders, Reminder> {
        Envelope {
            headers: DeliveryHeaders {
                to: self.to.clone(),
                scheduled_time: self.scheduled_time,
            },
            message: Reminder {
                to: self.to,
                body: self.body,
            },
        }
    }
}

/// Turns records into scheduled messages using a fixed lead time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    lead_time: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_LEAD_TIME_MINUTES))
    }
}

impl Schedule {
    pub fn new(lead_time: Duration) -> Self {
        Self { lead_time }
    }

    pub fn lead_time(&self) -> Duration {
        self.lead_time
    }

    /// Build the reminder for `record`.
    pub fn message_for(&self, record: &Record) -> ScheduledMessage {
        ScheduledMessage {
            to: record.contact.clone(),
            body: format!(
                "Hello {}, you have an appointment with us in {} minutes. See you soon.",
                record.name,
                self.lead_time.num_minutes()
            ),
            scheduled_time: scheduled_time(record.target_time, self.lead_time),
        }
    }
}
