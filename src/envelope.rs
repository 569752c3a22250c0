//! Wire-level message container.
//!
//! An [`Envelope`] is the unit of queue transport: a payload plus out-of-band
//! headers. For reminders the headers are [`DeliveryHeaders`] (destination and
//! the instant before which the broker must not deliver) and the payload is a
//! [`Reminder`], serialized to JSON on its way to the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message container used by the publish and receive paths.
///
/// `H` carries delivery metadata, `M` the payload. Keeping them apart lets
/// transport layers rewrite the payload (e.g. JSON encoding) while senders map
/// the headers onto broker specific properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

/// Out-of-band delivery metadata attached to every published reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHeaders {
    /// Destination address handed to the notification gateway.
    pub to: String,
    /// The broker must not make the message visible before this instant.
    pub scheduled_time: DateTime<Utc>,
}

/// Reminder payload as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub to: String,
    pub body: String,
}
