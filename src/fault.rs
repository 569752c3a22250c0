//! Broker fault classification.
//!
//! Receivers translate their vendor specific errors into the closed set of
//! [`FaultKind`]s; [`FaultClassifier`] alone decides whether the subscription
//! keeps running.

use std::time::Duration;

use tracing_error::SpanTrace;

/// Back-off applied after a busy fault when none is configured, in milliseconds.
pub const DEFAULT_BUSY_BACKOFF_MS: u64 = 1000;

pub const DEFAULT_BUSY_BACKOFF: Duration = Duration::from_millis(DEFAULT_BUSY_BACKOFF_MS);

/// Vendor neutral broker error kinds reported on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The queue exists but is not accepting consumers.
    EntityDisabled,
    /// The queue or exchange does not exist.
    EntityNotFound,
    /// Credentials were rejected or lack the required permission.
    Unauthorized,
    /// A delivery could not be settled; the broker will hand it out again.
    MessageLockLost,
    /// The broker asked clients to slow down.
    ServiceBusy,
    Other,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultKind::EntityDisabled => "entity disabled",
            FaultKind::EntityNotFound => "entity not found",
            FaultKind::Unauthorized => "unauthorized",
            FaultKind::MessageLockLost => "message lock lost",
            FaultKind::ServiceBusy => "service busy",
            FaultKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// What the subscription loop does about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Close the subscription for good.
    Stop,
    LogAndContinue,
    /// Pause receiving for the given duration, then continue.
    Backoff(Duration),
}

/// Maps fault kinds to actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultClassifier {
    busy_backoff: Duration,
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_BUSY_BACKOFF)
    }
}

impl FaultClassifier {
    pub fn new(busy_backoff: Duration) -> Self {
        Self { busy_backoff }
    }

    /// Pause used for busy faults, and between subscribe retries.
    pub fn busy_backoff(&self) -> Duration {
        self.busy_backoff
    }

    pub fn classify(&self, kind: FaultKind) -> FaultAction {
        match kind {
            FaultKind::EntityDisabled | FaultKind::EntityNotFound | FaultKind::Unauthorized => {
                FaultAction::Stop
            }
            FaultKind::ServiceBusy => FaultAction::Backoff(self.busy_backoff),
            FaultKind::MessageLockLost | FaultKind::Other => FaultAction::LogAndContinue,
        }
    }
}

/// An error reported by the broker on a subscription or during settlement.
#[derive(Debug)]
pub struct BrokerFault {
    context: SpanTrace,
    kind: FaultKind,
    source: Option<tower::BoxError>,
}

impl BrokerFault {
    /// A fault without an underlying vendor error.
    pub fn new(kind: FaultKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
            source: None,
        }
    }

    /// A fault translated from a vendor error.
    pub fn with_source(kind: FaultKind, source: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }
}

impl std::fmt::Display for BrokerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some(err) => writeln!(f, "Broker fault ({}): {err}", self.kind),
            None => writeln!(f, "Broker fault ({})", self.kind),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BrokerFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| err.as_ref() as &(dyn std::error::Error + 'static))
    }
}
