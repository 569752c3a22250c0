#![doc = include_str!("../README.md")]

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod fault;
pub mod gateway;
mod publisher;
pub mod record;
pub mod schedule;
pub mod telemetry;
pub mod transport;

#[doc(inline)]
pub use envelope::{DeliveryHeaders, Envelope, Reminder};

#[doc(inline)]
pub use record::{Record, RecordSource, RecordSourceError};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use publisher::{
    DefaultPublisherHook, OutcomeStatus, PublishReport, Publisher, PublisherHook, RecordOutcome,
};

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerError, ConsumerErrorKind, ConsumerHook, DefaultConsumerHook, Delivery,
    Handler, Receiver, Settled, Settlement, Subscription, SubscriptionState,
};

#[doc(inline)]
pub use fault::{BrokerFault, FaultAction, FaultClassifier, FaultKind};

#[doc(inline)]
pub use gateway::{DeliveryReceipt, GatewayError, NotificationGateway, Notify};
