use async_trait::async_trait;
use lapin::{
    Channel, Connection, ConnectionProperties,
    acker::Acker,
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
};
use tokio_stream::StreamExt as _;

use crate::{
    Reminder,
    consumer::{Delivery, Receiver, Settlement},
    fault::{BrokerFault, FaultKind},
};

const CONSUMER_TAG: &str = "postdated-consumer";
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Translate a lapin error into a broker fault kind.
///
/// Only channel and connection exceptions carry a reply code; transport level
/// failures end up as [`FaultKind::Other`].
pub fn fault_kind(error: &lapin::Error) -> FaultKind {
    match error {
        lapin::Error::ProtocolError(amqp) => match amqp.get_id() {
            404 => FaultKind::EntityNotFound,
            403 | 530 => FaultKind::Unauthorized,
            405 | 320 => FaultKind::EntityDisabled,
            406 => FaultKind::MessageLockLost,
            506 => FaultKind::ServiceBusy,
            _ => FaultKind::Other,
        },
        _ => FaultKind::Other,
    }
}

fn fault(error: lapin::Error) -> BrokerFault {
    BrokerFault::with_source(fault_kind(&error), error)
}

/// The consumer stream only ends on its own when the broker cancels the
/// consumer, which it does once the queue is deleted, or when the channel
/// goes away underneath it.
fn end_of_stream_fault(channel_open: bool) -> BrokerFault {
    if channel_open {
        BrokerFault::new(FaultKind::EntityNotFound)
    } else {
        BrokerFault::new(FaultKind::Other)
    }
}

/// Settlement failures always mean the broker no longer holds the delivery
/// for us, so it will be handed out again.
fn settlement_fault(error: lapin::Error) -> BrokerFault {
    let kind = match fault_kind(&error) {
        FaultKind::Other => FaultKind::MessageLockLost,
        kind => kind,
    };
    BrokerFault::with_source(kind, error)
}

/// RabbitMQ receiver with manual acknowledgements.
///
/// `complete` acks the delivery, `abandon` nacks it with requeue. The receiver
/// owns its connection and closes it on [`Receiver::close`].
pub struct RabbitMqReceiver {
    connection: Connection,
    channel: Channel,
    queue: String,
    prefetch: u16,
    consumer: Option<lapin::Consumer>,
    cancelled: bool,
    closed: bool,
}

impl RabbitMqReceiver {
    /// Open a connection and a channel. Nothing is consumed before
    /// [`Receiver::subscribe`].
    #[tracing::instrument(skip(url))]
    pub async fn connect(url: &str, queue: &str, prefetch: u16) -> Result<Self, BrokerFault> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(fault)?;
        let channel = connection.create_channel().await.map_err(fault)?;

        tracing::info!("Connected to RabbitMQ");

        Ok(Self {
            connection,
            channel,
            queue: queue.to_owned(),
            prefetch,
            consumer: None,
            cancelled: false,
            closed: false,
        })
    }

    fn decode(
        &self,
        delivery: AmqpDelivery,
    ) -> Result<Delivery<RabbitMqSettlement>, (Acker, BrokerFault)> {
        let delivery_count = delivery_count(&delivery);
        match serde_json::from_slice::<Reminder>(&delivery.data) {
            Ok(reminder) => Ok(Delivery::new(
                reminder.to,
                reminder.body,
                delivery_count,
                RabbitMqSettlement {
                    acker: delivery.acker,
                },
            )),
            Err(err) => Err((
                delivery.acker,
                BrokerFault::with_source(FaultKind::Other, err),
            )),
        }
    }
}

/// Quorum queues report previous attempts in `x-delivery-count`; classic
/// queues only flag redeliveries.
fn delivery_count(delivery: &AmqpDelivery) -> u32 {
    let previous = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .get(&ShortString::from(DELIVERY_COUNT_HEADER))
        })
        .and_then(|value| match value {
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
            _ => None,
        });

    match previous {
        Some(n) => n.saturating_add(1),
        None if delivery.redelivered => 2,
        None => 1,
    }
}

#[async_trait]
impl Receiver for RabbitMqReceiver {
    type Settlement = RabbitMqSettlement;

    #[tracing::instrument(skip(self), fields(queue = %self.queue))]
    async fn subscribe(&mut self) -> Result<(), BrokerFault> {
        self.channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(fault)?;

        self.channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(fault)?;

        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(fault)?;

        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next(&mut self) -> Option<Result<Delivery<Self::Settlement>, BrokerFault>> {
        if self.cancelled {
            return None;
        }

        let delivery = match self.consumer.as_mut()?.next().await {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => return Some(Err(fault(err))),
            None if self.closed => return None,
            None => {
                self.cancelled = true;
                let fault = end_of_stream_fault(self.channel.status().connected());
                tracing::warn!(kind = %fault.kind(), "Broker ended the subscription");
                return Some(Err(fault));
            }
        };

        match self.decode(delivery) {
            Ok(delivery) => Some(Ok(delivery)),
            Err((acker, fault)) => {
                // Undecodable payloads are dropped, not requeued.
                if let Err(err) = acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
                {
                    tracing::warn!(error = %err, "Failed to reject undecodable message");
                }
                Some(Err(fault))
            }
        }
    }

    #[tracing::instrument(skip(self), fields(queue = %self.queue))]
    async fn close(&mut self) -> Result<(), BrokerFault> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        if let Some(consumer) = self.consumer.take() {
            if self.channel.status().connected() {
                self.channel
                    .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
                    .await
                    .map_err(fault)?;
            }
        }

        if self.connection.status().connected() {
            self.connection.close(200, "Bye").await.map_err(fault)?;
        }

        tracing::info!("RabbitMQ connection closed");
        Ok(())
    }
}

/// Settlement handle for a RabbitMQ delivery.
pub struct RabbitMqSettlement {
    acker: Acker,
}

#[async_trait]
impl Settlement for RabbitMqSettlement {
    async fn complete(self) -> Result<(), BrokerFault> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(settlement_fault)
    }

    async fn abandon(self) -> Result<(), BrokerFault> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(settlement_fault)
    }
}
