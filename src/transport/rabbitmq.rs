use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    BasicProperties, Channel, ExchangeKind,
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;

use crate::{
    DeliveryHeaders, Envelope, schedule,
    transport::{Sender, ToBytes},
};

/// Header read by the delayed message exchange plugin, in milliseconds.
pub const DELAY_HEADER: &str = "x-delay";
/// Destination address, duplicated out of band for consumers that only read headers.
pub const TO_HEADER: &str = "to";

const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";

/// RabbitMQ sender with broker-side deferred visibility.
///
/// Messages go to a `x-delayed-message` exchange which holds each one for the
/// number of milliseconds given in its [`DELAY_HEADER`] before routing it to
/// the queue. The publisher never blocks on the schedule.
///
/// The channel is wrapped in `Arc<Mutex<_>>` so clones of the sender share one
/// confirm-mode channel.
pub struct RabbitMq<M> {
    channel: Arc<Mutex<Channel>>,
    exchange: String,
    routing_key: String,
    msg: std::marker::PhantomData<M>,
}

impl<M> Clone for RabbitMq<M> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            msg: std::marker::PhantomData,
        }
    }
}

impl<M> RabbitMq<M> {
    /// Declare the delayed exchange and the queue bound to it, then enable
    /// publisher confirms on `channel`.
    ///
    /// Declarations are idempotent; the queue name doubles as routing key.
    #[tracing::instrument(skip(channel))]
    pub async fn declare(
        channel: Channel,
        exchange: &str,
        queue: &str,
    ) -> Result<Self, lapin::Error> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-delayed-type"),
            AMQPValue::LongString(LongString::from("direct")),
        );

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.to_owned()),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                queue,
                exchange,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        tracing::info!("Delayed exchange and queue declared");

        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
            exchange: exchange.to_owned(),
            routing_key: queue.to_owned(),
            msg: std::marker::PhantomData,
        })
    }
}

#[async_trait]
impl<H, M> Sender<H, M> for RabbitMq<M>
where
    H: RabbitMqAttributes + Send + Sync + 'static,
    M: ToBytes + Send + Sync,
{
    type Error = lapin::Error;

    /// Publish and wait for the broker confirmation.
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        let mut amqp_headers = FieldTable::default();
        for (k, v) in envelope.headers.attributes() {
            amqp_headers.insert(k, v);
        }

        let properties = BasicProperties::default()
            .with_headers(amqp_headers)
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(2);

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                envelope.message.to_bytes(),
                properties,
            )
            .await?
            .await?;

        Ok(())
    }
}

/// AMQP message headers derived from envelope headers.
pub trait RabbitMqAttributes {
    fn attributes(&self) -> impl Iterator<Item = (ShortString, AMQPValue)>;
}

impl RabbitMqAttributes for DeliveryHeaders {
    /// The delay is measured from the moment of publishing and never negative.
    fn attributes(&self) -> impl Iterator<Item = (ShortString, AMQPValue)> {
        let delay = schedule::delay_until(self.scheduled_time, Utc::now());
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

        [
            (
                ShortString::from(TO_HEADER),
                AMQPValue::LongString(LongString::from(self.to.as_str())),
            ),
            (
                ShortString::from(DELAY_HEADER),
                AMQPValue::LongLongInt(delay_ms),
            ),
        ]
        .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(offset: chrono::Duration) -> DeliveryHeaders {
        DeliveryHeaders {
            to: "+15550100".into(),
            scheduled_time: Utc::now() + offset,
        }
    }

    fn delay_of(headers: &DeliveryHeaders) -> i64 {
        headers
            .attributes()
            .find_map(|(k, v)| match (k.as_str(), v) {
                (DELAY_HEADER, AMQPValue::LongLongInt(ms)) => Some(ms),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn delay_header_counts_milliseconds_until_due() {
        let delay = delay_of(&headers(chrono::Duration::minutes(5)));
        assert!(delay > 299_000 && delay <= 300_000, "delay was {delay}");
    }

    #[test]
    fn overdue_headers_never_carry_a_negative_delay() {
        assert_eq!(delay_of(&headers(chrono::Duration::minutes(-10))), 0);
    }

    #[test]
    fn destination_is_exposed_as_header() {
        let to = headers(chrono::Duration::zero())
            .attributes()
            .find(|(k, _)| k.as_str() == TO_HEADER)
            .map(|(_, v)| v);
        assert_eq!(
            to,
            Some(AMQPValue::LongString(LongString::from("+15550100")))
        );
    }
}
