//! Command line and environment configuration for the binaries.
//!
//! Every option can be given as a flag or through its environment variable.
//! The binaries load a `.env` file first, so local setups can keep their
//! credentials there.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, ValueEnum};

use crate::{fault::DEFAULT_BUSY_BACKOFF_MS, schedule::DEFAULT_LEAD_TIME_MINUTES};

/// Broker connection shared by both binaries.
#[derive(Debug, Clone, Args)]
pub struct BrokerConfig {
    /// AMQP URL of the broker.
    #[arg(long, env = "BROKER_URL", default_value = "amqp://127.0.0.1:5672/%2f")]
    pub broker_url: String,

    /// Queue holding the scheduled reminders.
    #[arg(long, env = "QUEUE_NAME", default_value = "reminders")]
    pub queue_name: String,

    /// Delayed message exchange the producer publishes to.
    #[arg(long, env = "EXCHANGE_NAME", default_value = "reminders.delayed")]
    pub exchange_name: String,
}

/// Who waits for the scheduled instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PublishMode {
    /// The broker withholds each message until it is due.
    #[default]
    Deferred,
    /// The producer sleeps until each message is due, then publishes it.
    ClientTimed,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "postdated-producer", version, about = "Schedule reminders for upcoming appointments")]
pub struct ProducerConfig {
    #[command(flatten)]
    pub broker: BrokerConfig,

    /// CSV file with `Name`, `Phone` and `AppointmentDateTime` columns. A
    /// `.json` file is read as an array of the same rows.
    #[arg(long, env = "RECORDS_PATH", default_value = "appointments.csv")]
    pub records_path: PathBuf,

    /// How long before the appointment the reminder goes out, in minutes.
    #[arg(long, env = "LEAD_TIME_MINUTES", default_value_t = DEFAULT_LEAD_TIME_MINUTES)]
    pub lead_time_minutes: i64,

    #[arg(long, env = "PUBLISH_MODE", value_enum, default_value_t = PublishMode::Deferred)]
    pub publish_mode: PublishMode,
}

impl ProducerConfig {
    pub fn lead_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lead_time_minutes)
    }
}

/// Credentials for the SMS gateway.
#[derive(Clone, Args)]
pub struct TwilioConfig {
    #[arg(long, env = "TWILIO_ACCOUNT_SID")]
    pub twilio_account_sid: String,

    #[arg(long, env = "TWILIO_AUTH_TOKEN", hide_env_values = true)]
    pub twilio_auth_token: String,

    #[arg(long, env = "TWILIO_MESSAGING_SERVICE_SID")]
    pub twilio_messaging_service_sid: String,
}

impl std::fmt::Debug for TwilioConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwilioConfig")
            .field("twilio_account_sid", &self.twilio_account_sid)
            .field("twilio_auth_token", &"***")
            .field(
                "twilio_messaging_service_sid",
                &self.twilio_messaging_service_sid,
            )
            .finish()
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "postdated-consumer", version, about = "Deliver reminders as they become due")]
pub struct ConsumerConfig {
    #[command(flatten)]
    pub broker: BrokerConfig,

    /// Pause after the broker reports it is busy, in milliseconds.
    #[arg(long, env = "BUSY_BACKOFF_MS", default_value_t = DEFAULT_BUSY_BACKOFF_MS)]
    pub busy_backoff_ms: u64,

    /// Unacknowledged deliveries the broker may push at once.
    #[arg(long, env = "PREFETCH", default_value_t = 1)]
    pub prefetch: u16,

    #[command(flatten)]
    pub twilio: TwilioConfig,
}

impl ConsumerConfig {
    pub fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWILIO: [&str; 6] = [
        "--twilio-account-sid",
        "AC123",
        "--twilio-auth-token",
        "secret",
        "--twilio-messaging-service-sid",
        "MG456",
    ];

    #[test]
    fn producer_defaults() {
        let config = ProducerConfig::try_parse_from(["postdated-producer"]).unwrap();

        assert_eq!(config.lead_time(), chrono::Duration::minutes(15));
        assert_eq!(config.publish_mode, PublishMode::Deferred);
        assert_eq!(config.broker.queue_name, "reminders");
        assert_eq!(config.records_path, PathBuf::from("appointments.csv"));
    }

    #[test]
    fn producer_flags_override_defaults() {
        let config = ProducerConfig::try_parse_from([
            "postdated-producer",
            "--lead-time-minutes",
            "30",
            "--publish-mode",
            "client-timed",
            "--queue-name",
            "sms",
        ])
        .unwrap();

        assert_eq!(config.lead_time(), chrono::Duration::minutes(30));
        assert_eq!(config.publish_mode, PublishMode::ClientTimed);
        assert_eq!(config.broker.queue_name, "sms");
    }

    #[test]
    fn consumer_backoff_defaults_to_one_second() {
        let args = std::iter::once("postdated-consumer").chain(TWILIO);
        let config = ConsumerConfig::try_parse_from(args).unwrap();

        assert_eq!(config.busy_backoff_ms, DEFAULT_BUSY_BACKOFF_MS);
        assert_eq!(config.busy_backoff(), crate::fault::DEFAULT_BUSY_BACKOFF);
        assert_eq!(config.busy_backoff(), Duration::from_millis(1000));
        assert_eq!(config.prefetch, 1);
    }

    #[test]
    fn consumer_rejects_unknown_publish_flags() {
        let args = ["postdated-consumer", "--publish-mode", "deferred"]
            .into_iter()
            .chain(TWILIO);
        assert!(ConsumerConfig::try_parse_from(args).is_err());
    }

    #[test]
    fn auth_token_is_not_printed() {
        let args = std::iter::once("postdated-consumer").chain(TWILIO);
        let config = ConsumerConfig::try_parse_from(args).unwrap();

        let printed = format!("{config:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains("AC123"));
    }
}
