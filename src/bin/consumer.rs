use std::process::ExitCode;

use clap::Parser;
use postdated::{
    Consumer, Notify,
    config::ConsumerConfig,
    consumer::rabbitmq::RabbitMqReceiver,
    fault::FaultClassifier,
    gateway::twilio::Twilio,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    postdated::telemetry::init();

    let config = ConsumerConfig::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "Consumer failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ConsumerConfig) -> Result<(), tower::BoxError> {
    let receiver = RabbitMqReceiver::connect(
        &config.broker.broker_url,
        &config.broker.queue_name,
        config.prefetch,
    )
    .await?;

    let busy_backoff = config.busy_backoff();
    let twilio = Twilio::new(
        config.twilio.twilio_account_sid,
        config.twilio.twilio_auth_token,
        config.twilio.twilio_messaging_service_sid,
    );

    let consumer = Consumer::new(
        receiver,
        Notify::new(twilio),
        FaultClassifier::new(busy_backoff),
    );

    let subscription = consumer.subscription();
    let interrupted = CancellationToken::new();
    let signalled = interrupted.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                signalled.cancel();
                subscription.stop();
            }
            Err(error) => tracing::error!(%error, "Failed to install Ctrl+C handler"),
        }
    });

    consumer.run().await?;

    if !interrupted.is_cancelled() {
        return Err("Broker ended the subscription".into());
    }
    Ok(())
}
