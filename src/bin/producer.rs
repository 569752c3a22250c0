use std::process::ExitCode;

use clap::Parser;
use lapin::{Connection, ConnectionProperties};
use postdated::{
    Publisher, Transport,
    config::{ProducerConfig, PublishMode},
    record::file_source,
    schedule::Schedule,
    transport::{
        RawPayload,
        layers::{DelayUntilLayer, JsonLayer},
        rabbitmq::RabbitMq,
    },
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    postdated::telemetry::init();

    let config = ProducerConfig::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "Producer failed");
            ExitCode::FAILURE
        }
    }
}

#[tracing::instrument(skip_all, fields(mode = ?config.publish_mode))]
async fn run(config: ProducerConfig) -> Result<(), tower::BoxError> {
    let records = file_source(&config.records_path).records()?;
    let schedule = Schedule::new(config.lead_time());

    let connection =
        Connection::connect(&config.broker.broker_url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    let sender: RabbitMq<RawPayload> = RabbitMq::declare(
        channel,
        &config.broker.exchange_name,
        &config.broker.queue_name,
    )
    .await?;

    let transport = Transport::new(sender).layer(JsonLayer);
    let report = match config.publish_mode {
        PublishMode::Deferred => {
            Publisher::new(transport, schedule)
                .publish_batch(records)
                .await
        }
        PublishMode::ClientTimed => {
            Publisher::new(transport.layer(DelayUntilLayer), schedule)
                .publish_batch(records)
                .await
        }
    };

    connection.close(200, "Bye").await?;

    tracing::info!(
        sent = report.sent(),
        skipped = report.skipped(),
        failed = report.failed(),
        "Producer finished"
    );
    Ok(())
}
