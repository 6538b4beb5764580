mod amqp;
mod cli;
mod config;
mod detection;
mod error;
mod job;
mod telemetry;
mod worker;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command};
use config::{DetectionConfig, WorkerConfig};
use detection::{DetectionClient, DetectionResult};
use error::WorkerError;
use job::JobMessage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use worker::{StopReason, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = WorkerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    telemetry::init(cli.verbose, config.log.format);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match cli.command {
        Command::Run {
            queue,
            timeout_secs,
        } => {
            if let Some(queue) = queue {
                config.amqp.queue = queue;
            }
            if let Some(secs) = timeout_secs {
                config.detection.timeout_secs = secs;
            }
            config.validate().context("invalid configuration")?;

            let reason = run(&config, &cancel).await?;
            info!(reason = %reason, "shutting down");
        }
        Command::Detect { image_url } => {
            config
                .validate_detection()
                .context("invalid configuration")?;
            let result = detect_once(&config.detection, &cancel, &image_url).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Publish { image_url, job_id } => {
            let job = JobMessage {
                job_id: job_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                image_url,
            };
            publish(&config, &job).await?;
            println!("{}", job.job_id);
        }
    }

    Ok(())
}

fn detection_client(config: &DetectionConfig) -> Result<DetectionClient, WorkerError> {
    Ok(DetectionClient::with_base_url(
        config.api_key.clone(),
        config.model.clone(),
        config.base_url.clone(),
        config.timeout(),
    )?)
}

/// Consumes the queue until shutdown or until the broker goes away.
async fn run(config: &WorkerConfig, cancel: &CancellationToken) -> Result<StopReason, WorkerError> {
    let client = detection_client(&config.detection)?;
    let (connection, channel) = amqp::connect(&config.amqp).await?;
    let mut deliveries = amqp::consume(
        &channel,
        &config.amqp,
        config.worker.channel_capacity,
        cancel,
    )
    .await?;

    info!(
        queue = %config.amqp.queue,
        endpoint = %client.endpoint(),
        timeout_secs = config.detection.timeout_secs,
        requeue_policy = ?config.worker.requeue_policy,
        "waiting for messages"
    );

    let mut worker = Worker::new(client, config.worker.requeue_policy);
    let reason = worker.run(cancel, &mut deliveries).await;
    let stats = worker.stats();
    info!(
        acked = stats.acked,
        requeued = stats.requeued,
        discarded = stats.discarded,
        abandoned = stats.abandoned,
        "worker totals"
    );

    // Buffered and in-flight deliveries are unsettled; the broker requeues
    // them once the connection closes.
    drop(deliveries);
    if let Err(err) = connection.close(200, "worker stopped").await {
        warn!(error = %err, "failed to close RabbitMQ connection cleanly");
    }
    Ok(reason)
}

async fn detect_once(
    config: &DetectionConfig,
    cancel: &CancellationToken,
    image_url: &str,
) -> Result<DetectionResult, WorkerError> {
    let client = detection_client(config)?;
    Ok(client.detect(cancel, image_url).await?)
}

async fn publish(config: &WorkerConfig, job: &JobMessage) -> Result<(), WorkerError> {
    let (connection, channel) = amqp::connect(&config.amqp).await?;
    amqp::publish(&channel, &config.amqp.queue, job).await?;
    if let Err(err) = connection.close(200, "published").await {
        warn!(error = %err, "failed to close RabbitMQ connection cleanly");
    }
    Ok(())
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    cancel.cancel();
}
