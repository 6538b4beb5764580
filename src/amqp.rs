//! RabbitMQ side of the worker.
//!
//! [`consume`] turns a `lapin` consumer into a bounded channel of
//! [`AmqpDelivery`] values for the dispatcher. When the consumer stream
//! ends or fails, the channel closes and the dispatcher stops.

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AmqpConfig;
use crate::job::JobMessage;
use crate::worker::{AckError, Delivery};

/// Persistent delivery mode in AMQP 0-9-1.
const PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("RabbitMQ error: {0}")]
    Lapin(#[from] lapin::Error),

    #[error("failed to encode job message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("broker did not confirm publish to `{0}`")]
    NotConfirmed(String),
}

/// A `lapin` delivery adapted to the dispatcher's [`Delivery`] seam.
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.inner.data
    }

    async fn ack(self) -> Result<(), AckError> {
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| AckError(Box::new(e)))
    }

    async fn nack(self, requeue: bool) -> Result<(), AckError> {
        self.inner
            .acker
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map_err(|e| AckError(Box::new(e)))
    }
}

/// Opens a connection and channel and declares the durable job queue.
pub async fn connect(config: &AmqpConfig) -> Result<(Connection, Channel), AmqpError> {
    let connection = Connection::connect(&config.url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .basic_qos(config.prefetch, BasicQosOptions::default())
        .await?;

    info!(queue = %config.queue, prefetch = config.prefetch, "connected to RabbitMQ");
    Ok((connection, channel))
}

/// Starts consuming and pumps deliveries into a channel of `capacity`.
///
/// The pump stops on cancellation, on consumer error, or when the broker
/// closes the consumer; in every case the receiver observes a closed channel.
pub async fn consume(
    channel: &Channel,
    config: &AmqpConfig,
    capacity: usize,
    cancel: &CancellationToken,
) -> Result<mpsc::Receiver<AmqpDelivery>, AmqpError> {
    let mut consumer = channel
        .basic_consume(
            &config.queue,
            &config.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let (tx, rx) = mpsc::channel(capacity);
    let cancel = cancel.clone();

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(inner)) => {
                    debug!(delivery_tag = inner.delivery_tag, "delivery received");
                    if tx.send(AmqpDelivery { inner }).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(error = %err, "consumer failed, closing delivery channel");
                    break;
                }
                None => {
                    warn!("consumer closed by broker");
                    break;
                }
            }
        }
    });

    Ok(rx)
}

/// Publishes a job as persistent JSON on `queue` via the default exchange.
pub async fn publish(channel: &Channel, queue: &str, job: &JobMessage) -> Result<(), AmqpError> {
    let payload = job.encode()?;
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(PERSISTENT);

    let confirm = channel
        .basic_publish("", queue, BasicPublishOptions::default(), &payload, properties)
        .await?
        .await?;
    if confirm.is_nack() {
        return Err(AmqpError::NotConfirmed(queue.to_owned()));
    }

    info!(job_id = %job.job_id, queue, "job published");
    Ok(())
}
