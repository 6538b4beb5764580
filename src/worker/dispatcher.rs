use std::fmt;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::delivery::{Delivery, Settlement};
use super::report::{JobOutcome, JobReport};
use crate::detection::Detect;
use crate::error::ErrorClass;
use crate::job::JobMessage;

/// Whether inference failures go back on the queue.
///
/// `Always` requeues every inference failure, including ones the detection
/// service rejected outright; such a job can loop until someone purges it.
/// `TransientOnly` discards permanent failures instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequeuePolicy {
    #[default]
    Always,
    TransientOnly,
}

impl RequeuePolicy {
    pub fn requeue(self, class: ErrorClass) -> bool {
        match (self, class) {
            (_, ErrorClass::Decode) => false,
            (RequeuePolicy::Always, _) => true,
            (RequeuePolicy::TransientOnly, ErrorClass::Transient) => true,
            (RequeuePolicy::TransientOnly, ErrorClass::Permanent) => false,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token fired.
    Cancelled,
    /// The queue closed the delivery channel (upstream connection lost).
    ChannelClosed,
}

/// The two states of the dispatcher. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Stopped(StopReason),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::ChannelClosed => write!(f, "delivery channel closed"),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Running => write!(f, "RUNNING"),
            State::Stopped(reason) => write!(f, "STOPPED ({reason})"),
        }
    }
}

/// Counters by settlement, reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    /// Deliveries dropped unsettled because of shutdown.
    pub abandoned: u64,
}

impl WorkerStats {
    fn record(&mut self, settlement: Option<Settlement>) {
        match settlement {
            Some(Settlement::Ack) => self.acked += 1,
            Some(Settlement::Nack { requeue: true }) => self.requeued += 1,
            Some(Settlement::Nack { requeue: false }) => self.discarded += 1,
            None => self.abandoned += 1,
        }
    }
}

/// Serial consumer: one delivery at a time, each settled before the next is
/// received, so acknowledgements follow delivery order.
pub struct Worker<C> {
    detector: C,
    policy: RequeuePolicy,
    state: State,
    stats: WorkerStats,
}

impl<C: Detect> Worker<C> {
    pub fn new(detector: C, policy: RequeuePolicy) -> Self {
        Self {
            detector,
            policy,
            state: State::Running,
            stats: WorkerStats::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Drives the loop until `cancel` fires or `deliveries` closes.
    ///
    /// Calling this again after it stopped returns the original reason.
    pub async fn run<D: Delivery>(
        &mut self,
        cancel: &CancellationToken,
        deliveries: &mut mpsc::Receiver<D>,
    ) -> StopReason {
        loop {
            if let State::Stopped(reason) = self.state {
                return reason;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                delivery = deliveries.recv() => Some(delivery),
            };

            match next {
                None => self.stop(StopReason::Cancelled),
                Some(None) => self.stop(StopReason::ChannelClosed),
                Some(Some(delivery)) => {
                    if self.handle(cancel, delivery).await.is_none() {
                        self.stop(StopReason::Cancelled);
                    }
                }
            }
        }
    }

    fn stop(&mut self, reason: StopReason) {
        self.state = State::Stopped(reason);
        info!(reason = %reason, "worker stopped");
    }

    /// Handles one delivery and returns how it was settled.
    ///
    /// Returns `None` when cancellation interrupted detection; the delivery
    /// is then dropped without any terminal operation.
    pub async fn handle<D: Delivery>(
        &mut self,
        cancel: &CancellationToken,
        delivery: D,
    ) -> Option<Settlement> {
        let started_at = Utc::now();

        let job = match JobMessage::decode(delivery.payload()) {
            Ok(job) => job,
            Err(err) => {
                let settlement = Settlement::Nack { requeue: false };
                let outcome = JobOutcome::Failed {
                    class: err.class(),
                    error: err.to_string(),
                };
                JobReport::new(None, None, outcome, Some(settlement), started_at).log();
                self.settle(None, delivery, settlement).await;
                return Some(settlement);
            }
        };

        info!(job_id = %job.job_id, image_url = %job.image_url, "processing job");

        let (outcome, settlement) = match self.detector.detect(cancel, &job.image_url).await {
            Ok(result) => {
                for prediction in &result.predictions {
                    debug!(
                        job_id = %job.job_id,
                        class = prediction.class(),
                        confidence = prediction.confidence(),
                        "prediction"
                    );
                }
                let outcome = JobOutcome::Completed {
                    predictions: result.len(),
                };
                (outcome, Some(Settlement::Ack))
            }
            Err(err) if err.is_cancelled() => (JobOutcome::Interrupted, None),
            Err(err) => {
                let class = err.class();
                let settlement = Settlement::Nack {
                    requeue: self.policy.requeue(class),
                };
                let outcome = JobOutcome::Failed {
                    class,
                    error: err.to_string(),
                };
                (outcome, Some(settlement))
            }
        };

        JobReport::new(
            Some(&job.job_id),
            Some(&job.image_url),
            outcome,
            settlement,
            started_at,
        )
        .log();

        match settlement {
            Some(settlement) => self.settle(Some(&job.job_id), delivery, settlement).await,
            None => {
                drop(delivery);
                self.stats.record(None);
            }
        }
        settlement
    }

    async fn settle<D: Delivery>(
        &mut self,
        job_id: Option<&str>,
        delivery: D,
        settlement: Settlement,
    ) {
        self.stats.record(Some(settlement));
        if let Err(err) = settlement.apply(delivery).await {
            error!(
                job_id = job_id.unwrap_or("-"),
                settlement = %settlement,
                error = %err,
                "failed to settle delivery"
            );
        }
    }
}
