//! Bus-facing side of a stage worker: decode, begin, process, settle, ack.

use std::sync::Arc;

use log::{debug, error, warn};
use serde::Serialize;

use crate::bus::{Ack, Delivery, DeliveryHandler};
use crate::error::WorkerError;
use crate::pipeline::error::OrchestratorError;
use crate::pipeline::model::StageKey;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::retry::FailureDecision;
use crate::pipeline::store::{Attempt, StageStore};
use crate::pipeline::tasks::{decode, StageTask};

/// One stage's processing step.
pub trait StageWorker: Send + Sync + 'static {
    type Task: StageTask;

    /// Runs the stage for `task` and returns the `result_ref` to record.
    /// `attempt` is [`Attempt::Redelivery`] when the stage already
    /// completed and this run is a correction.
    fn process(&self, task: &Self::Task, attempt: Attempt) -> Result<Option<String>, WorkerError>;
}

/// Adapts a [`StageWorker`] to the bus.
pub struct StageHandler<W> {
    worker: W,
    orchestrator: Arc<Orchestrator>,
}

impl<W: StageWorker> StageHandler<W> {
    pub fn new(worker: W, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            worker,
            orchestrator,
        }
    }
}

impl<W: StageWorker> DeliveryHandler for StageHandler<W> {
    fn handle(&self, delivery: &Delivery) -> Ack {
        handle_delivery(&self.worker, &self.orchestrator, delivery)
    }
}

/// Processes one delivery. Undecodable payloads and deliveries for
/// unknown jobs are acknowledged and dropped; transient store errors are
/// nacked so the bus tries again.
pub fn handle_delivery<W: StageWorker>(
    worker: &W,
    orchestrator: &Orchestrator,
    delivery: &Delivery,
) -> Ack {
    let task: W::Task = match decode(&delivery.payload) {
        Ok(task) => task,
        Err(e) => {
            error!(
                "Dropping undecodable message {} on {}: {}",
                delivery.message_id, delivery.topic, e
            );
            return Ack::Ack;
        }
    };
    let key = task.key();
    let _span = tracing::info_span!("stage", key = %key, attempt = delivery.attempt).entered();
    let backoff = Ack::Nack {
        delay: orchestrator.policy().delay_for(delivery.attempt),
    };

    let attempt = match orchestrator.begin_attempt(&key) {
        Ok(attempt) => attempt,
        Err(e @ (OrchestratorError::JobNotFound(_) | OrchestratorError::StageNotFound(_))) => {
            warn!("Dropping message {} for {}: {}", delivery.message_id, key, e);
            return Ack::Ack;
        }
        Err(e) => {
            error!("Failed to start {}: {}", key, e);
            return backoff;
        }
    };
    if attempt == Attempt::Skipped {
        return Ack::Ack;
    }

    match worker.process(&task, attempt) {
        Ok(result_ref) => match orchestrator.on_stage_completed(&key, result_ref.as_deref()) {
            Ok(_) => Ack::Ack,
            Err(e) => {
                error!("Failed to record completion of {}: {}", key, e);
                backoff
            }
        },
        Err(e) => {
            let message = e.to_string();
            match orchestrator.on_stage_failed(&key, &message) {
                Ok(FailureDecision::Retry { delay }) => Ack::Nack { delay },
                Ok(FailureDecision::Exhausted) => {
                    error!("Stage {} gave up: {}", key, message);
                    Ack::Ack
                }
                Ok(FailureDecision::Settled) => Ack::Ack,
                Err(record_err) => {
                    error!("Failed to record failure of {} ({}): {}", key, message, record_err);
                    backoff
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ItemFailure {
    page_number: u32,
    error: String,
}

/// Per-item outcome of a legacy whole-document stage, stored as the
/// stage's metadata. A bad page never stops the rest of the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    attempted: usize,
    succeeded: usize,
    failures: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ok(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    pub fn record_err(&mut self, page_number: u32, error: &WorkerError) {
        warn!("Page {} failed: {}", page_number, error);
        self.attempted += 1;
        self.failures.push(ItemFailure {
            page_number,
            error: error.to_string(),
        });
    }

    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Stores the report on the stage row. Fails with
    /// [`WorkerError::BatchFailed`] when every attempted item failed.
    pub fn finish(self, store: &StageStore, key: &StageKey) -> Result<(), WorkerError> {
        store.record_metadata(key, &serde_json::to_value(&self)?)?;
        debug!(
            "Batch {}: {}/{} items succeeded",
            key, self.succeeded, self.attempted
        );
        if self.attempted > 0 && self.succeeded == 0 {
            let first = self
                .failures
                .first()
                .map(|f| format!("page {}: {}", f.page_number, f.error))
                .unwrap_or_default();
            return Err(WorkerError::BatchFailed(format!(
                "{} of {} items failed, first {}",
                self.failures.len(),
                self.attempted,
                first
            )));
        }
        Ok(())
    }
}
