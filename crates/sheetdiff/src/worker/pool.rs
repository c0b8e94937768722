use std::sync::Arc;

use log::info;

use crate::bus::{MessageBus, Subscription, Topic};
use crate::config::WorkersConfig;
use crate::error::BusError;
use crate::pipeline::orchestrator::Orchestrator;
use crate::worker::diff::DiffWorker;
use crate::worker::ocr::OcrWorker;
use crate::worker::runner::StageHandler;
use crate::worker::summary::SummaryWorker;

/// The three stage consumers, each with its own bounded concurrency.
pub struct WorkerPool {
    subscriptions: Vec<Subscription>,
}

impl WorkerPool {
    pub fn start(
        bus: &dyn MessageBus,
        orchestrator: Arc<Orchestrator>,
        ocr: OcrWorker,
        diff: DiffWorker,
        summary: SummaryWorker,
        config: &WorkersConfig,
    ) -> Result<Self, BusError> {
        let subscriptions = vec![
            bus.subscribe(
                Topic::Ocr,
                config.ocr_concurrency.max(1),
                Arc::new(StageHandler::new(ocr, Arc::clone(&orchestrator))),
            )?,
            bus.subscribe(
                Topic::Diff,
                config.diff_concurrency.max(1),
                Arc::new(StageHandler::new(diff, Arc::clone(&orchestrator))),
            )?,
            bus.subscribe(
                Topic::Summary,
                config.summary_concurrency.max(1),
                Arc::new(StageHandler::new(summary, orchestrator)),
            )?,
        ];

        let total: usize = subscriptions.iter().map(Subscription::consumer_count).sum();
        info!("Started {} stage workers", total);
        Ok(Self { subscriptions })
    }

    pub fn consumer_count(&self, topic: Topic) -> usize {
        self.subscriptions
            .iter()
            .filter(|s| s.topic() == topic)
            .map(Subscription::consumer_count)
            .sum()
    }

    /// Stops every consumer after its in-flight delivery.
    pub fn shutdown(self) {
        info!("Shutting down stage workers...");
        for subscription in self.subscriptions {
            subscription.stop();
        }
        info!("All stage workers have stopped");
    }
}
