//! Stage transition broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pipeline::model::{JobStatus, StageKey, StageKind, StageStatus};

/// What changed: a single stage, or the job as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum StageEventKind {
    Stage {
        stage: StageKind,
        status: StageStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        page_number: Option<u32>,
    },
    Job { status: JobStatus },
}

/// A state change observed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEvent {
    pub job_id: String,
    #[serde(flatten)]
    pub kind: StageEventKind,
    /// Human-readable description of the transition.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StageEvent {
    pub fn stage(key: &StageKey, status: StageStatus, message: &str) -> Self {
        Self {
            job_id: key.job_id.clone(),
            kind: StageEventKind::Stage {
                stage: key.stage,
                status,
                page_number: key.page,
            },
            message: message.to_string(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn job(job_id: &str, status: JobStatus, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind: StageEventKind::Job { status },
            message: message.to_string(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Broadcasts stage events to any number of subscribers.
#[derive(Clone)]
pub struct StageEventBroadcaster {
    sender: Arc<broadcast::Sender<StageEvent>>,
}

impl StageEventBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: StageEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }
}

impl Default for StageEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
