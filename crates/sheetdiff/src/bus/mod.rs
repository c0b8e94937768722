//! At-least-once message bus used to hand stage work to workers.

pub mod memory;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::pipeline::model::StageKind;

pub use memory::MemoryBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Ocr,
    Diff,
    Summary,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Ocr, Topic::Diff, Topic::Summary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocr => "stage.ocr",
            Self::Diff => "stage.diff",
            Self::Summary => "stage.summary",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Ocr => 0,
            Self::Diff => 1,
            Self::Summary => 2,
        }
    }
}

impl From<StageKind> for Topic {
    fn from(stage: StageKind) -> Self {
        match stage {
            StageKind::Ocr => Topic::Ocr,
            StageKind::Diff => Topic::Diff,
            StageKind::Summary => Topic::Summary,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery of a message. `attempt` starts at 1 and grows with every
/// redelivery of the same `message_id`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: Topic,
    pub message_id: String,
    pub payload: Vec<u8>,
    pub attempt: u32,
}

/// Handler verdict. A nack schedules redelivery after `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Nack { delay: Duration },
}

pub trait DeliveryHandler: Send + Sync {
    fn handle(&self, delivery: &Delivery) -> Ack;
}

impl<F> DeliveryHandler for F
where
    F: Fn(&Delivery) -> Ack + Send + Sync,
{
    fn handle(&self, delivery: &Delivery) -> Ack {
        self(delivery)
    }
}

pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BusError>;

    /// Starts `concurrency` consumers on `topic`. Each holds at most one
    /// unacknowledged delivery. Consumers run until the returned
    /// subscription is stopped or dropped.
    fn subscribe(
        &self,
        topic: Topic,
        concurrency: usize,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, BusError>;
}

/// Handle to running consumers.
pub struct Subscription {
    topic: Topic,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(topic: Topic, shutdown: Arc<AtomicBool>, handles: Vec<JoinHandle<()>>) -> Self {
        Self {
            topic,
            shutdown,
            handles,
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn consumer_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals the consumers and waits for in-flight deliveries to finish.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (i, handle) in self.handles.drain(..).enumerate() {
            if let Err(e) = handle.join() {
                error!("Consumer {} on {} panicked: {:?}", i, self.topic, e);
            } else {
                debug!("Consumer {} on {} finished", i, self.topic);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
