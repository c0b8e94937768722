//! In-process bus: one unbounded crossbeam channel per topic, consumer
//! threads, and a delay list for nacked deliveries.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use super::{Ack, Delivery, DeliveryHandler, MessageBus, Subscription, Topic};
use crate::error::BusError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Lane {
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
    delayed: Mutex<Vec<(Instant, Delivery)>>,
}

impl Lane {
    fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            delayed: Mutex::new(Vec::new()),
        }
    }

    /// Moves due delayed deliveries back onto the channel.
    fn promote_due(&self) {
        let now = Instant::now();
        let mut delayed = self.delayed.lock().unwrap_or_else(PoisonError::into_inner);
        let mut i = 0;
        while i < delayed.len() {
            if delayed[i].0 <= now {
                let (_, delivery) = delayed.swap_remove(i);
                // The lane owns its receiver, so the channel cannot be disconnected.
                let _ = self.sender.send(delivery);
            } else {
                i += 1;
            }
        }
    }

    fn schedule(&self, delivery: Delivery, delay: Duration) {
        if delay.is_zero() {
            let _ = self.sender.send(delivery);
        } else {
            self.delayed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((Instant::now() + delay, delivery));
        }
    }
}

struct Shared {
    lanes: [Lane; 3],
    /// Published messages not yet acknowledged (queued, delayed or in flight).
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

/// In-memory [`MessageBus`] with at-least-once delivery and delayed
/// redelivery on nack. Cloning shares the same queues.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                lanes: [Lane::new(), Lane::new(), Lane::new()],
                outstanding: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of published messages not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Blocks until every published message was acknowledged or `timeout`
    /// elapses. Returns whether the bus went idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.outstanding() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Rejects further publishes. Running consumers keep draining.
    pub fn shutdown(&self) {
        info!("Shutting down message bus");
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

impl MessageBus for MemoryBus {
    fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), BusError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let delivery = Delivery {
            topic,
            message_id: uuid::Uuid::new_v4().to_string(),
            payload,
            attempt: 1,
        };
        debug!("Publishing {} on {}", delivery.message_id, topic);
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.shared.lanes[topic.index()].sender.send(delivery).is_err() {
            self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(BusError::Closed);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        topic: Topic,
        concurrency: usize,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, BusError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(concurrency.max(1));

        for consumer_id in 0..concurrency.max(1) {
            let shared = Arc::clone(&self.shared);
            let handler = Arc::clone(&handler);
            let shutdown_flag = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", topic.as_str(), consumer_id))
                .spawn(move || run_consumer(consumer_id, topic, shared, handler, shutdown_flag))
                .map_err(|e| BusError::SpawnFailed(e.to_string()));
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => {
                    // Stop whatever already started before reporting.
                    drop(Subscription::new(topic, shutdown, handles));
                    return Err(e);
                }
            }
        }

        info!("Started {} consumers on {}", handles.len(), topic);
        Ok(Subscription::new(topic, shutdown, handles))
    }
}

fn run_consumer(
    consumer_id: usize,
    topic: Topic,
    shared: Arc<Shared>,
    handler: Arc<dyn DeliveryHandler>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Consumer {} on {} started", consumer_id, topic);
    let lane = &shared.lanes[topic.index()];

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Consumer {} on {} received shutdown signal", consumer_id, topic);
            break;
        }

        lane.promote_due();

        match lane.receiver.recv_timeout(POLL_INTERVAL) {
            Ok(delivery) => match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&delivery))) {
                Ok(Ack::Ack) => {
                    shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(Ack::Nack { delay }) => {
                    warn!(
                        "Delivery {} on {} nacked (attempt {}), redelivering in {:?}",
                        delivery.message_id, topic, delivery.attempt, delay
                    );
                    let mut next = delivery;
                    next.attempt += 1;
                    lane.schedule(next, delay);
                }
                // The delivery is dropped; its stage stays `in_progress`
                // until it shows up as stalled.
                Err(_) => {
                    error!(
                        "Handler panicked on delivery {} on {} (attempt {}), dropping it",
                        delivery.message_id, topic, delivery.attempt
                    );
                    shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                }
            },
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Consumer {} on {} channel disconnected", consumer_id, topic);
                break;
            }
        }
    }

    debug!("Consumer {} on {} stopped", consumer_id, topic);
}
