//! Bounded background processing for accepted webhook deliveries.
//!
//! The webhook handler hands each decoded event to [`WorkerPool::submit`] and
//! replies straight away. A fixed number of workers pull deliveries off a
//! bounded queue and run them through the [`ApprovalProcessor`]. On shutdown
//! the queue stops accepting work and the workers finish whatever is already
//! queued before exiting.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::payload::NoteEvent;
use crate::processor::ApprovalProcessor;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("delivery queue is full")]
    QueueFull,

    #[error("delivery queue is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    /// `X-Gitlab-Event-UUID` when GitLab sent one, otherwise generated.
    pub id: String,
    pub event: NoteEvent,
}

pub struct WorkerPool {
    sender: RwLock<Option<mpsc::Sender<Delivery>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `workers` workers sharing a queue of `capacity` deliveries.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(processor: Arc<ApprovalProcessor>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers)
            .map(|worker| {
                let processor = processor.clone();
                let receiver = receiver.clone();
                tokio::spawn(worker_loop(worker, processor, receiver))
            })
            .collect();

        info!(workers, capacity, "Started approval workers");

        Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            workers: Mutex::new(handles),
        }
    }

    /// Queue a delivery without waiting for it to be processed.
    pub fn submit(&self, delivery: Delivery) -> Result<(), DispatchError> {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(DispatchError::Closed);
        };

        sender.try_send(delivery).map_err(|e| match e {
            TrySendError::Full(delivery) => {
                warn!(delivery = %delivery.id, "Delivery queue full, dropping event");
                DispatchError::QueueFull
            }
            TrySendError::Closed(_) => DispatchError::Closed,
        })
    }

    /// Number of deliveries waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    /// Stop accepting deliveries and wait for the queue to drain.
    pub async fn shutdown(&self) {
        // Dropping the only sender lets `recv` return `None` once the queue
        // is empty.
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        info!("Draining {} approval workers", handles.len());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Approval worker terminated abnormally: {}", e);
            }
        }

        let unprocessed = self.receiver.lock().await.len();
        if unprocessed > 0 {
            warn!("{} deliveries were left unprocessed", unprocessed);
        }
    }
}

async fn worker_loop(
    worker: usize,
    processor: Arc<ApprovalProcessor>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery>>>,
) {
    loop {
        // The lock is only held while waiting, not while processing.
        let next = receiver.lock().await.recv().await;
        let Some(delivery) = next else {
            debug!(worker, "Delivery queue closed, worker exiting");
            return;
        };

        let span = info_span!("delivery", id = %delivery.id, worker);
        let outcome = processor.process(&delivery.event).instrument(span).await;
        debug!(worker, delivery = %delivery.id, ?outcome, "Processed delivery");
    }
}
