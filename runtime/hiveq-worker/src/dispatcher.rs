use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::error::DispatchError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-width worker pool fed by a bounded FIFO. Submissions beyond the
/// backlog capacity are rejected rather than queued.
pub struct Dispatcher {
    sender: Option<Sender<Job>>,
    receiver: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(threads: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded::<Job>(capacity);
        let workers = (0..threads.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("hiveq-worker-{index}"))
                    .spawn(move || worker_loop(receiver))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::error!(error = %err, "failed to spawn worker thread");
                    None
                }
            })
            .collect();
        Self {
            sender: Some(sender),
            receiver,
            workers,
            capacity,
        }
    }

    pub fn submit<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(DispatchError::Closed)?;
        match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Closed),
        }
    }

    /// Jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the sender lets workers drain the backlog and exit.
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

/// Runs jobs until the queue closes. A panicking job is logged and the
/// worker moves on to the next one, so the pool keeps its width.
fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(panic = panic_message(payload.as_ref()), "job panicked");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
