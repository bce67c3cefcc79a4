//! Deferred work queue.
//!
//! Decrypt conversions run here instead of inside the completion context
//! that delivered the ciphertext: cipher work can be heavy, and for the
//! inline backend it blocks. Submission never blocks, so it is safe from
//! any completion callback.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use bvd_core::{BvdError, BvdResult};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskQueue {
    tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(name: &str, workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|n| {
                let rx = Arc::clone(&rx);
                std::thread::Builder::new()
                    .name(format!("{name}-{n}"))
                    .spawn(move || loop {
                        let task = {
                            let guard = rx.lock().expect("task queue receiver poisoned");
                            guard.recv()
                        };
                        match task {
                            Ok(task) => task(),
                            Err(_) => return,
                        }
                    })
                    .expect("spawning queue worker")
            })
            .collect();

        debug!(name, workers, "task queue started");
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }

    /// Enqueue a task. Never blocks; fails once the queue is shut down.
    pub fn submit(&self, task: Task) -> BvdResult<()> {
        let guard = self.tx.lock().expect("task queue sender poisoned");
        match guard.as_ref() {
            Some(tx) => tx.send(task).map_err(|_| BvdError::Shutdown),
            None => Err(BvdError::Shutdown),
        }
    }

    /// Stop accepting tasks, drain what was queued, and join the workers.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().expect("task queue sender poisoned").take();
        drop(tx);
        let handles: Vec<_> = self
            .workers
            .lock()
            .expect("task queue workers poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("queue worker panicked during shutdown");
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
