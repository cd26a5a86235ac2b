//! Fixed pool of single-threaded workers
//!
//! Each worker drains its own bounded mailbox in FIFO order. A series is
//! pinned to one worker by hash, so everything touching that series runs on
//! a single thread. A full mailbox refuses new work immediately instead of
//! making the caller wait.

use crate::{CadenceError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Stop,
}

/// Result of a task that has been queued on a worker
#[must_use = "dropping the handle discards the task's result"]
pub struct TaskHandle<R> {
    receiver: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the task has run.
    ///
    /// Fails with `WorkerStopped` if the task panicked or the worker exited first.
    pub fn wait(self) -> Result<R> {
        self.receiver.recv().map_err(|_| CadenceError::WorkerStopped)
    }
}

/// Cloneable submission handle for one worker
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    sender: Sender<Message>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue a task without blocking
    pub fn execute<F, R>(&self, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let id = self.id;
        let job: Task = Box::new(move || match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(result) => {
                let _ = result_tx.send(result);
            }
            Err(_) => error!("Task on worker {} panicked", id),
        });

        self.sender
            .try_send(Message::Run(job))
            .map_err(|e| match e {
                TrySendError::Full(_) => CadenceError::WorkerTooBusy { worker: id },
                TrySendError::Disconnected(_) => CadenceError::WorkerStopped,
            })?;
        Ok(TaskHandle {
            receiver: result_rx,
        })
    }

    /// Tasks waiting in the mailbox
    pub fn queued(&self) -> usize {
        self.sender.len()
    }
}

struct Worker {
    handle: WorkerHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Pool of worker threads
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Start `threads` workers, each with room for `queue_limit` pending tasks
    pub fn new(threads: usize, queue_limit: usize) -> Result<Self> {
        if threads == 0 || queue_limit == 0 {
            return Err(CadenceError::Config(
                "worker pool needs at least one thread and a non-zero queue".into(),
            ));
        }

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let (sender, receiver) = bounded(queue_limit);
            let thread = thread::Builder::new()
                .name(format!("cadence-worker-{id}"))
                .spawn(move || run_worker(id, receiver))?;
            workers.push(Worker {
                handle: WorkerHandle { id, sender },
                thread: Mutex::new(Some(thread)),
            });
        }

        info!("Started {} workers with queue limit {}", threads, queue_limit);
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Worker that owns everything with this hash
    pub fn worker_for(&self, hash: u64) -> usize {
        (hash % self.workers.len() as u64) as usize
    }

    /// Submission handle for a worker
    pub fn handle(&self, worker: usize) -> WorkerHandle {
        self.workers[worker].handle.clone()
    }

    /// Queue a task on a worker without blocking
    pub fn execute<F, R>(&self, worker: usize, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.workers[worker].handle.execute(task)
    }

    /// Tasks waiting in a worker's mailbox
    pub fn queued(&self, worker: usize) -> usize {
        self.workers[worker].handle.queued()
    }

    /// Stop every worker after it drains the tasks already queued, then join them
    pub fn shutdown(&self) {
        for worker in &self.workers {
            let _ = worker.handle.sender.send(Message::Stop);
        }
        for worker in &self.workers {
            if let Some(thread) = worker.thread.lock().take() {
                if thread.join().is_err() {
                    error!("Worker {} exited abnormally", worker.handle.id);
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(id: usize, receiver: Receiver<Message>) {
    debug!("Worker {} started", id);
    for message in receiver.iter() {
        match message {
            Message::Run(task) => task(),
            Message::Stop => break,
        }
    }
    debug!("Worker {} stopped", id);
}
