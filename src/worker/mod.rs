//! Background workers.
//!
//! Every suspension point of the raft worker (snapshot I/O, data scans,
//! placement-driver RPCs) runs as a task on a named worker thread. Tasks
//! arrive over a channel; results travel back over typed channels drained
//! at well-defined points of the store loop, never as callbacks.

pub mod pd;
pub mod snap;
pub mod split;

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

/// A named worker thread fed by an unbounded channel.
///
/// The thread exits when every scheduler handle has been dropped. Cloned
/// schedulers keep it alive past [`stop`](Worker::stop), so the owner is
/// expected to drop them alongside the worker.
pub struct Worker<T> {
    name: String,
    tx: Option<Sender<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn the worker thread running `f` for every received task.
    pub fn spawn<F>(name: impl Into<String>, mut f: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = unbounded::<T>();
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for task in rx.iter() {
                    f(task);
                }
                debug!(target: "raftstore", worker = %thread_name, "worker stopped");
            })
            .expect("failed to spawn worker thread");
        Self {
            name,
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// A handle tasks can be scheduled through.
    pub fn scheduler(&self) -> Sender<T> {
        self.tx.as_ref().expect("worker already stopped").clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drop this worker's scheduler and wait for the thread to drain.
    pub fn stop(mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn worker_processes_all_scheduled_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let worker = Worker::spawn("test-worker", move |n: usize| {
            seen.fetch_add(n, Ordering::SeqCst);
        });
        let sched = worker.scheduler();
        for n in 1..=4 {
            sched.send(n).unwrap();
        }
        drop(sched);
        worker.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
