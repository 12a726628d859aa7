use std::thread::JoinHandle;
use std::time::Duration;

use crate::TerminateFlag;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single worker thread fed by a bounded queue.
///
/// `try_submit` never blocks: when the queue is full the job is refused and
/// the caller decides what to drop. This is the backpressure primitive used
/// by every pipeline stage.
pub struct WorkerQueue {
    tx: Option<crossbeam_channel::Sender<Job>>,
    terminated: TerminateFlag,
    handle: Option<JoinHandle<()>>,
}

impl WorkerQueue {
    pub fn new(name: &str, depth: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(depth);
        let terminated = TerminateFlag::new();
        let flag = terminated.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(job) => job(),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if flag.is_set() {
                            return;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("spawn worker thread");
        Self {
            tx: Some(tx),
            terminated,
            handle: Some(handle),
        }
    }

    /// Returns false if the queue is full and the job was refused.
    pub fn try_submit<F: FnOnce() + Send + 'static>(&self, job: F) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    pub fn shutdown(&mut self) {
        self.terminated.set();
        // Dropping the sender wakes the worker immediately.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_submitted_jobs() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut q = WorkerQueue::new("test", 4);
        for _ in 0..4 {
            let count = count.clone();
            assert!(q.try_submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        q.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn refuses_when_full() {
        let q = WorkerQueue::new("test", 1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        // Occupy the worker so the queue can actually fill.
        q.try_submit(move || {
            let _ = gate_rx.recv();
        });
        // One slot in the queue, then refusal.
        let mut accepted = 0;
        for _ in 0..3 {
            if q.try_submit(|| {}) {
                accepted += 1;
            }
        }
        let _ = gate_tx.send(());
        assert!(accepted < 3);
    }
}
