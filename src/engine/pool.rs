//! Bounded queue of raw payloads feeding a fixed set of worker threads.
//!
//! `submit` never blocks: when the queue is full the payload is dropped and
//! counted. Shutdown closes the queue and lets the workers drain it.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::errors::{FreError, Result};
use crate::engine::worker::Worker;

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub queued: usize,
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Shareable across threads; every method takes `&self`.
pub struct WorkerPool {
    tx: Mutex<Option<Sender<String>>>,
    joins: Mutex<Vec<thread::JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Start `workers` threads sharing one queue of `capacity` payloads.
    pub fn spawn(worker: Arc<Worker>, workers: usize, capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<String>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let mut joins = Vec::with_capacity(workers.max(1));
        for index in 0..workers.max(1) {
            let rx = rx.clone();
            let worker = Arc::clone(&worker);
            let counters = Arc::clone(&counters);
            let join = thread::Builder::new()
                .name(format!("fre-worker-{index}"))
                .spawn(move || worker_thread_main(&worker, &rx, &counters))
                .map_err(|e| FreError::Runtime {
                    details: format!("failed to spawn worker thread: {e}"),
                })?;
            joins.push(join);
        }
        tracing::info!(workers = joins.len(), capacity, "worker pool started");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            joins: Mutex::new(joins),
            counters,
        })
    }

    /// Queue a payload without blocking. Returns `false` when it was dropped.
    pub fn submit(&self, payload: String) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        match tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "worker queue full, payload dropped");
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queue a payload, waiting for room.
    pub fn submit_blocking(&self, payload: String) -> Result<()> {
        let tx = self.sender().ok_or(FreError::ChannelClosed {
            component: "worker pool",
        })?;
        tx.send(payload).map_err(|_| FreError::ChannelClosed {
            component: "worker pool",
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queued: self.sender().map_or(0, |tx| tx.len()),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the queue, wait for workers to drain it, return final counters.
    /// Later submissions are refused.
    pub fn shutdown(&self) -> PoolStats {
        self.close();
        self.stats()
    }

    fn sender(&self) -> Option<Sender<String>> {
        self.tx.lock().clone()
    }

    fn close(&self) {
        drop(self.tx.lock().take());
        let joins: Vec<_> = self.joins.lock().drain(..).collect();
        for join in joins {
            if join.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_thread_main(worker: &Worker, rx: &Receiver<String>, counters: &Counters) {
    while let Ok(payload) = rx.recv() {
        match worker.process(&payload) {
            Ok(report) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(packets = report.packets, rules = report.rules_run, "payload processed");
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::capabilities::test_support::registry_with_store;
    use crate::engine::context::ContextBuilder;
    use crate::engine::packet::JsonTrackerAdapter;
    use crate::engine::rules::RuleSetHandle;
    use crate::store::MemoryStore;

    fn worker() -> Arc<Worker> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(Worker::new(
            ContextBuilder::new(Arc::new(registry_with_store(&store))),
            Arc::new(JsonTrackerAdapter),
            Arc::new(RuleSetHandle::default()),
        ))
    }

    fn payload(imei: usize) -> String {
        json!({
            "IMEI": imei.to_string(),
            "ListPackets": {"0": {"Speed": 1, "Datetime": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()}}
        })
        .to_string()
    }

    #[test]
    fn shutdown_drains_queue() {
        let pool = WorkerPool::spawn(worker(), 3, 64).unwrap();
        for i in 0..40 {
            pool.submit_blocking(payload(i)).unwrap();
        }
        pool.submit_blocking("garbage".to_string()).unwrap();
        let stats = pool.shutdown();
        assert_eq!(stats.processed, 40);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dropped, 0);
        assert!(!pool.submit(payload(99)));
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (tx, rx) = bounded::<String>(1);
        let pool = WorkerPool {
            tx: Mutex::new(Some(tx)),
            joins: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        };
        assert!(pool.submit("a".to_string()));
        assert!(!pool.submit("b".to_string()));
        assert!(!pool.submit("c".to_string()));
        assert_eq!(pool.stats().dropped, 2);
        assert_eq!(pool.stats().queued, 1);
        drop(rx);
    }
}
