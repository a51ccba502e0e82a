//! Bounded FIFO queue between two pipeline stages. In-memory only; the
//! durable frontier covers stage-1 input, everything downstream is
//! re-derivable and may be dropped on abrupt shutdown (counted, not silent).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Result of a timed pop.
#[derive(Debug)]
pub enum PopOutcome<M> {
    Item(M),
    /// Nothing arrived within the wait; the queue is still open.
    Empty,
    /// Closed and fully drained; the consumer should stop.
    Closed,
}

/// Bounded multi-producer queue with a shared consumer side. `push` applies
/// backpressure by awaiting channel capacity. FIFO holds per producer;
/// concurrent producers interleave arbitrarily.
pub struct StageQueue<M> {
    tx: mpsc::Sender<M>,
    rx: Arc<Mutex<mpsc::Receiver<M>>>,
    closed: Arc<AtomicBool>,
    depth: Arc<AtomicUsize>,
}

impl<M> Clone for StageQueue<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            closed: Arc::clone(&self.closed),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<M: Send + 'static> StageQueue<M> {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            closed: Arc::new(AtomicBool::new(false)),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueue a message, awaiting capacity. Returns false once the queue
    /// is closed; the message is dropped and the caller should count it.
    pub async fn push(&self, msg: M) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.send(msg).await {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// Wait up to `wait` for a message, then report Empty so the caller can
    /// recheck its shutdown signal.
    pub async fn pop_timeout(&self, wait: Duration) -> PopOutcome<M> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(msg)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                PopOutcome::Item(msg)
            }
            Ok(None) => PopOutcome::Closed,
            Err(_) => {
                if self.closed.load(Ordering::Acquire) {
                    // Closed while we waited; hand out any remaining item.
                    match rx.try_recv() {
                        Ok(msg) => {
                            self.depth.fetch_sub(1, Ordering::Relaxed);
                            PopOutcome::Item(msg)
                        }
                        Err(_) => PopOutcome::Closed,
                    }
                } else {
                    PopOutcome::Empty
                }
            }
        }
    }

    /// Stop accepting pushes. Messages already queued remain poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Approximate number of queued messages, for drain monitoring.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard and count whatever is left; used for the drain report after
    /// the grace period expires.
    pub async fn drain_remaining(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            dropped += 1;
        }
        dropped
    }
}
