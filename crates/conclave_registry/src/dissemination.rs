//! Per-pool dissemination worker.
//!
//! Pool operations mark members as "needs a push" by enqueueing them; a
//! single long-lived task per pool drains the queue and performs the
//! (possibly slow) network push outside the pool lock.

use async_trait::async_trait;
use conclave_core::MemberId;
use indexmap::IndexSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Something that can bring a member up to date
#[async_trait]
pub trait Disseminate: Send + Sync + 'static {
    /// Push pending events to `member`
    async fn push_to(&self, member: MemberId);
}

/// De-duplicating, insertion-ordered queue of members awaiting a push
///
/// `enqueue` never blocks beyond a short critical section, so it is safe to
/// call while holding the pool lock.
#[derive(Debug, Default)]
pub struct DisseminationQueue {
    pending: Mutex<IndexSet<MemberId>>,
    notify: Notify,
    closed: AtomicBool,
}

impl DisseminationQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `member`; returns `false` if it was already queued or the
    /// queue is closed
    pub fn enqueue(&self, member: MemberId) -> bool {
        if self.is_closed() {
            return false;
        }
        let inserted = match self.pending.lock() {
            Ok(mut pending) => pending.insert(member),
            Err(poisoned) => poisoned.into_inner().insert(member),
        };
        if inserted {
            self.notify.notify_one();
        }
        inserted
    }

    /// Stop accepting members; already queued members are still handed out
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of queued members
    #[must_use]
    pub fn len(&self) -> usize {
        match self.pending.lock() {
            Ok(pending) => pending.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<MemberId> {
        match self.pending.lock() {
            Ok(mut pending) => pending.shift_remove_index(0),
            Err(poisoned) => poisoned.into_inner().shift_remove_index(0),
        }
    }

    /// Wait for the next member
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<MemberId> {
        loop {
            let notified = self.notify.notified();
            if let Some(member) = self.pop() {
                return Some(member);
            }
            if self.is_closed() {
                // Let a concurrent waiter observe the close as well
                self.notify.notify_one();
                return None;
            }
            notified.await;
        }
    }
}

/// Handle to a running dissemination task
#[derive(Debug)]
pub struct DisseminationWorker {
    handle: JoinHandle<()>,
}

impl DisseminationWorker {
    /// Spawn the consumer loop
    ///
    /// The loop exits when the queue is closed and drained, when `shutdown`
    /// is cancelled, or when the target has been dropped. A push already in
    /// progress is always allowed to finish.
    pub fn spawn<T: Disseminate>(
        name: String,
        queue: Arc<DisseminationQueue>,
        target: Weak<T>,
        shutdown: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            debug!(pool = %name, "dissemination worker started");
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    next = queue.next() => next,
                };
                let Some(member) = next else {
                    break;
                };
                let Some(target) = target.upgrade() else {
                    break;
                };
                target.push_to(member).await;
            }
            debug!(pool = %name, "dissemination worker stopped");
        });
        Self { handle }
    }

    /// Whether the task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to exit
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            debug!(error = %err, "dissemination worker aborted");
        }
    }
}
