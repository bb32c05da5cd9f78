//! Deadline tracking for sessions.
//!
//! One task owns a min-heap of deadlines. It sleeps until the earliest one
//! and is woken early when a shorter deadline is registered. Cancelled
//! listeners leave stale heap entries that are skipped when popped.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// What a deadline guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Waiting for a handshake to complete.
    Handshake,
    /// A bounded request.
    Request,
    /// A streaming session. Never times out.
    Persistent,
}

#[derive(Debug, Default)]
struct CheckerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    listeners: HashMap<u64, oneshot::Sender<()>>,
    next_id: u64,
    sleeping_until: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<CheckerState>,
    notify: Notify,
}

/// Signals registered listeners when their deadline passes.
///
/// Must be created inside a tokio runtime. Dropping the checker stops its
/// task; outstanding handles then never fire.
#[derive(Debug)]
pub struct TimeoutChecker {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

/// A registered deadline. Dropping it cancels the registration.
#[derive(Debug)]
pub struct TimeoutHandle {
    id: Option<u64>,
    rx: Option<oneshot::Receiver<()>>,
    shared: Arc<Shared>,
}

impl TimeoutChecker {
    /// Starts the checker task.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(run(Arc::clone(&shared)));
        Self { shared, task }
    }

    /// Registers a listener expiring at `deadline`.
    ///
    /// [`OperationKind::Persistent`] registrations are accepted but never
    /// expire.
    pub fn register(&self, deadline: Instant, kind: OperationKind) -> TimeoutHandle {
        if kind == OperationKind::Persistent {
            return TimeoutHandle {
                id: None,
                rx: None,
                shared: Arc::clone(&self.shared),
            };
        }

        let (tx, rx) = oneshot::channel();
        let (id, wake) = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.heap.push(Reverse((deadline, id)));
            state.listeners.insert(id, tx);
            trace!(id, ?kind, "registered timeout");
            (id, state.sleeping_until.map_or(true, |until| deadline < until))
        };
        if wake {
            self.shared.notify.notify_one();
        }
        TimeoutHandle {
            id: Some(id),
            rx: Some(rx),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of listeners still waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }
}

impl Default for TimeoutChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimeoutChecker {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.notify.notify_one();
        self.task.abort();
    }
}

impl TimeoutHandle {
    /// Resolves once, when the deadline passes. Never resolves for
    /// persistent operations or after the checker stopped.
    pub async fn expired(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            let fired = rx.await.is_ok();
            self.rx = None;
            if fired {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    /// Cancels the registration.
    pub fn cancel(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(id) = self.id.take() {
            self.shared.state.lock().listeners.remove(&id);
        }
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.state.lock();
            if state.shutdown {
                state.listeners.clear();
                return;
            }
            let now = Instant::now();
            while let Some(Reverse((deadline, id))) = state.heap.peek().copied() {
                if !state.listeners.contains_key(&id) {
                    state.heap.pop();
                    continue;
                }
                if deadline > now {
                    break;
                }
                state.heap.pop();
                if let Some(tx) = state.listeners.remove(&id) {
                    trace!(id, "timeout expired");
                    let _ = tx.send(());
                }
            }
            let next = state.heap.peek().map(|Reverse((deadline, _))| *deadline);
            state.sleeping_until = next;
            next
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {}
                    () = shared.notify.notified() => {}
                }
            }
            None => shared.notify.notified().await,
        }
    }
}
