//! Single-flight request slot.
//!
//! At most one request of a kind may be outstanding on a connection. The
//! owner arms the slot with its request id before sending, the receive loop
//! completes it when a reply with that id arrives, and dropping the owner's
//! guard hands the slot to the next queued caller in FIFO order.
//!
//! ```text
//! caller A ── acquire ─► owner ── arm ─► send ── wait ◄── complete (recv loop)
//! caller B ── acquire ─► queued ─────────────────────────► owner on A's drop
//! ```

use std::collections::VecDeque;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};

/// Await `fut` until `deadline`, or until `cancel` fires. `None` waits
/// without a deadline.
pub(crate) async fn wait_with<F, R>(
    fut: F,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    what: &str,
) -> Result<R>
where
    F: Future<Output = R>,
{
    match deadline {
        Some(deadline) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            r = tokio::time::timeout_at(deadline, fut) => {
                r.map_err(|_| TransportError::Timeout(format!("{} timed out", what)))
            }
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            r = fut => Ok(r),
        },
    }
}

struct SlotState<T> {
    busy: bool,
    closed: bool,
    queue: VecDeque<oneshot::Sender<Result<()>>>,
    pending: Option<(u32, oneshot::Sender<Result<T>>)>,
}

/// Reusable single-owner + FIFO request slot.
pub struct SingleFlight<T> {
    name: &'static str,
    state: Mutex<SlotState<T>>,
}

impl<T> SingleFlight<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(SlotState {
                busy: false,
                closed: false,
                queue: VecDeque::new(),
                pending: None,
            }),
        }
    }

    /// Become the owner, queueing behind earlier callers.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<SlotGuard<'_, T>> {
        let mut rx = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::ConnectionClosed);
            }
            if !state.busy {
                state.busy = true;
                return Ok(SlotGuard { slot: self });
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };

        match wait_with(&mut rx, cancel, Some(deadline), self.name).await {
            Ok(Ok(Ok(()))) => Ok(SlotGuard { slot: self }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(e) => {
                // The slot may have been handed over between the timeout and now.
                rx.close();
                if let Ok(Ok(())) = rx.try_recv() {
                    drop(SlotGuard { slot: self });
                }
                Err(e)
            }
        }
    }

    /// Deliver the reply to request `key`. Returns false if the owner is not
    /// waiting for that key (late or unsolicited reply).
    pub fn complete(&self, key: u32, value: T) -> bool {
        let pending = {
            let mut state = self.state.lock();
            match &state.pending {
                Some((armed, _)) if *armed == key => state.pending.take(),
                _ => None,
            }
        };
        match pending {
            Some((_, tx)) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Fail the owner and every queued caller; later acquires fail immediately.
    pub fn close(&self) {
        let (pending, queue) = {
            let mut state = self.state.lock();
            state.closed = true;
            (state.pending.take(), std::mem::take(&mut state.queue))
        };
        if let Some((_, tx)) = pending {
            let _ = tx.send(Err(TransportError::ConnectionClosed));
        }
        for tx in queue {
            let _ = tx.send(Err(TransportError::ConnectionClosed));
        }
    }

    /// Whether an owner currently holds the slot.
    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        while let Some(next) = state.queue.pop_front() {
            if next.send(Ok(())).is_ok() {
                return;
            }
        }
        state.busy = false;
    }
}

/// Ownership of a [`SingleFlight`] slot. Dropping it hands the slot on.
pub struct SlotGuard<'a, T> {
    slot: &'a SingleFlight<T>,
}

impl<'a, T> SlotGuard<'a, T> {
    /// Register for the reply to request `key`. Call before sending.
    pub fn arm(&self, key: u32) -> Result<ReplyWaiter<T>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.slot.state.lock();
        if state.closed {
            return Err(TransportError::ConnectionClosed);
        }
        state.pending = Some((key, tx));
        Ok(ReplyWaiter {
            rx,
            name: self.slot.name,
        })
    }
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Pending reply of an armed slot.
pub struct ReplyWaiter<T> {
    rx: oneshot::Receiver<Result<T>>,
    name: &'static str,
}

impl<T> ReplyWaiter<T> {
    pub async fn wait(self, cancel: &CancellationToken, deadline: Instant) -> Result<T> {
        match wait_with(self.rx, cancel, Some(deadline), self.name).await? {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }
}
