//! Send-turn queue.
//!
//! One caller at a time owns the write turn. Later callers queue FIFO and
//! are handed the turn by the previous owner. Queued heartbeat pings and
//! wire packets for the same route are elided:
//!
//! - a second `ConnectionTest` behind a queued one is dropped
//! - a newer `WirePacket` for the same service path and member replaces the
//!   queued one; the superseded caller completes without transmitting

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::error::{Result, TransportError};
use crate::protocol::{Message, MessageEntryType};

/// What the turn is used for.
#[derive(Debug)]
pub(crate) enum TurnUse {
    Write(Message),
    /// Exclusive use of the stream without a message (secure upgrade).
    Pause,
}

/// Signal sent to a queued caller.
#[derive(Debug)]
pub(crate) enum Handoff {
    /// The caller now owns the turn.
    Turn(TurnUse),
    /// The caller's message was superseded; nothing to do.
    Done,
}

pub(crate) enum Enqueued {
    /// Turn was free; the caller owns it now.
    Run(TurnUse),
    Wait(oneshot::Receiver<Result<Handoff>>),
    /// Dropped as a duplicate ping.
    Elided,
}

struct Waiter {
    item: TurnUse,
    tx: oneshot::Sender<Result<Handoff>>,
}

#[derive(Default)]
pub(crate) struct SendQueue {
    active: bool,
    waiters: VecDeque<Waiter>,
}

enum Elision {
    DropNew,
    Replace(usize),
}

fn single_entry_of(message: &Message, kind: MessageEntryType) -> bool {
    message
        .single_entry()
        .map(|e| e.entry_type == kind)
        .unwrap_or(false)
}

impl SendQueue {
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    fn find_elision(&self, message: &Message) -> Option<Elision> {
        let ping = single_entry_of(message, MessageEntryType::CONNECTION_TEST);
        let wire = single_entry_of(message, MessageEntryType::WIRE_PACKET);
        if !ping && !wire {
            return None;
        }
        for (i, waiter) in self.waiters.iter().enumerate() {
            let queued = match &waiter.item {
                TurnUse::Write(m) => m,
                TurnUse::Pause => continue,
            };
            if !queued.header.same_route(&message.header) {
                continue;
            }
            if ping && single_entry_of(queued, MessageEntryType::CONNECTION_TEST) {
                return Some(Elision::DropNew);
            }
            if wire && single_entry_of(queued, MessageEntryType::WIRE_PACKET) {
                let (a, b) = match (queued.single_entry(), message.single_entry()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => continue,
                };
                if a.service_path == b.service_path && a.member_name == b.member_name {
                    return Some(Elision::Replace(i));
                }
            }
        }
        None
    }

    /// Claim the turn or queue behind the current owner.
    pub(crate) fn push(&mut self, item: TurnUse) -> Enqueued {
        if !self.active {
            self.active = true;
            return Enqueued::Run(item);
        }
        if let TurnUse::Write(message) = &item {
            match self.find_elision(message) {
                Some(Elision::DropNew) => return Enqueued::Elided,
                Some(Elision::Replace(i)) => {
                    let (tx, rx) = oneshot::channel();
                    let waiter = &mut self.waiters[i];
                    let old = std::mem::replace(waiter, Waiter { item, tx });
                    let _ = old.tx.send(Ok(Handoff::Done));
                    return Enqueued::Wait(rx);
                }
                None => {}
            }
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { item, tx });
        Enqueued::Wait(rx)
    }

    /// Hand the turn to the next live waiter, or go idle.
    pub(crate) fn release(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.tx.send(Ok(Handoff::Turn(waiter.item))).is_ok() {
                return;
            }
        }
        self.active = false;
    }

    /// Fail every waiter. Returns how many were failed.
    pub(crate) fn close(&mut self) -> usize {
        let waiters = std::mem::take(&mut self.waiters);
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(TransportError::ConnectionClosed));
        }
        count
    }
}
