//! Event Queue
//!
//! Bounded, non-blocking hand-off from RPC handlers to the scheduler.
//! Publishing never waits: when the queue is full the event is dropped, since
//! an undelivered "something changed" is already covered by the queued ones.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

pub const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Re-evaluate peer statuses now instead of at the next tick.
    StatusCheck { event_id: String },
}

/// Sending half, cloned into every RPC handler.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<MembershipEvent>,
}

/// Receiving half, owned by the scheduler.
pub struct EventReceiver {
    rx: mpsc::Receiver<MembershipEvent>,
}

pub fn event_queue(capacity: usize) -> (EventPublisher, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventPublisher { tx }, EventReceiver { rx })
}

impl EventPublisher {
    /// Returns `false` if the event was dropped.
    pub fn publish(&self, event: MembershipEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::trace!("Event queue full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!("Event queue closed, dropping {:?}", event);
                false
            }
        }
    }
}

impl EventReceiver {
    pub fn try_consume(&mut self) -> Option<MembershipEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Waits for the next event. `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<MembershipEvent> {
        self.rx.recv().await
    }

    /// Discards everything queued; returns how many events were pending.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.try_consume().is_some() {
            drained += 1;
        }
        drained
    }
}
