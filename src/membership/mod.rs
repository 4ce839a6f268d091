//! Membership Module
//!
//! Keeps the view of peers in the node store current by contacting them on a
//! fixed tick.
//!
//! ## Core Mechanisms
//! - **Handshake**: a peer in `unknown`/`registration` receives REG carrying this
//!   node's self descriptor; the ACK payload replaces the local entry for it.
//! - **Heartbeat**: `active`, `down` and `connection_refused` peers are pinged;
//!   the failure class decides between `down` and `connection_refused`.
//! - **Backoff**: a failed peer is not contacted again before its "not before" instant.
//! - **Early wake-up**: RPC handlers publish `StatusCheck` events; a burst of them
//!   collapses into a single extra tick.

pub mod events;
pub mod scheduler;
pub mod types;

pub use events::{
    EVENT_QUEUE_CAPACITY, EventPublisher, EventReceiver, MembershipEvent, event_queue,
};
pub use scheduler::MembershipScheduler;
pub use types::{PeerAction, PeerOutcome, SchedulerSettings, TickReport};

#[cfg(test)]
mod tests;
