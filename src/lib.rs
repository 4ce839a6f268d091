//! Cluster Membership Node Library
//!
//! Every node keeps a persisted dossier of itself and of its peers, answers
//! remote calls against it, and keeps peer statuses current by registering
//! with and pinging the peers it knows. The loop is symmetric: every node runs
//! all components.
//!
//! ## Architecture Modules
//! - **`store`**: the persisted node document (`self`, `nodes`, `cluster`) behind a
//!   single-writer lock.
//! - **`rpc`**: the `/RPC2` surface (`ping`, `register`, `getDossier`, `addDossier`,
//!   `updateDossier`, `deleteDossier`) and the outbound peer client.
//! - **`membership`**: the tick-driven scheduler running the REG/ACK handshake and
//!   heartbeats, plus the event queue RPC handlers use to wake it.
//! - **`config`**: layered settings (defaults, file, `TRINITY_*` env, CLI flags).
//! - **`node`**: wiring of the above into one running node.

pub mod config;
pub mod error;
pub mod membership;
pub mod node;
pub mod rpc;
pub mod store;
