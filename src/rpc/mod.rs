//! RPC Module
//!
//! The node's remote surface: administrators and peers POST JSON calls to a
//! single endpoint and always receive an envelope.
//!
//! ## Request Lifecycle
//! 1. **Decode**: the body becomes an `RpcRequest` (method name plus loose params).
//! 2. **Parse**: `RpcCall::parse` checks presence, then shape, producing a closed enum.
//! 3. **Authorize**: key-carrying methods go through the `Authorizer`.
//! 4. **Execute**: the matching handler runs against the `NodeStore`.
//!
//! ## Submodules
//! - **`protocol`**: request/response types and parameter validation.
//! - **`service`**: per-method handlers and the per-call `CallContext`.
//! - **`auth`**: the `Authorizer` seam and the shared-secret implementation.
//! - **`handlers`**: axum wiring for the `/RPC2` endpoint.
//! - **`client`**: outbound `ping`/`register` used by the membership scheduler.

pub mod auth;
pub mod client;
pub mod handlers;
pub mod protocol;
pub mod service;

pub use auth::{Authorizer, SharedSecret};
pub use client::{HttpPeerClient, PeerTransport};
pub use protocol::{Envelope, RpcCall, RpcMethod, RpcRequest};
pub use service::{CallContext, RpcService};
