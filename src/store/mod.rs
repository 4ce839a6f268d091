//! Node Store Module
//!
//! Persists the node document: the node's own descriptor (`self`), the known
//! peers (`nodes`) and a reserved `cluster` section.
//!
//! ## Core Concepts
//! - **Whole-document writes**: each mutation is a load-modify-write of the full JSON
//!   document, serialized through one store-wide lock and committed with an atomic rename.
//! - **Bootstrap**: a missing document is created from `HostFacts` through the same locked path.
//! - **Projection**: reads can return full records, the partial field subset, or an explicit field list.

pub mod bootstrap;
pub mod store;
pub mod types;

pub use bootstrap::{HostFacts, LocalHostFacts, StaticHostFacts};
pub use store::NodeStore;
pub use types::{
    Dossier, FormatSpec, Group, MembershipStatus, NodeStoreDocument, StatusWrite,
};
