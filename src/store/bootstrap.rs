//! First-boot self descriptor.
//!
//! Host fact collection is an outside concern; the store only needs something
//! that can produce the initial `self` entry when the document is missing.

use serde_json::{Map, Value, json};

use super::types::{DEFAULT_KIND, Dossier, MembershipStatus, new_dossier_id};

/// Produces the node's own descriptor on first run.
pub trait HostFacts: Send + Sync {
    fn self_descriptor(&self) -> Dossier;
}

/// Reads what it can from the local machine.
pub struct LocalHostFacts {
    host: String,
    port: u16,
}

impl LocalHostFacts {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn hostname() -> Option<String> {
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok())
    }

    fn memory() -> Option<Value> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(json!({ "total_physical_memory": kb * 1024 }))
    }

    fn cpu() -> Value {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        json!({ "count": cores, "arch": std::env::consts::ARCH })
    }
}

impl HostFacts for LocalHostFacts {
    fn self_descriptor(&self) -> Dossier {
        Dossier {
            id: new_dossier_id(),
            host: self.host.clone(),
            port: self.port,
            kind: DEFAULT_KIND.to_string(),
            status: MembershipStatus::Active,
            route: String::new(),
            hostname: Self::hostname(),
            memory: Self::memory(),
            cpu: Some(Self::cpu()),
            services: Some(Vec::new()),
            extra: Map::new(),
        }
    }
}

/// Fixed descriptor, for tests and for embedding.
pub struct StaticHostFacts(pub Dossier);

impl HostFacts for StaticHostFacts {
    fn self_descriptor(&self) -> Dossier {
        self.0.clone()
    }
}
