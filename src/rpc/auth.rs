//! Caller authorization for the administrative methods.
//!
//! The deployed trust model is a single shared secret compared in clear text.
//! Handlers only talk to the [`Authorizer`] trait, so a stronger scheme can be
//! dropped in without touching them.

/// Decides whether a caller-supplied key is allowed.
pub trait Authorizer: Send + Sync {
    fn verify(&self, key: &str, event_id: &str) -> bool;
}

/// Plain equality against the configured key.
pub struct SharedSecret {
    key: String,
}

impl SharedSecret {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Authorizer for SharedSecret {
    fn verify(&self, key: &str, event_id: &str) -> bool {
        let allowed = !key.is_empty() && key == self.key;
        if !allowed {
            tracing::debug!("[{}] Shared secret mismatch", event_id);
        }
        allowed
    }
}
