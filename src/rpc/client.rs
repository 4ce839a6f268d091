//! Outbound calls to peers.
//!
//! The scheduler only sees [`PeerTransport`]; [`HttpPeerClient`] is the
//! production implementation speaking the `/RPC2` JSON protocol.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::protocol::{ENDPOINT_RPC, Envelope, PONG, RpcMethod, RpcRequest};
use crate::error::{ClusterError, Result, TransportFailure};
use crate::store::types::Dossier;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Heartbeat. `Ok` only if the peer answered `Pong`.
    async fn ping(&self, peer: &Dossier) -> Result<()>;

    /// Sends REG carrying `me`; returns the descriptor from the peer's ACK.
    async fn register(&self, peer: &Dossier, me: &Dossier) -> Result<Dossier>;
}

#[derive(Clone)]
pub struct HttpPeerClient {
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            http_client,
            timeout,
        })
    }

    async fn call(&self, peer: &Dossier, request: &RpcRequest) -> Result<Envelope> {
        let url = format!("http://{}{}", peer.address(), ENDPOINT_RPC);

        let response = self
            .http_client
            .post(url)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ClusterError::transport(classify(&e), e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClusterError::transport(
                TransportFailure::Protocol,
                format!("{} answered HTTP {}", peer.address(), response.status()),
            ));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ClusterError::transport(classify(&e), e.to_string()))?;

        if !envelope.is_ok() {
            let desc = envelope
                .answer
                .first()
                .map(|a| a.desc.clone())
                .unwrap_or_default();
            return Err(ClusterError::transport(
                TransportFailure::Protocol,
                format!("{} rejected {}: {}", peer.address(), request.method, desc),
            ));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl PeerTransport for HttpPeerClient {
    async fn ping(&self, peer: &Dossier) -> Result<()> {
        let envelope = self
            .call(peer, &RpcRequest::new(RpcMethod::Ping, Value::Null))
            .await?;

        match envelope.data.as_str() {
            Some(PONG) => Ok(()),
            _ => Err(ClusterError::transport(
                TransportFailure::Protocol,
                format!("unexpected ping reply: {}", envelope.data),
            )),
        }
    }

    async fn register(&self, peer: &Dossier, me: &Dossier) -> Result<Dossier> {
        let request = RpcRequest::new(RpcMethod::Register, json!({ "REG": me }));
        let envelope = self.call(peer, &request).await?;

        let ack = envelope.data.get("ACK").cloned().ok_or_else(|| {
            ClusterError::transport(TransportFailure::Protocol, "registration reply without ACK")
        })?;
        serde_json::from_value(ack).map_err(|e| {
            ClusterError::transport(TransportFailure::Protocol, format!("invalid ACK: {}", e))
        })
    }
}

/// Maps a reqwest failure onto the scheduler's failure classes.
///
/// Only a socket the peer actively refused counts as `Refused`. Unreachable
/// hosts, unreachable networks and name resolution failures are `Other`.
fn classify(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        return TransportFailure::Timeout;
    }

    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(failure) = inner
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io_failure(io.kind()))
        {
            return failure;
        }
        source = inner.source();
    }

    if err.is_decode() {
        TransportFailure::Protocol
    } else {
        TransportFailure::Other
    }
}

/// Failure class for the io errors that have a dedicated one.
pub(super) fn io_failure(kind: std::io::ErrorKind) -> Option<TransportFailure> {
    match kind {
        std::io::ErrorKind::ConnectionRefused => Some(TransportFailure::Refused),
        std::io::ErrorKind::TimedOut => Some(TransportFailure::Timeout),
        _ => None,
    }
}
