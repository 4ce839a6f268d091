use axum::{
    Extension, Json, Router,
    body::Bytes,
    http::StatusCode,
    routing::post,
};
use std::future::Future;
use std::sync::Arc;

use super::protocol::{ENDPOINT_RPC, Envelope, RpcRequest};
use super::service::{CallContext, RpcService};
use crate::error::ClusterError;

/// Entry point for every method. Transport-level status is always 200; the
/// outcome travels in the envelope.
pub async fn handle_rpc(
    Extension(service): Extension<Arc<RpcService>>,
    body: Bytes,
) -> (StatusCode, Json<Envelope>) {
    match serde_json::from_slice::<RpcRequest>(&body) {
        Ok(request) => (StatusCode::OK, Json(service.handle(request).await)),
        Err(e) => {
            let ctx = CallContext::new("<unparsed>");
            tracing::warn!("[{}] Malformed request body: {}", ctx.event_id, e);
            let error = ClusterError::validation(format!("malformed request: {}", e));
            (StatusCode::OK, Json(Envelope::from_error(&ctx.event_id, &error)))
        }
    }
}

pub fn router(service: Arc<RpcService>) -> Router {
    Router::new()
        .route(ENDPOINT_RPC, post(handle_rpc))
        .layer(Extension(service))
}

/// Serves the RPC surface until `shutdown` resolves.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    service: Arc<RpcService>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!("RPC interface listening on {}", addr);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("RPC interface on {} stopped", addr);
    Ok(())
}
