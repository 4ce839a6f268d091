use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::membership::{EVENT_QUEUE_CAPACITY, MembershipScheduler, event_queue};
use crate::rpc::handlers::serve;
use crate::rpc::{HttpPeerClient, RpcService, SharedSecret};
use crate::store::{LocalHostFacts, NodeStore};

/// A running node: RPC server plus membership scheduler.
pub struct NodeHandle {
    pub addr: SocketAddr,
    pub store: Arc<NodeStore>,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<anyhow::Result<()>>,
    scheduler: JoinHandle<()>,
}

/// Binds the RPC interface, initializes the store and starts both loops.
///
/// Binding happens first so that port `0` resolves to the real port before
/// the self descriptor is bootstrapped.
pub async fn start(config: &NodeConfig) -> anyhow::Result<NodeHandle> {
    let listener = tokio::net::TcpListener::bind(config.bind_socket()?).await?;
    let addr = listener.local_addr()?;

    let host_facts = Arc::new(LocalHostFacts::new(addr.ip().to_string(), addr.port()));
    let store = NodeStore::new(config.store_path.clone(), host_facts);
    let me = store.init().await?;
    tracing::info!(
        "Node {} ({}) using store {}",
        me.id,
        me.address(),
        store.path().display()
    );
    if me.address() != addr.to_string() {
        tracing::warn!(
            "Stored self address {} differs from bound address {}",
            me.address(),
            addr
        );
    }

    let (publisher, receiver) = event_queue(EVENT_QUEUE_CAPACITY);
    let service = RpcService::new(
        store.clone(),
        Arc::new(SharedSecret::new(config.key.clone())),
        publisher,
    );

    let transport = Arc::new(HttpPeerClient::new(config.call_timeout())?);
    let scheduler = MembershipScheduler::new(store.clone(), transport, config.scheduler_settings());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_task = tokio::spawn(scheduler.run(receiver, shutdown_rx.clone()));

    let mut server_shutdown = shutdown_rx;
    let server_task = tokio::spawn(serve(listener, service, async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    }));

    Ok(NodeHandle {
        addr,
        store,
        shutdown: shutdown_tx,
        server: server_task,
        scheduler: scheduler_task,
    })
}

impl NodeHandle {
    /// Stops accepting calls, lets the scheduler finish its batch, then returns.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        tracing::info!("Shutting down node on {}", self.addr);
        let _ = self.shutdown.send(true);

        self.scheduler.await?;
        self.server.await??;
        Ok(())
    }
}
