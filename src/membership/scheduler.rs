use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use super::events::{EventReceiver, MembershipEvent};
use super::types::{PeerAction, PeerOutcome, SchedulerSettings, TickReport};
use crate::error::{ClusterError, Result, TransportFailure};
use crate::rpc::client::PeerTransport;
use crate::store::{Dossier, Group, MembershipStatus, NodeStore, StatusWrite};

/// Drives every known peer through registration and heartbeats.
///
/// Each tick takes a fresh snapshot of `nodes`, contacts every eligible peer
/// concurrently (bounded by `max_concurrent_calls`) and writes the resulting
/// status back to the store. Failed peers get a "not before" instant instead
/// of a sleep, so one dead peer never delays the others.
pub struct MembershipScheduler {
    store: Arc<NodeStore>,
    transport: Arc<dyn PeerTransport>,
    settings: SchedulerSettings,
    not_before: DashMap<String, Instant>,
    limiter: Semaphore,
}

impl MembershipScheduler {
    pub fn new(
        store: Arc<NodeStore>,
        transport: Arc<dyn PeerTransport>,
        settings: SchedulerSettings,
    ) -> Arc<Self> {
        let limiter = Semaphore::new(settings.max_concurrent_calls.max(1));
        Arc::new(Self {
            store,
            transport,
            settings,
            not_before: DashMap::new(),
            limiter,
        })
    }

    /// Main loop. Ticks on the interval, early on queued events, and returns
    /// once `shutdown` flips (after the batch in flight completes).
    pub async fn run(self: Arc<Self>, mut events: EventReceiver, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Membership scheduler started (tick {:?}, fan-out {})",
            self.settings.tick_interval,
            self.settings.max_concurrent_calls
        );

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {}
                event = events.recv(), if events_open => match event {
                    Some(MembershipEvent::StatusCheck { event_id }) => {
                        let coalesced = events.drain();
                        tracing::debug!(
                            "[{}] Early status check ({} coalesced)",
                            event_id,
                            coalesced
                        );
                        interval.reset();
                    }
                    None => {
                        events_open = false;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            }

            match self.tick().await {
                Ok(report) => tracing::debug!("Tick finished: {:?}", report),
                Err(e) => tracing::error!("Tick failed: {}", e),
            }
        }

        tracing::info!("Membership scheduler stopped");
    }

    /// One pass over the peer list. Waits for every outbound call it starts.
    pub async fn tick(self: &Arc<Self>) -> Result<TickReport> {
        let doc = self.store.snapshot().await?;
        let me = doc
            .self_node
            .first()
            .cloned()
            .ok_or_else(|| ClusterError::Storage("missing 'self' entry".to_string()))?;

        // Forget backoff for peers that were removed.
        self.not_before
            .retain(|id, _| doc.nodes.iter().any(|peer| &peer.id == id));

        let now = Instant::now();
        let mut report = TickReport::default();
        let mut batch = JoinSet::new();

        for peer in doc.nodes {
            let Some(action) = PeerAction::for_status(peer.status) else {
                report.skipped += 1;
                continue;
            };
            if peer.id == me.id || peer.same_address(&me) {
                tracing::warn!(
                    "Peer entry {} at {} points at this node, skipping",
                    peer.id,
                    peer.address()
                );
                report.skipped += 1;
                continue;
            }
            if self.in_backoff(&peer.id, now) {
                report.deferred += 1;
                continue;
            }

            let scheduler = Arc::clone(self);
            let me = me.clone();
            batch.spawn(async move {
                let _permit = scheduler.limiter.acquire().await.ok();
                scheduler.contact(action, &me, peer).await
            });
        }

        while let Some(joined) = batch.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => tracing::error!("Peer task aborted: {}", e),
            }
        }

        Ok(report)
    }

    fn in_backoff(&self, peer_id: &str, now: Instant) -> bool {
        self.not_before
            .get(peer_id)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    async fn contact(&self, action: PeerAction, me: &Dossier, peer: Dossier) -> PeerOutcome {
        let outcome = match action {
            PeerAction::Register => self.register(me, &peer).await,
            PeerAction::Ping => match self.transport.ping(&peer).await {
                Ok(()) => PeerOutcome::Alive,
                Err(e) => {
                    tracing::warn!("Heartbeat to {} at {} failed: {}", peer.id, peer.address(), e);
                    PeerOutcome::Unreachable(failure_kind(&e))
                }
            },
        };

        if outcome != PeerOutcome::Registered
            && let Some(next) = outcome.next_status()
        {
            self.write_status(&peer, next).await;
        }
        self.record_backoff(&peer.id, &outcome);
        outcome
    }

    /// Initiator side of the handshake.
    async fn register(&self, me: &Dossier, peer: &Dossier) -> PeerOutcome {
        let mut ack = match self.transport.register(peer, me).await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!("Registration with {} failed: {}", peer.address(), e);
                return PeerOutcome::RegistrationFailed(failure_kind(&e));
            }
        };

        if ack.id.trim().is_empty() || ack.id == me.id {
            tracing::warn!(
                "Ignoring ACK from {} with unusable id '{}'",
                peer.address(),
                ack.id
            );
            return PeerOutcome::RegistrationFailed(TransportFailure::Protocol);
        }

        ack.status = MembershipStatus::Active;
        let ack_id = ack.id.clone();
        match self.store.supersede_pending(Group::Nodes, &peer.id, ack).await {
            Ok(Some(_)) => {
                tracing::info!(
                    "Registered with {} at {} (was {})",
                    ack_id,
                    peer.address(),
                    peer.id
                );
                self.not_before.remove(&ack_id);
                PeerOutcome::Registered
            }
            Ok(None) => {
                tracing::info!(
                    "Dropping ACK from {} at {}: {} was disabled or removed during the call",
                    ack_id,
                    peer.address(),
                    peer.id
                );
                PeerOutcome::Withdrawn
            }
            Err(e) => {
                tracing::error!("Could not store ACK from {}: {}", peer.address(), e);
                PeerOutcome::RegistrationFailed(TransportFailure::Other)
            }
        }
    }

    async fn write_status(&self, peer: &Dossier, next: MembershipStatus) {
        if peer.status == next {
            return;
        }

        match self.store.advance_status(&peer.id, next).await {
            Ok(StatusWrite::Applied { previous }) => tracing::info!(
                "Peer {} at {}: {} -> {}",
                peer.id,
                peer.address(),
                previous,
                next
            ),
            Ok(StatusWrite::KeptDisabled) => {
                tracing::debug!("Peer {} was disabled during tick, keeping it", peer.id)
            }
            Ok(StatusWrite::Missing) => tracing::debug!("Peer {} removed during tick", peer.id),
            Err(e) => tracing::error!("Could not update status of {}: {}", peer.id, e),
        }
    }

    fn record_backoff(&self, peer_id: &str, outcome: &PeerOutcome) {
        match self.settings.backoff_for(outcome) {
            Some(delay) => {
                let until = Instant::now() + delay + jitter(delay);
                self.not_before.insert(peer_id.to_string(), until);
            }
            None => {
                self.not_before.remove(peer_id);
            }
        }
    }
}

fn failure_kind(err: &ClusterError) -> TransportFailure {
    match err {
        ClusterError::Transport { kind, .. } => *kind,
        _ => TransportFailure::Other,
    }
}

/// Random extra delay, at most a tenth of `base`.
fn jitter(base: Duration) -> Duration {
    let max_ms = (base.as_millis() / 10) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
