//! Membership Module Tests
//!
//! Drives the scheduler against a scripted in-memory transport.
//!
//! ## Test Scopes
//! - **Transition Table**: action per status, status per outcome, backoff per failure class.
//! - **Heartbeat Cycle**: `active` -> `connection_refused` -> `active`, timeouts -> `down`.
//! - **Handshake**: REG/ACK replaces the placeholder entry with exactly one `active` record.
//! - **Scheduling**: disabled and self entries skipped, backoff deferral, concurrent fan-out,
//!   administrator disables and deletes racing an outbound call.
//! - **Event Loop**: early wake-up on events, coalescing, shutdown.

#[cfg(test)]
mod tests {
    use crate::error::{ClusterError, Result, TransportFailure};
    use crate::membership::{
        MembershipScheduler, PeerAction, PeerOutcome, SchedulerSettings, TickReport,
        MembershipEvent, event_queue,
    };
    use crate::rpc::client::PeerTransport;
    use crate::store::{Dossier, Group, MembershipStatus, NodeStore, StaticHostFacts};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // ============================================================
    // SCRIPTED TRANSPORT
    // ============================================================

    #[derive(Clone)]
    enum Reply {
        Accept,
        Refuse,
        Timeout,
        Ack(Dossier),
    }

    struct ScriptedTransport {
        replies: Mutex<HashMap<String, Reply>>,
        calls: Mutex<Vec<(PeerAction, String)>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn script(&self, address: &str, reply: Reply) {
            self.replies
                .lock()
                .unwrap()
                .insert(address.to_string(), reply);
        }

        fn calls(&self) -> Vec<(PeerAction, String)> {
            self.calls.lock().unwrap().clone()
        }

        async fn answer(&self, action: PeerAction, peer: &Dossier) -> Reply {
            self.calls
                .lock()
                .unwrap()
                .push((action, peer.address()));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.replies
                .lock()
                .unwrap()
                .get(&peer.address())
                .cloned()
                .unwrap_or(Reply::Refuse)
        }
    }

    fn failure(kind: TransportFailure) -> ClusterError {
        ClusterError::transport(kind, "scripted")
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn ping(&self, peer: &Dossier) -> Result<()> {
            match self.answer(PeerAction::Ping, peer).await {
                Reply::Accept | Reply::Ack(_) => Ok(()),
                Reply::Refuse => Err(failure(TransportFailure::Refused)),
                Reply::Timeout => Err(failure(TransportFailure::Timeout)),
            }
        }

        async fn register(&self, peer: &Dossier, _me: &Dossier) -> Result<Dossier> {
            match self.answer(PeerAction::Register, peer).await {
                Reply::Ack(descriptor) => Ok(descriptor),
                Reply::Accept => Err(failure(TransportFailure::Protocol)),
                Reply::Refuse => Err(failure(TransportFailure::Refused)),
                Reply::Timeout => Err(failure(TransportFailure::Timeout)),
            }
        }
    }

    // ============================================================
    // FIXTURES
    // ============================================================

    fn no_backoff() -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_millis(50),
            refused_backoff: Duration::ZERO,
            registration_backoff: Duration::ZERO,
            heartbeat_backoff: Duration::ZERO,
            max_concurrent_calls: 32,
        }
    }

    async fn temp_store() -> (tempfile::TempDir, Arc<NodeStore>) {
        let dir = tempfile::tempdir().unwrap();
        let mut me = Dossier::new_peer("127.0.0.1", 5555);
        me.id = "S1".to_string();
        me.status = MembershipStatus::Active;
        let store = NodeStore::new(dir.path().join("nodes.json"), Arc::new(StaticHostFacts(me)));
        store.init().await.unwrap();
        (dir, store)
    }

    async fn add_peer(
        store: &NodeStore,
        id: &str,
        host: &str,
        port: u16,
        status: MembershipStatus,
    ) {
        let mut peer = Dossier::new_peer(host, port);
        peer.id = id.to_string();
        peer.status = status;
        store.upsert(Group::Nodes, peer).await.unwrap();
    }

    async fn status_of(store: &NodeStore, id: &str) -> MembershipStatus {
        store
            .find_by_id(Group::Nodes, id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    // ============================================================
    // TRANSITION TABLE
    // ============================================================

    #[test]
    fn test_action_per_status() {
        use MembershipStatus::*;
        assert_eq!(PeerAction::for_status(Unknown), Some(PeerAction::Register));
        assert_eq!(PeerAction::for_status(Registration), Some(PeerAction::Register));
        assert_eq!(PeerAction::for_status(Active), Some(PeerAction::Ping));
        assert_eq!(PeerAction::for_status(Down), Some(PeerAction::Ping));
        assert_eq!(PeerAction::for_status(ConnectionRefused), Some(PeerAction::Ping));
        assert_eq!(PeerAction::for_status(Disabled), None);
    }

    #[test]
    fn test_status_and_backoff_per_outcome() {
        let settings = SchedulerSettings::default();

        let cases = [
            (PeerOutcome::Registered, Some(MembershipStatus::Active), None),
            (PeerOutcome::Alive, Some(MembershipStatus::Active), None),
            (
                PeerOutcome::RegistrationFailed(TransportFailure::Refused),
                Some(MembershipStatus::Registration),
                Some(Duration::from_secs(5)),
            ),
            (
                PeerOutcome::RegistrationFailed(TransportFailure::Timeout),
                Some(MembershipStatus::Registration),
                Some(Duration::from_secs(7)),
            ),
            (
                PeerOutcome::Unreachable(TransportFailure::Refused),
                Some(MembershipStatus::ConnectionRefused),
                Some(Duration::from_secs(5)),
            ),
            (
                PeerOutcome::Unreachable(TransportFailure::Other),
                Some(MembershipStatus::Down),
                Some(Duration::from_secs(10)),
            ),
            (PeerOutcome::Withdrawn, None, None),
        ];

        for (outcome, status, backoff) in cases {
            assert_eq!(outcome.next_status(), status, "{:?}", outcome);
            assert_eq!(settings.backoff_for(&outcome), backoff, "{:?}", outcome);
        }
    }

    #[test]
    fn test_tick_report_counts() {
        let mut report = TickReport::default();
        report.record(&PeerOutcome::Alive);
        report.record(&PeerOutcome::Unreachable(TransportFailure::Refused));
        report.record(&PeerOutcome::Unreachable(TransportFailure::Timeout));
        report.record(&PeerOutcome::Withdrawn);
        report.skipped += 1;

        assert_eq!(report.alive, 1);
        assert_eq!(report.refused, 1);
        assert_eq!(report.down, 1);
        assert_eq!(report.withdrawn, 1);
        assert_eq!(report.contacted(), 4);
    }

    // ============================================================
    // HEARTBEAT CYCLE
    // ============================================================

    #[tokio::test]
    async fn test_refused_heartbeat_then_recovery() {
        // ARRANGE
        let (_dir, store) = temp_store().await;
        add_peer(&store, "P1", "10.0.0.2", 6000, MembershipStatus::Active).await;
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.2:6000", Reply::Refuse);
        let scheduler = MembershipScheduler::new(store.clone(), transport.clone(), no_backoff());

        // ACT: peer refuses
        let report = scheduler.tick().await.unwrap();

        // ASSERT
        assert_eq!(report.refused, 1);
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::ConnectionRefused);

        // ACT: peer answers again
        transport.script("10.0.0.2:6000", Reply::Accept);
        let report = scheduler.tick().await.unwrap();

        // ASSERT
        assert_eq!(report.alive, 1);
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::Active);
        assert!(transport.calls().iter().all(|(a, _)| *a == PeerAction::Ping));
    }

    #[tokio::test]
    async fn test_timeout_marks_peer_down() {
        let (_dir, store) = temp_store().await;
        add_peer(&store, "P1", "10.0.0.2", 6000, MembershipStatus::Active).await;
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.2:6000", Reply::Timeout);
        let scheduler = MembershipScheduler::new(store.clone(), transport, no_backoff());

        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.down, 1);
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::Down);
    }

    #[tokio::test]
    async fn test_unchanged_status_does_not_rewrite_store() {
        let (_dir, store) = temp_store().await;
        add_peer(&store, "P1", "10.0.0.2", 6000, MembershipStatus::Active).await;
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.2:6000", Reply::Accept);
        let scheduler = MembershipScheduler::new(store.clone(), transport, no_backoff());
        let before = tokio::fs::read(store.path()).await.unwrap();

        scheduler.tick().await.unwrap();

        assert_eq!(before, tokio::fs::read(store.path()).await.unwrap());
    }

    // ============================================================
    // HANDSHAKE
    // ============================================================

    #[tokio::test]
    async fn test_ack_supersedes_placeholder_entry() {
        // ARRANGE: peer configured by an administrator under a placeholder id
        let (_dir, store) = temp_store().await;
        add_peer(&store, "TMP", "10.0.0.3", 7000, MembershipStatus::Unknown).await;

        let mut remote_self = Dossier::new_peer("10.0.0.3", 7000);
        remote_self.id = "REAL".to_string();
        remote_self.hostname = Some("gamma".to_string());
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.3:7000", Reply::Ack(remote_self));
        let scheduler = MembershipScheduler::new(store.clone(), transport.clone(), no_backoff());

        // ACT
        let report = scheduler.tick().await.unwrap();

        // ASSERT: exactly one active record, carrying the peer's own descriptor
        assert_eq!(report.registered, 1);
        let nodes = store.list(Group::Nodes).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "REAL");
        assert_eq!(nodes[0].status, MembershipStatus::Active);
        assert_eq!(nodes[0].hostname.as_deref(), Some("gamma"));

        // ACT: next tick switches to heartbeats
        scheduler.tick().await.unwrap();

        // ASSERT
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, PeerAction::Register);
        assert_eq!(calls[1].0, PeerAction::Ping);
    }

    #[tokio::test]
    async fn test_refused_registration_stays_in_registration_with_backoff() {
        // ARRANGE
        let (_dir, store) = temp_store().await;
        add_peer(&store, "P1", "10.0.0.4", 6000, MembershipStatus::Unknown).await;
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.4:6000", Reply::Refuse);
        let settings = SchedulerSettings {
            refused_backoff: Duration::from_secs(5),
            ..no_backoff()
        };
        let scheduler = MembershipScheduler::new(store.clone(), transport.clone(), settings);

        // ACT
        let first = scheduler.tick().await.unwrap();
        let second = scheduler.tick().await.unwrap();

        // ASSERT: one attempt, then deferred
        assert_eq!(first.registration_failed, 1);
        assert_eq!(second.deferred, 1);
        assert_eq!(second.contacted(), 0);
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::Registration);
    }

    #[tokio::test]
    async fn test_ack_with_own_id_is_rejected() {
        let (_dir, store) = temp_store().await;
        add_peer(&store, "P1", "10.0.0.5", 6000, MembershipStatus::Unknown).await;
        let mut mirror = Dossier::new_peer("10.0.0.5", 6000);
        mirror.id = "S1".to_string();
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.5:6000", Reply::Ack(mirror));
        let scheduler = MembershipScheduler::new(store.clone(), transport, no_backoff());

        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.registration_failed, 1);
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::Registration);
    }

    // ============================================================
    // SCHEDULING
    // ============================================================

    #[tokio::test]
    async fn test_disabled_and_self_entries_are_never_contacted() {
        let (_dir, store) = temp_store().await;
        add_peer(&store, "OFF", "10.0.0.6", 6000, MembershipStatus::Disabled).await;
        add_peer(&store, "LOOP", "127.0.0.1", 5555, MembershipStatus::Unknown).await;
        let transport = ScriptedTransport::new();
        let scheduler = MembershipScheduler::new(store.clone(), transport.clone(), no_backoff());

        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.skipped, 2);
        assert!(transport.calls().is_empty());
        assert_eq!(status_of(&store, "OFF").await, MembershipStatus::Disabled);
        assert_eq!(status_of(&store, "LOOP").await, MembershipStatus::Unknown);
    }

    #[tokio::test]
    async fn test_slow_peers_are_contacted_concurrently() {
        // ARRANGE: 8 peers, each call takes 300ms
        let (_dir, store) = temp_store().await;
        let transport = ScriptedTransport::with_delay(Duration::from_millis(300));
        for i in 0..8u16 {
            add_peer(&store, &format!("P{}", i), "10.0.0.7", 6000 + i, MembershipStatus::Active)
                .await;
            transport.script(&format!("10.0.0.7:{}", 6000 + i), Reply::Accept);
        }
        let scheduler = MembershipScheduler::new(store.clone(), transport.clone(), no_backoff());

        // ACT
        let started = std::time::Instant::now();
        let report = scheduler.tick().await.unwrap();
        let elapsed = started.elapsed();

        // ASSERT: far below the 2.4s a serial loop would need
        assert_eq!(report.alive, 8);
        assert!(elapsed < Duration::from_millis(1500), "tick took {:?}", elapsed);
        assert!(transport.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_fan_out_is_bounded() {
        let (_dir, store) = temp_store().await;
        let transport = ScriptedTransport::with_delay(Duration::from_millis(50));
        for i in 0..6u16 {
            add_peer(&store, &format!("P{}", i), "10.0.0.8", 6000 + i, MembershipStatus::Active)
                .await;
            transport.script(&format!("10.0.0.8:{}", 6000 + i), Reply::Accept);
        }
        let settings = SchedulerSettings {
            max_concurrent_calls: 2,
            ..no_backoff()
        };
        let scheduler = MembershipScheduler::new(store, transport.clone(), settings);

        let report = scheduler.tick().await.unwrap();

        assert_eq!(report.alive, 6);
        assert!(transport.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_disable_during_call_is_not_overwritten() {
        // ARRANGE
        let (_dir, store) = temp_store().await;
        add_peer(&store, "P1", "10.0.0.9", 6000, MembershipStatus::Active).await;
        let transport = ScriptedTransport::with_delay(Duration::from_millis(200));
        transport.script("10.0.0.9:6000", Reply::Refuse);
        let scheduler = MembershipScheduler::new(store.clone(), transport, no_backoff());

        // ACT: administrator disables the peer while the heartbeat is in flight
        let tick = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.tick().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        store
            .update_by_id(Group::Nodes, "P1", |d| {
                d.status = MembershipStatus::Disabled;
                Ok(())
            })
            .await
            .unwrap();
        tick.await.unwrap().unwrap();

        // ASSERT
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::Disabled);
    }

    /// Starts a tick whose REG to `P1` at 10.0.0.10:6000 is answered with
    /// `B-REAL`'s descriptor after 200ms.
    async fn tick_with_slow_ack(
        store: &Arc<NodeStore>,
    ) -> tokio::task::JoinHandle<Result<TickReport>> {
        add_peer(store, "P1", "10.0.0.10", 6000, MembershipStatus::Unknown).await;
        let mut remote_self = Dossier::new_peer("10.0.0.10", 6000);
        remote_self.id = "B-REAL".to_string();
        let transport = ScriptedTransport::with_delay(Duration::from_millis(200));
        transport.script("10.0.0.10:6000", Reply::Ack(remote_self));
        let scheduler = MembershipScheduler::new(store.clone(), transport, no_backoff());

        let tick = tokio::spawn(async move { scheduler.tick().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tick
    }

    #[tokio::test]
    async fn test_ack_after_disable_is_dropped() {
        // ARRANGE
        let (_dir, store) = temp_store().await;
        let tick = tick_with_slow_ack(&store).await;

        // ACT: administrator disables the peer while REG is in flight
        store
            .update_by_id(Group::Nodes, "P1", |d| {
                d.status = MembershipStatus::Disabled;
                Ok(())
            })
            .await
            .unwrap();
        let report = tick.await.unwrap().unwrap();

        // ASSERT: the disabled placeholder survives, the ACK does not
        assert_eq!(report.withdrawn, 1);
        assert_eq!(report.registered, 0);
        let nodes = store.list(Group::Nodes).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "P1");
        assert_eq!(nodes[0].status, MembershipStatus::Disabled);
    }

    #[tokio::test]
    async fn test_ack_after_delete_does_not_resurrect_peer() {
        // ARRANGE
        let (_dir, store) = temp_store().await;
        let tick = tick_with_slow_ack(&store).await;

        // ACT: administrator deletes the peer while REG is in flight
        assert!(store.remove_by_id(Group::Nodes, "P1").await.unwrap());
        let report = tick.await.unwrap().unwrap();

        // ASSERT
        assert_eq!(report.withdrawn, 1);
        assert!(store.list(Group::Nodes).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peer_scenario() {
        // ARRANGE: a freshly added peer nobody answers for
        let (_dir, store) = temp_store().await;
        add_peer(&store, "P1", "10.0.0.2", 6000, MembershipStatus::Unknown).await;
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.2:6000", Reply::Timeout);
        let scheduler = MembershipScheduler::new(store.clone(), transport.clone(), no_backoff());

        // ACT & ASSERT: handshake role keeps retrying registration
        scheduler.tick().await.unwrap();
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::Registration);

        // ACT & ASSERT: once in heartbeat role the failure class decides
        store.set_status("P1", MembershipStatus::Active).await.unwrap();
        scheduler.tick().await.unwrap();
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::Down);

        transport.script("10.0.0.2:6000", Reply::Refuse);
        scheduler.tick().await.unwrap();
        assert_eq!(status_of(&store, "P1").await, MembershipStatus::ConnectionRefused);
    }

    // ============================================================
    // EVENT LOOP
    // ============================================================

    #[tokio::test]
    async fn test_run_wakes_on_events_and_stops_on_shutdown() {
        // ARRANGE: interval long enough that only events can trigger extra ticks
        let (_dir, store) = temp_store().await;
        add_peer(&store, "P1", "10.0.0.2", 6000, MembershipStatus::Active).await;
        let transport = ScriptedTransport::new();
        transport.script("10.0.0.2:6000", Reply::Accept);
        let settings = SchedulerSettings {
            tick_interval: Duration::from_secs(3600),
            ..no_backoff()
        };
        let scheduler = MembershipScheduler::new(store, transport.clone(), settings);
        let (publisher, receiver) = event_queue(8);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(scheduler.run(receiver, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.calls().len(), 1, "interval fires once at start");

        // ACT: a burst of events
        for n in 0..3 {
            assert!(publisher.publish(MembershipEvent::StatusCheck {
                event_id: format!("ev{}", n),
            }));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // ASSERT: the burst produced one extra tick
        assert_eq!(transport.calls().len(), 2);

        // ACT: shutdown
        shutdown_tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(2), handle).await;

        // ASSERT
        assert!(stopped.is_ok(), "scheduler did not stop");
    }
}
