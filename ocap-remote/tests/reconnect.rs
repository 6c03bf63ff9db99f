//! Backoff, give-up, intentional close and reconnect behaviour.

mod common;

use std::time::Duration;

use common::{Kernel, RecordingHandler, init_tracing, options_for, peer_id, start_kernel, wait_until};
use ocap_core::memory::MemoryNetwork;
use ocap_remote::{BackoffConfig, PeerState, PromiseId, RemoteError};
use tokio::task::LocalSet;

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_out_backoff() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let network = MemoryNetwork::new();
            let alice = start_kernel(&network, "alice", 1, options_for("alice"), RecordingHandler::silent()).await;
            let bob_id = peer_id("bob");

            alice.learn("bob");
            alice.send(&bob_id, b"eventually").expect("send");
            assert!(wait_until(Duration::from_secs(1), || alice.snapshot(&bob_id).attempt == 1).await);
            assert_eq!(alice.snapshot(&bob_id).state, PeerState::BackingOff);

            let bob = start_kernel(&network, "bob", 2, options_for("bob"), RecordingHandler::silent()).await;
            assert!(wait_until(Duration::from_secs(5), || bob.handler.received.borrow().len() == 1).await);

            let metrics = alice.snapshot(&bob_id).metrics;
            let failed_at = metrics.last_failure_at.expect("one failure");
            let connected_at = metrics.last_connected_at.expect("connected");
            let waited = connected_at - failed_at;
            // 500ms base delay with 0.5 jitter.
            assert!(waited >= Duration::from_millis(250), "retried after {waited:?}");
            assert!(waited <= Duration::from_millis(750), "retried after {waited:?}");
            assert_eq!(alice.snapshot(&bob_id).attempt, 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_give_up_rejects_bindings_once() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let network = MemoryNetwork::new();
            let alice = start_kernel(
                &network,
                "alice",
                1,
                options_for("alice").with_max_retry_attempts(1),
                RecordingHandler::silent(),
            )
            .await;
            let bob_id = peer_id("bob");
            let started = tokio::time::Instant::now();

            alice.learn("bob");
            alice.request(&bob_id, b"lost", "kp1").expect("send");
            assert!(wait_until(Duration::from_secs(2), || alice.handler.settled_count() == 1).await);
            assert!(started.elapsed() < Duration::from_millis(500));

            let settled = alice.handler.settled.borrow().clone();
            assert_eq!(
                settled,
                vec![(
                    PromiseId::new("kp1"),
                    Err(RemoteError::RemoteConnectionLost {
                        peer: bob_id.clone()
                    })
                )]
            );
            assert_eq!(*alice.handler.give_ups.borrow(), vec![bob_id.clone()]);

            let snapshot = alice.snapshot(&bob_id);
            assert_eq!(snapshot.state, PeerState::Disconnected);
            assert_eq!(snapshot.queue_len, 0);
            assert_eq!(snapshot.pending_bindings, 0);
            assert_eq!(snapshot.attempt, 0);
            assert_eq!(snapshot.metrics.give_ups, 1);

            // New activity dials again from scratch.
            let bob = start_kernel(&network, "bob", 2, options_for("bob"), RecordingHandler::echo(b"re:")).await;
            alice.request(&bob.id, b"again", "kp2").expect("send");
            assert!(wait_until(Duration::from_secs(2), || alice.handler.settled_count() == 2).await);
            assert_eq!(
                alice.handler.settled.borrow()[1],
                (PromiseId::new("kp2"), Ok(b"re:again".to_vec()))
            );
            assert_eq!(alice.handler.give_ups.borrow().len(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_close_blocks_sends_until_reconnect() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let network = MemoryNetwork::new();
            let alice = start_kernel(&network, "alice", 1, options_for("alice"), RecordingHandler::silent()).await;
            let bob = start_kernel(&network, "bob", 2, options_for("bob"), RecordingHandler::echo(b"re:")).await;

            alice.learn("bob");
            bob.learn("alice");
            alice.request(&bob.id, b"one", "kp1").expect("send");
            assert!(wait_until(Duration::from_secs(2), || alice.handler.settled_count() == 1).await);

            alice.manager.close_connection(&bob.id).expect("close");
            assert_eq!(alice.snapshot(&bob.id).state, PeerState::IntentionallyClosed);
            assert_eq!(
                alice.send(&bob.id, b"blocked"),
                Err(RemoteError::IntentionalCloseBlocksDelivery {
                    peer: bob.id.clone()
                })
            );

            // Bob keeps redialing; alice refuses every inbound handshake.
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(alice.snapshot(&bob.id).state, PeerState::IntentionallyClosed);
            assert_eq!(alice.snapshot(&bob.id).metrics.connections_established, 1);
            assert!(bob.snapshot(&alice.id).metrics.connection_failures > 0);

            alice.manager.reconnect_peer(&bob.id, None).expect("reconnect");
            alice.request(&bob.id, b"two", "kp2").expect("send after reconnect");
            assert!(wait_until(Duration::from_secs(2), || alice.handler.settled_count() == 2).await);
            assert_eq!(
                alice.handler.settled.borrow()[1],
                (PromiseId::new("kp2"), Ok(b"re:two".to_vec()))
            );
            assert_eq!(alice.snapshot(&bob.id).state, PeerState::Connected);
            assert_eq!(bob.handler.payloads(), vec![b"one".to_vec(), b"two".to_vec()]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_close_retains_queue_for_reconnect() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let network = MemoryNetwork::new();
            let alice = start_kernel(&network, "alice", 1, options_for("alice"), RecordingHandler::silent()).await;
            let bob_id = peer_id("bob");

            alice.request(&bob_id, b"held", "kp1").expect("send");
            alice.manager.close_connection(&bob_id).expect("close");

            let bob = start_kernel(&network, "bob", 2, options_for("bob"), RecordingHandler::echo(b"re:")).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert!(bob.handler.received.borrow().is_empty());
            let snapshot = alice.snapshot(&bob_id);
            assert_eq!(snapshot.queue_len, 1);
            assert_eq!(snapshot.pending_bindings, 1);

            alice
                .manager
                .reconnect_peer(&bob_id, Some(vec![Kernel::address_of("bob")]))
                .expect("reconnect");
            assert!(wait_until(Duration::from_secs(2), || alice.handler.settled_count() == 1).await);
            assert_eq!(
                alice.handler.settled.borrow()[0],
                (PromiseId::new("kp1"), Ok(b"re:held".to_vec()))
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_all_backoffs_dials_immediately() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let network = MemoryNetwork::new();
            let slow = BackoffConfig {
                base_delay: Duration::from_secs(20),
                max_delay: Duration::from_secs(60),
                jitter: 0.0,
            };
            let alice = start_kernel(
                &network,
                "alice",
                1,
                options_for("alice").with_backoff(slow),
                RecordingHandler::silent(),
            )
            .await;
            let bob_id = peer_id("bob");

            alice.learn("bob");
            alice.send(&bob_id, b"hurry").expect("send");
            assert!(wait_until(Duration::from_secs(1), || alice.snapshot(&bob_id).attempt == 1).await);

            let bob = start_kernel(&network, "bob", 2, options_for("bob"), RecordingHandler::silent()).await;
            alice.manager.reset_all_backoffs().expect("reset");
            assert!(wait_until(Duration::from_secs(1), || bob.handler.received.borrow().len() == 1).await);
        })
        .await;
}
