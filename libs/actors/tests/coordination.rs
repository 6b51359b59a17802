//! Cross-fiber coordination tests
//!
//! Two or more fibers on a `LocalNetwork`, exercising RPC completion paths
//! and CoroutineLock ordering end to end.

use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strand_actors::{
    CallOptions, CoroutineLockComponent, DeliveryMode, Fiber, HandlerContext, LocalNetwork, LockType,
    Reply,
};
use strand_config::StrandConfig;
use strand_types::{ActorId, ActorMessage, ActorRequest, CoreError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize)]
struct Slow {
    delay_ms: u64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Done(u64);

impl ActorMessage for Slow {
    const OPCODE: u16 = 7001;
}
impl ActorMessage for Done {
    const OPCODE: u16 = 7002;
}
impl ActorRequest for Slow {
    type Response = Done;
}

fn config(process: u32) -> StrandConfig {
    let mut config = StrandConfig::default();
    config.process.id = process;
    config.rpc.timeout_ms = 1_000;
    config
}

/// Server fiber with one entity answering `Slow` after its delay
fn start_pair(network: &Arc<LocalNetwork>) -> (Fiber, Fiber, ActorId) {
    let (server, server_inbound) = Fiber::on_local_network(config(1), network).unwrap();
    let (client, client_inbound) = Fiber::on_local_network(config(2), network).unwrap();
    server.spawn_receiver(server_inbound);
    client.spawn_receiver(client_inbound);

    let entity = server.id_generator().generate_instance_id();
    server.add_mailbox(entity, DeliveryMode::Unordered).unwrap();
    server
        .dispatcher()
        .register_request(|_ctx: HandlerContext, slow: Slow, reply: Reply<Done>| async move {
            tokio::time::sleep(Duration::from_millis(slow.delay_ms)).await;
            reply.send(Done(slow.delay_ms)).await
        })
        .unwrap();

    (server, client, entity)
}

#[test_log::test(tokio::test)]
async fn fast_call_completes_with_response() {
    let network = LocalNetwork::new();
    let (_server, client, entity) = start_pair(&network);

    let done = client.call(entity, &Slow { delay_ms: 0 }).await.unwrap();
    assert_eq!(done, Done(0));
    assert_eq!(client.rpc().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_call_times_out_exactly_once() {
    let network = LocalNetwork::new();
    let (_server, client, entity) = start_pair(&network);

    let err = client
        .call_with(
            entity,
            &Slow { delay_ms: 500 },
            CallOptions::with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RpcTimeout { timeout_ms: 50, .. }));

    // Let the handler finish and its late response arrive
    tokio::time::sleep(Duration::from_millis(600)).await;
    tokio::task::yield_now().await;

    let stats = client.rpc().metrics().get_stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.responses, 0);
    assert_eq!(stats.late_responses, 1);
    assert_eq!(client.rpc().pending_count(), 0);
}

#[tokio::test]
async fn cancelled_call_reports_cancellation() {
    let network = LocalNetwork::new();
    let (_server, client, entity) = start_pair(&network);
    let cancel = CancellationToken::new();

    let call = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            client
                .call_with(entity, &Slow { delay_ms: 10_000 }, CallOptions::with_cancel(cancel))
                .await
        })
    };
    while client.rpc().pending_count() == 0 {
        tokio::task::yield_now().await;
    }
    cancel.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::RpcCancelled { .. }));
}

#[tokio::test]
async fn detached_peer_fails_pending_calls() {
    let network = LocalNetwork::new();
    let (server, client, entity) = start_pair(&network);
    client.spawn_maintenance();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call(entity, &Slow { delay_ms: 10_000 }).await })
    };
    while client.rpc().pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    // No manual fail_process: the fiber hears about the detach from the transport
    network.detach(server.process());

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err, CoreError::PeerDisconnected { process: 1 });
    assert_eq!(client.rpc().metrics().get_stats().peer_failures, 1);
    client.shutdown();
}

#[tokio::test]
async fn many_concurrent_calls_complete_independently() {
    let network = LocalNetwork::new();
    let (_server, client, entity) = start_pair(&network);

    let calls: Vec<_> = (0..50u64)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call(entity, &Slow { delay_ms: i % 5 }).await })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap().unwrap(), Done(i as u64 % 5));
    }
    assert_eq!(client.rpc().metrics().get_stats().responses, 50);
}

/// Acquisition order for `arrivals` queued waiters on one key
fn acquisition_order(arrivals: usize) -> Vec<(usize, u32)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let locks = CoroutineLockComponent::default();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let holder = locks.acquire(LockType::LOCATION, 1).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..arrivals {
            let locks = locks.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let guard = locks.acquire(LockType::LOCATION, 1).await.unwrap();
                order.lock().push((i, guard.level()));
            }));
            tokio::task::yield_now().await;
        }

        drop(holder);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(locks.lock_count(), 0);
        let order = order.lock().clone();
        order
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn lock_waiters_acquire_in_arrival_order(arrivals in 1usize..40) {
        let order = acquisition_order(arrivals);
        let expected: Vec<(usize, u32)> = (0..arrivals).map(|i| (i, i as u32 + 1)).collect();
        prop_assert_eq!(order, expected);
    }
}
