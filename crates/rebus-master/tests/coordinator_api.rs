// SPDX-License-Identifier: MIT OR Apache-2.0
//! Coordinator behavior exercised through raw RPCs: locking, publication,
//! accounting, registration bookkeeping, and shutdown.

use rebus_core::{DEFAULT_DOMAIN, Descriptor, Value};
use rebus_master::MasterHandle;
use rebus_proto::{RpcRequest, RpcResponse, Signal};
use rebus_storage::RamStorage;
use tokio::sync::mpsc;

const CONFIG: &str = "{\"output_altering_options\":[]}";

fn master() -> MasterHandle {
    let (handle, _task) = rebus_master::spawn(Box::new(RamStorage::new()));
    handle
}

async fn register(handle: &MasterHandle, agent_id: &str) {
    let response = handle
        .call(RpcRequest::Register {
            agent_id: agent_id.to_owned(),
            domain: DEFAULT_DOMAIN.to_owned(),
            path: format!("/agent/{agent_id}"),
            config: CONFIG.to_owned(),
        })
        .await;
    assert!(matches!(response, RpcResponse::Unit), "got {response:?}");
}

async fn push(handle: &MasterHandle, agent_id: &str, descriptor: Descriptor) -> bool {
    handle
        .call(RpcRequest::Push {
            agent_id: agent_id.to_owned(),
            descriptor: Box::new(descriptor),
        })
        .await
        .as_bool()
}

fn raw(label: &str, bytes: &[u8]) -> Descriptor {
    Descriptor::new(
        label,
        "/raw",
        Value::Bytes(bytes.to_vec()),
        DEFAULT_DOMAIN,
        "inject",
    )
    .unwrap()
}

#[tokio::test]
async fn locks_are_granted_exactly_once() {
    let handle = master();
    register(&handle, "worker-0").await;
    register(&handle, "worker-1").await;

    let lock = |agent_id: &str, lock_id: &str, selector: &str| {
        let handle = handle.clone();
        let (agent_id, lock_id, selector) =
            (agent_id.to_owned(), lock_id.to_owned(), selector.to_owned());
        async move {
            handle
                .call(RpcRequest::Lock {
                    agent_id,
                    lock_id,
                    domain: DEFAULT_DOMAIN.to_owned(),
                    selector,
                })
                .await
                .as_bool()
        }
    };

    assert!(lock("worker-0", "worker{}", "/raw/%aa").await);
    // Same configuration identity: refused, regardless of instance.
    assert!(!lock("worker-1", "worker{}", "/raw/%aa").await);
    assert!(!lock("worker-0", "worker{}", "/raw/%aa").await);
    // A different configuration identity locks independently.
    assert!(lock("worker-0", "worker{\"depth\":2}", "/raw/%aa").await);
    // Other selectors are independent.
    assert!(lock("worker-0", "worker{}", "/raw/%bb").await);

    // Release and re-acquire.
    handle
        .call(RpcRequest::Unlock {
            agent_id: "worker-0".to_owned(),
            lock_id: "worker{}".to_owned(),
            domain: DEFAULT_DOMAIN.to_owned(),
            selector: "/raw/%aa".to_owned(),
            failed: false,
            retries: 0,
            wait_time_secs: 0.0,
        })
        .await;
    assert!(lock("worker-1", "worker{}", "/raw/%aa").await);

    handle.shutdown(true);
}

#[tokio::test]
async fn push_deduplicates_and_counts() {
    let handle = master();
    register(&handle, "inject-0").await;
    let d = raw("hi", b"HELLOWORLD");
    assert!(push(&handle, "inject-0", d.clone()).await);
    assert!(!push(&handle, "inject-0", d.clone()).await);

    let response = handle
        .call(RpcRequest::Find {
            agent_id: "inject-0".to_owned(),
            domain: DEFAULT_DOMAIN.to_owned(),
            selector_regex: "/raw".to_owned(),
            limit: 0,
            offset: 0,
        })
        .await;
    match response {
        RpcResponse::Selectors(selectors) => assert_eq!(selectors, vec![d.selector().to_owned()]),
        other => panic!("expected selectors, got {other:?}"),
    }
    handle.shutdown(true);
}

#[tokio::test]
async fn marks_count_once_per_configuration() {
    let handle = master();
    register(&handle, "a-0").await;
    let d = raw("hi", b"payload");
    push(&handle, "a-0", d.clone()).await;

    let mark = |agent_id: &str| {
        let handle = handle.clone();
        let (agent_id, selector) = (agent_id.to_owned(), d.selector().to_owned());
        async move {
            handle
                .call(RpcRequest::MarkProcessed {
                    agent_id,
                    domain: DEFAULT_DOMAIN.to_owned(),
                    selector,
                })
                .await
                .as_bool()
        }
    };
    assert!(mark("a-0").await);
    assert!(!mark("a-0").await);

    let response = handle
        .call(RpcRequest::ProcessedStats {
            agent_id: "a-0".to_owned(),
            domain: DEFAULT_DOMAIN.to_owned(),
        })
        .await;
    match response {
        RpcResponse::Stats { per_agent, total } => {
            assert_eq!(per_agent, vec![("a".to_owned(), 1)]);
            assert_eq!(total, 1);
        }
        other => panic!("expected stats, got {other:?}"),
    }
    handle.shutdown(true);
}

#[tokio::test]
async fn registration_is_reflected_in_list_agents() {
    let handle = master();
    register(&handle, "cat-0").await;
    register(&handle, "cat-1").await;
    register(&handle, "ls-2").await;

    let response = handle
        .call(RpcRequest::ListAgents {
            agent_id: "cat-0".to_owned(),
        })
        .await;
    match response {
        RpcResponse::AgentCounts(counts) => {
            assert_eq!(counts.get("cat"), Some(&2));
            assert_eq!(counts.get("ls"), Some(&1));
        }
        other => panic!("expected agent counts, got {other:?}"),
    }

    handle
        .call(RpcRequest::Unregister {
            agent_id: "cat-1".to_owned(),
        })
        .await;
    let response = handle
        .call(RpcRequest::ListAgents {
            agent_id: "cat-0".to_owned(),
        })
        .await;
    match response {
        RpcResponse::AgentCounts(counts) => assert_eq!(counts.get("cat"), Some(&1)),
        other => panic!("expected agent counts, got {other:?}"),
    }
    handle.shutdown(true);
}

#[tokio::test]
async fn malformed_registration_is_rejected() {
    let handle = master();
    let response = handle
        .call(RpcRequest::Register {
            agent_id: "bad-0".to_owned(),
            domain: DEFAULT_DOMAIN.to_owned(),
            path: "/agent/bad".to_owned(),
            config: "not json at all".to_owned(),
        })
        .await;
    assert!(matches!(response, RpcResponse::Error(_)));
    handle.shutdown(true);
}

#[tokio::test]
async fn request_processing_needs_a_known_selector() {
    let handle = master();
    register(&handle, "ui-0").await;
    let response = handle
        .call(RpcRequest::RequestProcessing {
            agent_id: "ui-0".to_owned(),
            domain: DEFAULT_DOMAIN.to_owned(),
            selector: "/raw/%0000".to_owned(),
            targets: vec!["worker".to_owned()],
        })
        .await;
    assert!(matches!(response, RpcResponse::Error(_)));
    handle.shutdown(true);
}

#[tokio::test]
async fn user_requests_are_numbered_and_targeted() {
    let handle = master();
    register(&handle, "ui-0").await;
    let (signal_tx, mut signals) = mpsc::unbounded_channel();
    handle.subscribe("probe", signal_tx);

    let d = raw("hi", b"target me");
    push(&handle, "ui-0", d.clone()).await;
    // Drain the new_descriptor broadcast.
    match signals.recv().await.unwrap() {
        Signal::NewDescriptor { .. } => {}
        other => panic!("expected new_descriptor, got {other:?}"),
    }

    for expected_id in 1..=2u64 {
        handle
            .call(RpcRequest::RequestProcessing {
                agent_id: "ui-0".to_owned(),
                domain: DEFAULT_DOMAIN.to_owned(),
                selector: d.selector().to_owned(),
                targets: vec!["worker".to_owned()],
            })
            .await;
        match signals.recv().await.unwrap() {
            Signal::TargetedDescriptor {
                targets,
                user_request,
                selector,
                ..
            } => {
                assert_eq!(targets, vec!["worker".to_owned()]);
                assert_eq!(user_request, Some(expected_id));
                assert_eq!(selector, d.selector());
            }
            other => panic!("expected targeted_descriptor, got {other:?}"),
        }
    }
    handle.shutdown(true);
}

#[tokio::test]
async fn graceful_shutdown_waits_for_the_last_agent() {
    let (handle, task) = rebus_master::spawn(Box::new(RamStorage::new()));
    register(&handle, "cat-0").await;

    let (signal_tx, mut signals) = mpsc::unbounded_channel();
    handle.subscribe("probe", signal_tx);

    handle.shutdown(false);
    match signals.recv().await.unwrap() {
        Signal::BusExit { persist_state } => assert!(!persist_state),
        other => panic!("expected bus_exit, got {other:?}"),
    }
    assert!(handle.is_running(), "master must wait for agents");

    handle
        .call(RpcRequest::Unregister {
            agent_id: "cat-0".to_owned(),
        })
        .await;
    task.await.unwrap();
    assert!(!handle.is_running());
}

#[tokio::test]
async fn no_new_descriptor_signals_during_shutdown() {
    let handle = master();
    register(&handle, "cat-0").await;
    let (signal_tx, mut signals) = mpsc::unbounded_channel();
    handle.subscribe("probe", signal_tx);

    handle.shutdown(false);
    match signals.recv().await.unwrap() {
        Signal::BusExit { .. } => {}
        other => panic!("expected bus_exit, got {other:?}"),
    }

    // Push is still accepted and stored, but stays silent.
    assert!(push(&handle, "cat-0", raw("quiet", b"during shutdown")).await);
    assert!(signals.try_recv().is_err(), "no signal expected");

    handle.shutdown(true);
}
