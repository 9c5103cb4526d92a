//! End-to-end scenarios: membership changes flowing into routing decisions.

use std::sync::Arc;

use fred::error::ErrorKind;

use shard_keeper::client::Selector;
use shard_keeper::{Error, HealthState, ShardedClient, VacantPolicy, Value};

use crate::mock_state::*;

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_reference_key_routes_to_shard_zero() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    // 'a' + 'b' + 'c' = 294, 294 % 2 = 0
    let reply = client
        .dispatch("GET", vec!["abc".into(), "extra".into()])
        .await
        .unwrap();
    assert_eq!(reply, Value::from("h0:6379".to_string()));

    let calls = connector.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].address, "h0:6379");
    assert_eq!(calls[0].operation, "GET");
    assert_eq!(calls[0].args, vec![Value::from("abc"), Value::from("extra")]);

    client.shutdown().await;
}

#[tokio::test]
async fn test_no_arguments_never_reaches_a_backend() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    let err = client.dispatch("PING", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::NoRoutingKey));
    assert!(connector.calls().is_empty());
}

#[tokio::test]
async fn test_empty_registry_is_unavailable() {
    let coordination = MockCoordination::with_shards(&[]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    let err = client.dispatch("GET", vec!["abc".into()]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ShardUnavailable {
            index: 0,
            shard_count: 0
        }
    ));
}

#[tokio::test]
async fn test_sparse_indices_report_unavailable_shard() {
    // Two shards registered at 1 and 2; "abc" selects index 0.
    let coordination = MockCoordination::with_shards(&[(1, "h1:6379"), (2, "h2:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    let err = client.dispatch("GET", vec!["abc".into()]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ShardUnavailable {
            index: 0,
            shard_count: 2
        }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_backend_error_returned_verbatim() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    let connector = RecordingConnector::new();
    connector.fail("INCR", "ERR value is not an integer or out of range");
    let client = start_client(&coordination, &connector).await;

    let err = client.incr("counter").await.unwrap_err();
    match err {
        Error::Backend(e) => {
            assert!(matches!(e.kind(), ErrorKind::InvalidArgument));
            assert_eq!(e.details(), "ERR value is not an integer or out of range");
        }
        other => panic!("expected backend error, got {other:?}"),
    }
    // Forwarded once, never retried.
    assert_eq!(connector.calls().len(), 1);
}

#[tokio::test]
async fn test_custom_selector_takes_effect_on_next_dispatch() {
    let coordination =
        MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379"), (2, "h2:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;
    assert_eq!(client.selector_name().await, "byte-sum");

    client
        .set_selector(Selector::new("last", |count, _key| (count - 1) as u32))
        .await;
    assert_eq!(client.selector_name().await, "last");

    let (index, endpoint) = client.route("abc").await.unwrap();
    assert_eq!(index, 2);
    assert_eq!(endpoint.address(), "h2:6379");

    client.dispatch("GET", vec!["anything".into()]).await.unwrap();
    assert_eq!(connector.calls()[0].address, "h2:6379");
}

#[tokio::test]
async fn test_typed_helpers() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    let connector = RecordingConnector::new();
    connector.reply("GET", Value::from("alice".to_string()));
    connector.reply("SET", Value::from("OK".to_string()));
    connector.reply("INCRBY", Value::Integer(7));
    connector.reply("EXISTS", Value::Integer(1));
    connector.reply("EXPIRE", Value::Integer(0));
    connector.reply("DEL", Value::Integer(1));
    let client = start_client(&coordination, &connector).await;

    client.set("user:1", "alice").await.unwrap();
    let name: Option<String> = client.get("user:1").await.unwrap();
    assert_eq!(name.as_deref(), Some("alice"));
    assert_eq!(client.incr_by("visits", 7).await.unwrap(), 7);
    assert!(client.exists("user:1").await.unwrap());
    assert!(!client.expire("user:1", 60).await.unwrap());
    assert_eq!(client.del("user:1").await.unwrap(), 1);

    let calls = connector.calls();
    assert_eq!(calls[0].args, vec![Value::from("user:1"), Value::from("alice")]);
    assert_eq!(calls[2].operation, "INCRBY");
    assert_eq!(calls[2].args, vec![Value::from("visits"), Value::Integer(7)]);
}

#[tokio::test]
async fn test_dispatch_metrics_recorded() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    let connector = RecordingConnector::new();
    let health = Arc::new(HealthState::new());
    let client = ShardedClient::start(
        coordination.clone(),
        connector.clone(),
        &test_config(),
        Some(health.clone()),
    )
    .await
    .unwrap();
    assert!(health.is_ready().await);

    client.dispatch("get", vec!["abc".into()]).await.unwrap();
    let _ = client.dispatch("get", vec![]).await;

    let encoded = health.metrics.encode();
    assert!(encoded.contains("operation=\"GET\",outcome=\"ok\""));
    assert!(encoded.contains("operation=\"GET\",outcome=\"error\""));
    assert!(encoded.contains("shardkeeper_shards_registered 1"));

    client.shutdown().await;
    assert!(!health.is_ready().await);
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_malformed_shard_is_skipped_others_load() {
    let coordination = MockCoordination::with_shards(&[
        (0, "h0:6379"),
        (1, "h1:6379"),
        (2, "h2:6379"),
        (3, "notahostport"),
    ]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    assert_eq!(
        endpoints(&client.snapshot().await),
        vec![
            (0, "h0:6379".to_string()),
            (1, "h1:6379".to_string()),
            (2, "h2:6379".to_string()),
        ]
    );

    // The malformed node is still watched; fixing it registers the shard.
    coordination.publish(3, "h3:6379");
    wait_for(&client, "shard 3 to register", |e| e.len() == 4).await;
}

#[tokio::test]
async fn test_malformed_update_keeps_previous_endpoint() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379")]);
    let connector = RecordingConnector::new();
    let health = Arc::new(HealthState::new());
    let client = ShardedClient::start(
        coordination.clone(),
        connector.clone(),
        &test_config(),
        Some(health.clone()),
    )
    .await
    .unwrap();

    coordination.publish(1, "h1:not-a-port");
    poll_until("malformed payload to be counted", || {
        health.metrics.encode().contains("kind=\"malformed\"")
    })
    .await;

    let (_, endpoint) = client.route("b").await.unwrap(); // 98 % 2 = 0
    assert_eq!(endpoint.address(), "h0:6379");
    assert_eq!(client.registry().get(1).await.unwrap().address(), "h1:6379");
}

#[tokio::test]
async fn test_deleted_shard_shrinks_registry() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    coordination.delete(&shard_path(1));
    wait_for(&client, "shard 1 removal", |e| e.len() == 1).await;

    assert!(client.registry().get(1).await.is_none());
    // Every key now routes to the single remaining shard.
    for key in ["abc", "b", "zzz"] {
        let (index, _) = client.route(key).await.unwrap();
        assert_eq!(index, 0);
    }
    poll_until("removed handle to close", || {
        connector.closes().contains(&"h1:6379".to_string())
    })
    .await;
}

#[tokio::test]
async fn test_deletion_can_leave_selected_index_missing() {
    let coordination =
        MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379"), (2, "h2:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    coordination.delete(&shard_path(0));
    wait_for(&client, "shard 0 removal", |e| e.len() == 2).await;

    // 294 % 2 = 0, which no longer exists.
    let err = client.dispatch("GET", vec!["abc".into()]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ShardUnavailable {
            index: 0,
            shard_count: 2
        }
    ));
}

#[tokio::test]
async fn test_endpoint_replacement() {
    let coordination = MockCoordination::with_shards(&[(0, "h1:7001")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;
    let held = client.registry().get(0).await.unwrap();

    coordination.publish(0, "h2:7002");
    wait_for(&client, "endpoint replacement", |e| {
        e == [(0, "h2:7002".to_string())]
    })
    .await;

    client.dispatch("GET", vec!["abc".into()]).await.unwrap();
    assert_eq!(connector.calls()[0].address, "h2:7002");
    poll_until("old handle to close", || {
        connector.closes() == vec!["h1:7001".to_string()]
    })
    .await;

    // A reader holding the old entry still sees a consistent endpoint.
    assert_eq!(held.address(), "h1:7001");
}

#[tokio::test]
async fn test_identical_rewrite_keeps_handle() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;
    let generation = client.registry().generation();

    coordination.publish(0, "h0:6379");
    poll_until("rewrite to be re-read", || coordination.data_reads() >= 2).await;
    settle().await;

    assert_eq!(connector.connects(), vec!["h0:6379".to_string()]);
    assert!(connector.closes().is_empty());
    assert_eq!(client.registry().generation(), generation);
}

#[tokio::test]
async fn test_new_shard_appears() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    coordination.publish(1, "h1:6379");
    wait_for(&client, "shard 1 to appear", |e| e.len() == 2).await;

    let (index, endpoint) = client.route("abc").await.unwrap();
    assert_eq!(index, 0);
    assert_eq!(endpoint.address(), "h0:6379");
    let (index, _) = client.route("a").await.unwrap(); // 97 % 2 = 1
    assert_eq!(index, 1);
}

#[tokio::test]
async fn test_non_numeric_children_ignored() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    coordination.create(&format!("{CLUSTER_PATH}/lock"), "h9:6379");
    coordination.create(&format!("{CLUSTER_PATH}/01"), "h9:6379");
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    assert_eq!(
        endpoints(&client.snapshot().await),
        vec![(0, "h0:6379".to_string())]
    );
    assert_eq!(connector.connects(), vec!["h0:6379".to_string()]);
}

#[tokio::test]
async fn test_unreachable_backend_isolated() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379"), (1, "down:6379")]);
    let connector = RecordingConnector::new();
    connector.set_unreachable("down:6379", true);
    let client = start_client(&coordination, &connector).await;

    assert_eq!(
        endpoints(&client.snapshot().await),
        vec![(0, "h0:6379".to_string())]
    );

    // A later payload for the shard is applied normally.
    connector.set_unreachable("down:6379", false);
    coordination.publish(1, "h1:6379");
    wait_for(&client, "shard 1 to connect", |e| e.len() == 2).await;
}

#[tokio::test]
async fn test_rapid_updates_converge_to_last_value() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    for port in 7001..=7005 {
        coordination.publish(0, &format!("h0:{port}"));
    }
    wait_for(&client, "last published endpoint", |e| {
        e == [(0, "h0:7005".to_string())]
    })
    .await;
}

#[tokio::test]
async fn test_data_read_failure_retried() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    coordination.fail_reads(&shard_path(1), true);
    coordination.create(&shard_path(1), "h1:6379");
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;
    assert_eq!(client.shard_count().await, 1);

    coordination.fail_reads(&shard_path(1), false);
    wait_for(&client, "retried read of shard 1", |e| e.len() == 2).await;
}

// ============================================================================
// Vacant sentinel
// ============================================================================

#[tokio::test]
async fn test_vacant_sentinel_removes_entry() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    coordination.publish(1, "0");
    wait_for(&client, "vacated shard removal", |e| e.len() == 1).await;
    assert!(client.registry().get(1).await.is_none());
}

#[tokio::test]
async fn test_vacant_sentinel_keep_stale() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379")]);
    let connector = RecordingConnector::new();
    let config = test_config().with_vacant_policy(VacantPolicy::KeepStale);
    let client = start_with(&coordination, &connector, config).await;

    coordination.publish(1, "0");
    poll_until("sentinel to be read", || coordination.data_reads() >= 3).await;
    settle().await;

    assert_eq!(client.registry().get(1).await.unwrap().address(), "h1:6379");
    assert!(connector.closes().is_empty());
}

#[tokio::test]
async fn test_vacant_at_startup_never_registers() {
    let coordination = MockCoordination::with_shards(&[(0, "0"), (1, "h1:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    assert_eq!(
        endpoints(&client.snapshot().await),
        vec![(1, "h1:6379".to_string())]
    );
}

// ============================================================================
// Session loss
// ============================================================================

#[tokio::test]
async fn test_session_loss_resyncs_from_scratch() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    coordination.expire_session();
    settle().await;

    // Last known state keeps serving while disconnected.
    assert_eq!(client.shard_count().await, 2);
    client.dispatch("GET", vec!["abc".into()]).await.unwrap();

    // Changes made while disconnected produce no notification.
    coordination.set_silently(&shard_path(1), None);
    coordination.set_silently(&shard_path(0), Some("h5:6379"));
    coordination.set_silently(&shard_path(2), Some("h2:6379"));
    coordination.restore();

    wait_for(&client, "resync after reconnect", |e| {
        e == [(0, "h5:6379".to_string()), (2, "h2:6379".to_string())]
    })
    .await;
    assert!(coordination.reconnects() >= 1);

    // Watches were re-issued: new changes are seen again.
    coordination.publish(2, "h6:6379");
    wait_for(&client, "update after resync", |e| {
        e.contains(&(2, "h6:6379".to_string()))
    })
    .await;
    // One live registration per shard node.
    assert_eq!(coordination.data_watch_count(&shard_path(2)), 1);
}

#[tokio::test]
async fn test_start_fails_when_coordination_unavailable() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    coordination.expire_session();
    let connector = RecordingConnector::new();

    let result = ShardedClient::start(coordination, connector, &test_config(), None).await;
    assert!(matches!(result, Err(Error::CoordinationUnavailable(_))));
}

#[tokio::test]
async fn test_missing_parent_starts_empty_and_recovers() {
    let coordination = MockCoordination::new();
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;
    assert_eq!(client.shard_count().await, 0);

    coordination.create_parents();
    coordination.create(&shard_path(0), "h0:6379");
    wait_for(&client, "shards after parent creation", |e| e.len() == 1).await;
}

#[tokio::test]
async fn test_parent_deletion_clears_registry() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    coordination.set_silently(&shard_path(0), None);
    coordination.delete(CLUSTER_PATH);
    wait_for(&client, "registry to clear", |e| e.is_empty()).await;

    coordination.create(CLUSTER_PATH, "");
    coordination.create(&shard_path(0), "h7:6379");
    wait_for(&client, "shards after parent recreation", |e| {
        e == [(0, "h7:6379".to_string())]
    })
    .await;
}

#[tokio::test]
async fn test_shutdown_closes_handles() {
    let coordination = MockCoordination::with_shards(&[(0, "h0:6379"), (1, "h1:6379")]);
    let connector = RecordingConnector::new();
    let client = start_client(&coordination, &connector).await;

    client.shutdown().await;
    poll_until("handles to close", || connector.closes().len() == 2).await;

    let err = client.dispatch("GET", vec!["abc".into()]).await.unwrap_err();
    assert!(err.is_shard_unavailable());

    // Membership changes are no longer applied.
    coordination.publish(2, "h2:6379");
    settle().await;
    assert_eq!(client.shard_count().await, 0);

    // Idempotent.
    client.shutdown().await;
}
