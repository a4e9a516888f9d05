//! End-to-end flush scenarios over the loopback kernel.

use commsync_client::{SchemaSet, SyncConfig, Value, VariantSpec, VARIANT_ATTR};
use commsync_proto::WireMessage;
use serde_json::json;

use crate::harness::{attrs, init_tracing, TestRig};

fn update_state(frame: &commsync_client::SentFrame) -> serde_json::Value {
    match &frame.message {
        WireMessage::Update { state, .. } => state.clone(),
        other => panic!("expected update frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_flush_then_buffer_then_drain() {
    init_tracing();
    let rig = TestRig::attached(
        "counter",
        attrs(vec![("a", Value::Int(1)), ("b", Value::Int(2))]),
    )
    .await;

    // Two local mutations, one flush: a single update carrying both.
    rig.replica.set("a", Value::Int(5)).await;
    rig.replica.set("b", Value::Int(9)).await;
    let ticket = rig.replica.flush().await.unwrap().expect("payload expected");
    ticket.transmitted().await.unwrap();

    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    let state = update_state(&sent[0]);
    assert_eq!(state["a"], json!(5));
    assert_eq!(state["b"], json!(9));
    match &sent[0].message {
        WireMessage::Update { buffer_paths, .. } => assert!(buffer_paths.is_empty()),
        _ => unreachable!(),
    }

    // Credit is now exhausted: the next flush buffers instead of sending.
    rig.replica.set("a", Value::Int(6)).await;
    rig.replica.flush().await.unwrap().expect("buffered payload");
    assert_eq!(rig.sent().len(), 1, "no idle yet, nothing more on the wire");

    // The idle acknowledgment drains the coalesced buffer as one frame.
    rig.ack_last().await;
    let sent = rig.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(update_state(&sent[1])["a"], json!(6));
}

#[tokio::test]
async fn test_diff_composes_to_final_values() {
    let rig = TestRig::attached("counter", attrs(vec![("n", Value::Int(0))])).await;

    for i in 1..=4 {
        rig.replica.set("n", Value::Int(i)).await;
    }
    rig.replica.set("label", Value::str("done")).await;
    // Setting a key back to its starting value still counts as changed
    // against the immediately prior value chain.
    let ticket = rig.replica.flush().await.unwrap().unwrap();
    ticket.transmitted().await.unwrap();

    let state = update_state(&rig.sent()[0]);
    assert_eq!(state, json!({"n": 4, "label": "done"}));
}

#[tokio::test]
async fn test_create_announces_whole_state() {
    let rig = TestRig::created("gauge", attrs(vec![("level", Value::Int(3))]))
        .await
        .unwrap();

    let sent = rig.sent();
    assert_eq!(sent.len(), 1);
    let state = update_state(&sent[0]);
    assert_eq!(state["level"], json!(3));
    assert_eq!(state[VARIANT_ATTR], json!("gauge"));
}

#[tokio::test]
async fn test_create_with_drop_defaults_strips_unchanged_attrs() {
    let mut schemas = SchemaSet::with_base(attrs(vec![("count", Value::Int(0))]));
    schemas.register("counter", VariantSpec::default());
    let registry = commsync_client::ModelRegistry::with_sync_config(
        schemas,
        Default::default(),
        SyncConfig {
            drop_defaults: true,
            ..Default::default()
        },
    );
    let (channel, events, kernel) = commsync_client::memory_channel("rig");
    registry
        .create_local(
            "counter",
            channel,
            events,
            attrs(vec![("label", Value::str("lit"))]),
        )
        .await
        .unwrap();

    let sent = kernel.sent();
    assert_eq!(sent.len(), 1);
    let state = update_state(&sent[0]);
    // `count` matches its default and is stripped; the discriminant stays.
    assert!(state.get("count").is_none());
    assert_eq!(state["label"], json!("lit"));
    assert_eq!(state[VARIANT_ATTR], json!("counter"));
}

#[tokio::test]
async fn test_full_state_sync_carries_every_attribute() {
    let rig = TestRig::attached(
        "counter",
        attrs(vec![("a", Value::Int(1)), ("b", Value::Int(2))]),
    )
    .await;
    let ticket = rig.replica.sync_full().await.unwrap().unwrap();
    ticket.transmitted().await.unwrap();

    let state = update_state(&rig.sent()[0]);
    assert_eq!(state["a"], json!(1));
    assert_eq!(state["b"], json!(2));
    assert_eq!(state[VARIANT_ATTR], json!("counter"));
}

#[tokio::test]
async fn test_binary_attribute_travels_out_of_band() {
    let rig = TestRig::attached("image", attrs(vec![])).await;
    rig.replica
        .set("frame", Value::binary(&b"\x00\x01\x02"[..]))
        .await;
    rig.replica.set("width", Value::Int(3)).await;
    let ticket = rig.replica.flush().await.unwrap().unwrap();
    ticket.transmitted().await.unwrap();

    let sent = rig.sent();
    match &sent[0].message {
        WireMessage::Update {
            state,
            buffer_paths,
        } => {
            assert_eq!(state.get("frame"), None, "binary must not embed in state");
            assert_eq!(state["width"], json!(3));
            assert_eq!(buffer_paths.len(), 1);
            assert_eq!(buffer_paths[0].to_string(), "frame");
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(sent[0].buffers[0].as_ref(), b"\x00\x01\x02");
}

#[tokio::test]
async fn test_inbound_update_round_trips_binaries() {
    let rig = TestRig::attached("image", attrs(vec![])).await;
    rig.kernel
        .push_update(
            json!({"frame": null, "width": 2}),
            vec![commsync_proto::BufferPath::root().child("frame")],
            vec![bytes::Bytes::from_static(b"xy")],
        )
        .unwrap();
    rig.settle().await;

    assert_eq!(
        rig.replica.get("frame").await,
        Some(Value::binary(&b"xy"[..]))
    );
    assert_eq!(rig.replica.get("width").await, Some(Value::Int(2)));
}
