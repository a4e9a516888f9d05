//! The replica: canonical attribute store with diff accumulation and echo
//! suppression.
//!
//! A replica mirrors kernel-held state for one entity. Local mutations
//! compose into a pending diff until a flush hands the payload to the sync
//! engine; remote updates apply under echo suppression so a value already in
//! flight in the opposite direction never ping-pongs back.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use commsync_proto::{BufferPath, ReplicaId, StatusEvent, WireMessage};

use crate::buffers;
use crate::channel::{Channel, ChannelEvent};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{EventBus, ReplicaEvent};
use crate::inbound;
use crate::registry::Registry;
use crate::schema::{AttrSchema, SchemaSet};
use crate::sync::{FlushKind, OutboundFrame, SyncEngine, SyncTicket};
use crate::value::{structural_eq, Value};

/// A presentation-layer consumer attached to a replica.
///
/// Views subscribe to the replica's events for their data; the replica only
/// holds them to await their removal during close. Views that keep a
/// back-reference to their replica must hold it weakly.
#[async_trait]
pub trait View: Send + Sync {
    /// Tear this view down. Awaited by the replica during close.
    async fn removed(&self);
}

struct ReplicaState {
    attrs: BTreeMap<String, Value>,
    pending_diff: BTreeMap<String, Value>,
    applying_now: Option<BTreeMap<String, Value>>,
    live: bool,
    closed: bool,
    views: Vec<Arc<dyn View>>,
}

/// Client-side mirror of kernel-held state for one entity.
pub struct Replica {
    id: ReplicaId,
    variant: String,
    schema: Arc<AttrSchema>,
    registry: Weak<dyn Registry>,
    config: SyncConfig,
    events: EventBus,
    state: Mutex<ReplicaState>,
    engine: Mutex<SyncEngine>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

/// Registry stand-in for replicas built without one; any reference token
/// fails to resolve.
struct NullRegistry;

#[async_trait]
impl Registry for NullRegistry {
    async fn resolve(&self, id: &ReplicaId) -> Result<Arc<Replica>, SyncError> {
        Err(SyncError::UnknownReplica { id: id.clone() })
    }
}

impl Replica {
    /// Build a replica. Attribute values start as the variant defaults
    /// layered with `initial`.
    pub fn new(
        id: ReplicaId,
        variant: &str,
        schema: Arc<AttrSchema>,
        registry: Weak<dyn Registry>,
        config: SyncConfig,
        initial: BTreeMap<String, Value>,
    ) -> Arc<Self> {
        let mut attrs = schema.defaults().clone();
        attrs.extend(initial);
        let events = EventBus::new(config.event_capacity);
        Arc::new(Self {
            id,
            variant: variant.to_string(),
            schema,
            registry,
            config,
            events,
            state: Mutex::new(ReplicaState {
                attrs,
                pending_diff: BTreeMap::new(),
                applying_now: None,
                live: false,
                closed: false,
                views: Vec::new(),
            }),
            engine: Mutex::new(SyncEngine::new()),
            channel: Mutex::new(None),
        })
    }

    /// Build a replica with no registry and no channel, e.g. for embedding
    /// the attribute store standalone. Reference tokens will not resolve.
    pub fn detached(
        id: ReplicaId,
        variant: &str,
        schemas: &SchemaSet,
        config: SyncConfig,
    ) -> Arc<Self> {
        Self::new(
            id,
            variant,
            schemas.get(variant),
            Weak::<NullRegistry>::new(),
            config,
            BTreeMap::new(),
        )
    }

    /// This replica's id.
    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    /// This replica's variant tag.
    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// The composed schema for this replica's variant.
    pub fn schema(&self) -> &Arc<AttrSchema> {
        &self.schema
    }

    /// Subscribe to this replica's events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }

    /// Whether the replica is attached and reachable.
    pub async fn is_live(&self) -> bool {
        self.state.lock().await.live
    }

    /// Whether the replica has been closed.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// The current value of one attribute.
    pub async fn get(&self, name: &str) -> Option<Value> {
        self.state.lock().await.attrs.get(name).cloned()
    }

    /// A snapshot of the whole attribute map.
    pub async fn state_snapshot(&self) -> BTreeMap<String, Value> {
        self.state.lock().await.attrs.clone()
    }

    /// Names of attributes changed locally since the last flush.
    pub async fn pending_keys(&self) -> Vec<String> {
        self.state.lock().await.pending_diff.keys().cloned().collect()
    }

    /// Attach an open channel and start the ordered inbound pump.
    pub async fn attach(
        self: &Arc<Self>,
        channel: Arc<dyn Channel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> JoinHandle<()> {
        {
            let mut guard = self.channel.lock().await;
            *guard = Some(channel);
        }
        {
            let mut st = self.state.lock().await;
            st.live = true;
        }
        self.events.emit(ReplicaEvent::LiveChanged { live: true });
        inbound::spawn_pump(self.clone(), events)
    }

    /// Attach a view, to be awaited on close.
    pub async fn add_view(&self, view: Arc<dyn View>) {
        self.state.lock().await.views.push(view);
    }

    /// Detach a view without closing it.
    pub async fn remove_view(&self, view: &Arc<dyn View>) {
        self.state
            .lock()
            .await
            .views
            .retain(|v| !Arc::ptr_eq(v, view));
    }

    /// Number of attached views.
    pub async fn view_count(&self) -> usize {
        self.state.lock().await.views.len()
    }

    /// Set one attribute.
    pub async fn set(&self, name: &str, value: Value) {
        let mut values = BTreeMap::new();
        values.insert(name.to_string(), value);
        self.set_many(values).await;
    }

    /// Set several attributes in one mutation.
    ///
    /// A value structurally equal to the current one is a no-op. Changed
    /// keys compose into the pending diff; keys restating a value currently
    /// being applied from a remote update are suppressed as echoes.
    pub async fn set_many(&self, values: BTreeMap<String, Value>) {
        let mut st = self.state.lock().await;
        for (name, value) in values {
            if matches!(st.attrs.get(&name), Some(current) if structural_eq(current, &value)) {
                continue;
            }
            st.attrs.insert(name.clone(), value.clone());
            st.pending_diff.insert(name.clone(), value.clone());
            if matches!(
                st.applying_now.as_ref().and_then(|a| a.get(&name)),
                Some(applying) if structural_eq(applying, &value)
            ) {
                st.pending_diff.remove(&name);
            }
            self.events.emit(ReplicaEvent::Changed { name, value });
        }
    }

    /// Flush the pending diff as a partial send.
    ///
    /// Returns `None` when nothing needed to be sent; otherwise a ticket
    /// resolving once the payload is actually transmitted.
    pub async fn flush(&self) -> Result<Option<SyncTicket>, SyncError> {
        self.sync_state(FlushKind::Patch).await
    }

    /// Send the whole attribute map.
    pub async fn sync_full(&self) -> Result<Option<SyncTicket>, SyncError> {
        self.sync_state(FlushKind::Update).await
    }

    /// Announce a newly created replica with its whole state.
    pub(crate) async fn announce(&self) -> Result<Option<SyncTicket>, SyncError> {
        self.sync_state(FlushKind::Create).await
    }

    async fn sync_state(&self, kind: FlushKind) -> Result<Option<SyncTicket>, SyncError> {
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| SyncError::Detached {
                id: self.id.clone(),
            })?;

        let payload = {
            let mut st = self.state.lock().await;
            if st.closed {
                return Err(SyncError::AlreadyClosed {
                    id: self.id.clone(),
                });
            }
            let mut payload = match kind {
                FlushKind::Patch => st.pending_diff.clone(),
                FlushKind::Create | FlushKind::Update => st.attrs.clone(),
            };
            if let Some(applying) = &st.applying_now {
                payload.retain(|name, value| {
                    !matches!(applying.get(name), Some(a) if structural_eq(a, value))
                });
            }
            if kind == FlushKind::Create && self.config.drop_defaults {
                payload = self.schema.strip_defaults(payload);
            }
            if payload.is_empty() {
                // Everything pending was an echo of in-flight remote state.
                st.pending_diff.clear();
                return Ok(None);
            }
            let encoded = self.schema.encode_state(&payload, self)?;
            st.pending_diff.clear();
            encoded
        };

        let (frame, ticket) = self.engine.lock().await.offer(kind, payload)?;
        if let Some(frame) = frame {
            self.transmit(&channel, frame).await?;
        }
        Ok(Some(ticket))
    }

    /// Send a custom message. Custom sends bypass the credit system.
    pub async fn send_custom(
        &self,
        content: serde_json::Value,
        buffers: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        let channel = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| SyncError::Detached {
                id: self.id.clone(),
            })?;
        let send_id = self.engine.lock().await.allocate_send_id();
        channel
            .send(&WireMessage::Custom { content }, &buffers, send_id)
            .await
    }

    async fn transmit(
        &self,
        channel: &Arc<dyn Channel>,
        frame: OutboundFrame,
    ) -> Result<(), SyncError> {
        let send_id = frame.send_id;
        match channel.send(&frame.message, &frame.buffers, send_id).await {
            Ok(()) => {
                frame.complete();
                Ok(())
            }
            Err(e) => {
                warn!(
                    replica = %self.id,
                    send_id = send_id.0,
                    error = %e,
                    "transmission failed, dropping payload"
                );
                self.engine.lock().await.transmit_failed(send_id);
                Err(SyncError::Transmit { msg: e.to_string() })
            }
        }
    }

    /// Route a status event into the sync engine, transmitting any drained
    /// coalesced payload.
    pub(crate) async fn handle_status(&self, event: StatusEvent) {
        let frame = self.engine.lock().await.acknowledge(&event);
        let Some(frame) = frame else { return };
        let channel = self.channel.lock().await.clone();
        match channel {
            // Transmit errors are logged inside transmit; the drain path has
            // no caller to surface them to.
            Some(channel) => {
                let _ = self.transmit(&channel, frame).await;
            }
            None => warn!(
                replica = %self.id,
                "dropping coalesced payload, replica is detached"
            ),
        }
    }

    /// Apply one inbound update message.
    pub(crate) async fn apply_update(
        &self,
        state: serde_json::Value,
        buffer_paths: &[BufferPath],
        buffers: Vec<Bytes>,
    ) -> Result<(), SyncError> {
        let raw = buffers::put_buffers(state, buffer_paths, buffers)?;
        let decoded = match self.registry.upgrade() {
            Some(registry) => self.schema.decode_state(raw, registry.as_ref()).await?,
            None => self.schema.decode_state(raw, &NullRegistry).await?,
        };

        let mut st = self.state.lock().await;
        st.applying_now = Some(decoded.clone());
        for (name, value) in decoded {
            let changed =
                !matches!(st.attrs.get(&name), Some(current) if structural_eq(current, &value));
            if matches!(st.pending_diff.get(&name), Some(pending) if structural_eq(pending, &value))
            {
                st.pending_diff.remove(&name);
            }
            st.attrs.insert(name.clone(), value.clone());
            if changed {
                self.events.emit(ReplicaEvent::Changed { name, value });
            }
        }
        st.applying_now = None;
        Ok(())
    }

    /// Deliver one inbound custom message as a one-shot event.
    pub(crate) fn handle_custom(&self, content: serde_json::Value, buffers: Vec<Bytes>) {
        self.events.emit(ReplicaEvent::Custom { content, buffers });
    }

    /// Close the replica: remove views, detach and close the channel.
    /// Idempotent; completes only after every view signalled removal.
    pub async fn close(&self) {
        self.shutdown(false).await;
    }

    /// Close initiated by the remote side; the channel is not re-closed.
    pub(crate) async fn close_from_channel(&self) {
        self.shutdown(true).await;
    }

    async fn shutdown(&self, channel_initiated: bool) {
        let views = {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            st.closed = true;
            st.live = false;
            std::mem::take(&mut st.views)
        };
        self.events.emit(ReplicaEvent::LiveChanged { live: false });
        for view in views {
            view.removed().await;
        }
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            if channel_initiated {
                debug!(replica = %self.id, "channel closed remotely, detaching");
            } else if let Err(e) = channel.close().await {
                warn!(replica = %self.id, error = %e, "channel close failed");
            }
        }
        self.events.emit(ReplicaEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory_channel;
    use crate::registry::ModelRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached() -> Arc<Replica> {
        Replica::detached(
            ReplicaId::new("r1"),
            "base",
            &SchemaSet::new(),
            SyncConfig::default(),
        )
    }

    async fn attached() -> (Arc<Replica>, crate::channel::MemoryKernel) {
        let registry = ModelRegistry::new(SchemaSet::new(), Default::default());
        let (channel, rx, kernel) = memory_channel("ch1");
        let replica = registry.build_replica(ReplicaId::new("r1"), "base");
        replica.attach(channel, rx).await;
        registry.insert(replica.clone()).await;
        (replica, kernel)
    }

    fn state(entries: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    mod diff_accumulation {
        use super::*;

        #[tokio::test]
        async fn test_mutations_compose_between_flushes() {
            let replica = detached();
            replica.set("a", Value::Int(1)).await;
            replica.set("b", Value::Int(2)).await;
            replica.set("a", Value::Int(3)).await;
            let mut keys = replica.pending_keys().await;
            keys.sort();
            assert_eq!(keys, vec!["a", "b"]);
            assert_eq!(replica.get("a").await, Some(Value::Int(3)));
        }

        #[tokio::test]
        async fn test_equal_value_is_a_no_op() {
            let replica = detached();
            replica.set("a", Value::Int(1)).await;
            let mut rx = replica.subscribe();
            replica.set("a", Value::Int(1)).await;
            assert!(rx.try_recv().is_err());
        }

        #[tokio::test]
        async fn test_set_emits_change_event() {
            let replica = detached();
            let mut rx = replica.subscribe();
            replica.set("label", Value::str("hi")).await;
            match rx.recv().await.unwrap() {
                ReplicaEvent::Changed { name, value } => {
                    assert_eq!(name, "label");
                    assert_eq!(value, Value::str("hi"));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_flush_resets_diff() {
            let (replica, kernel) = attached().await;
            replica.set("a", Value::Int(5)).await;
            let ticket = replica.flush().await.unwrap().expect("payload expected");
            ticket.transmitted().await.unwrap();
            assert!(replica.pending_keys().await.is_empty());
            assert_eq!(kernel.sent().len(), 1);
        }

        #[tokio::test]
        async fn test_empty_flush_sends_nothing() {
            let (replica, kernel) = attached().await;
            assert!(replica.flush().await.unwrap().is_none());
            assert!(kernel.sent().is_empty());
        }
    }

    mod echo_suppression {
        use super::*;

        #[tokio::test]
        async fn test_restating_applied_value_yields_empty_diff() {
            let (replica, kernel) = attached().await;
            kernel.push_update(json!({"x": 5}), vec![], vec![]).unwrap();
            // Let the pump apply the update.
            tokio::task::yield_now().await;
            while replica.get("x").await != Some(Value::Int(5)) {
                tokio::task::yield_now().await;
            }
            replica.set("x", Value::Int(5)).await;
            assert!(replica.pending_keys().await.is_empty());
            assert!(replica.flush().await.unwrap().is_none());
            assert!(kernel.sent().is_empty());
        }

        #[tokio::test]
        async fn test_set_during_application_window_is_suppressed() {
            let replica = detached();
            {
                let mut st = replica.state.lock().await;
                st.applying_now = Some(state(vec![("y", Value::Int(6))]));
                st.attrs.insert("y".to_string(), Value::Int(2));
            }
            replica.set("y", Value::Int(6)).await;
            assert!(replica.pending_keys().await.is_empty());
            // The mutation itself still lands.
            assert_eq!(replica.get("y").await, Some(Value::Int(6)));
        }

        #[tokio::test]
        async fn test_flush_drops_keys_echoing_remote_values() {
            let (replica, kernel) = attached().await;
            replica.set("a", Value::Int(1)).await;
            replica.set("b", Value::Int(2)).await;
            {
                let mut st = replica.state.lock().await;
                st.applying_now = Some(state(vec![("a", Value::Int(1))]));
            }
            let ticket = replica.flush().await.unwrap().expect("b still differs");
            ticket.transmitted().await.unwrap();
            let sent = kernel.sent();
            match &sent[0].message {
                WireMessage::Update { state, .. } => {
                    assert_eq!(state, &json!({"b": 2}));
                }
                other => panic!("expected update, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_remote_apply_scrubs_matching_pending_keys() {
            let (replica, kernel) = attached().await;
            replica.set("x", Value::Int(7)).await;
            kernel.push_update(json!({"x": 7}), vec![], vec![]).unwrap();
            while replica.get("x").await != Some(Value::Int(7)) {
                tokio::task::yield_now().await;
            }
            // Wait for the pump to finish the apply pass.
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
            assert!(replica.pending_keys().await.is_empty());
        }
    }

    mod close {
        use super::*;

        struct CountingView {
            removed: AtomicUsize,
        }

        #[async_trait]
        impl View for CountingView {
            async fn removed(&self) {
                self.removed.fetch_add(1, Ordering::SeqCst);
            }
        }

        #[tokio::test]
        async fn test_close_awaits_both_views() {
            let (replica, kernel) = attached().await;
            let v1 = Arc::new(CountingView {
                removed: AtomicUsize::new(0),
            });
            let v2 = Arc::new(CountingView {
                removed: AtomicUsize::new(0),
            });
            replica.add_view(v1.clone()).await;
            replica.add_view(v2.clone()).await;
            assert_eq!(replica.view_count().await, 2);

            replica.close().await;
            assert_eq!(v1.removed.load(Ordering::SeqCst), 1);
            assert_eq!(v2.removed.load(Ordering::SeqCst), 1);
            assert!(replica.is_closed().await);
            assert!(!replica.is_live().await);
            assert!(kernel.is_closed());
        }

        #[tokio::test]
        async fn test_close_is_idempotent() {
            let (replica, _kernel) = attached().await;
            let view = Arc::new(CountingView {
                removed: AtomicUsize::new(0),
            });
            replica.add_view(view.clone()).await;
            replica.close().await;
            replica.close().await;
            assert_eq!(view.removed.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_remote_close_does_not_reclose_channel() {
            let (replica, kernel) = attached().await;
            kernel.close_from_kernel();
            while !replica.is_closed().await {
                tokio::task::yield_now().await;
            }
            // Flushing a closed replica is a misuse error.
            assert!(matches!(
                replica.flush().await,
                Err(SyncError::Detached { .. }) | Err(SyncError::AlreadyClosed { .. })
            ));
        }

        #[tokio::test]
        async fn test_flush_without_channel_is_detached_error() {
            let replica = detached();
            replica.set("a", Value::Int(1)).await;
            let err = replica.flush().await.unwrap_err();
            assert!(matches!(err, SyncError::Detached { .. }));
            // The diff survives for retry after attach.
            assert_eq!(replica.pending_keys().await, vec!["a"]);
        }
    }

    mod custom {
        use super::*;

        #[tokio::test]
        async fn test_send_custom_bypasses_credit() {
            let (replica, kernel) = attached().await;
            replica.set("a", Value::Int(1)).await;
            replica.flush().await.unwrap();
            // Credit exhausted, custom still goes out.
            replica
                .send_custom(json!({"op": "ping"}), vec![Bytes::from_static(b"pl")])
                .await
                .unwrap();
            let sent = kernel.sent();
            assert_eq!(sent.len(), 2);
            assert!(matches!(sent[1].message, WireMessage::Custom { .. }));
            assert_eq!(sent[1].buffers.len(), 1);
        }

        #[tokio::test]
        async fn test_inbound_custom_emits_event() {
            let (replica, kernel) = attached().await;
            let mut rx = replica.subscribe();
            kernel
                .push_custom(json!({"note": 1}), vec![Bytes::from_static(b"bin")])
                .unwrap();
            loop {
                match rx.recv().await.unwrap() {
                    ReplicaEvent::Custom { content, buffers } => {
                        assert_eq!(content, json!({"note": 1}));
                        assert_eq!(buffers[0], Bytes::from_static(b"bin"));
                        break;
                    }
                    _ => continue,
                }
            }
            // No attribute mutation happened.
            assert!(replica.get("note").await.is_none());
        }
    }

    mod apply {
        use super::*;

        #[tokio::test]
        async fn test_update_applies_binaries_at_paths() {
            let (replica, kernel) = attached().await;
            kernel
                .push_update(
                    json!({"img": null, "w": 2}),
                    vec![BufferPath::root().child("img")],
                    vec![Bytes::from_static(b"px")],
                )
                .unwrap();
            while replica.get("w").await != Some(Value::Int(2)) {
                tokio::task::yield_now().await;
            }
            assert_eq!(
                replica.get("img").await,
                Some(Value::binary(&b"px"[..]))
            );
        }

        #[tokio::test]
        async fn test_decode_failure_leaves_attrs_unchanged() {
            let (replica, kernel) = attached().await;
            replica.set("a", Value::Int(1)).await;
            // Reference to an unknown replica fails the combined decode.
            kernel
                .push_update(json!({"a": 99, "link": "ref://ghost"}), vec![], vec![])
                .unwrap();
            kernel.push_update(json!({"b": 3}), vec![], vec![]).unwrap();
            // The second message still applies: failures are isolated.
            while replica.get("b").await != Some(Value::Int(3)) {
                tokio::task::yield_now().await;
            }
            assert_eq!(replica.get("a").await, Some(Value::Int(1)));
        }
    }
}
