//! Replica lookup and lifecycle registry.
//!
//! The registry is the lookup capability behind reference resolution:
//! resolving an id may await a replica whose construction is still in
//! flight. Slots are either ready (a live replica) or pending (waiters
//! queued until fulfillment).

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use commsync_proto::ReplicaId;

use crate::channel::{Channel, ChannelEvent};
use crate::config::{RegistryConfig, SyncConfig};
use crate::error::SyncError;
use crate::replica::Replica;
use crate::schema::SchemaSet;
use crate::value::Value;

/// Lookup capability used by reference resolution.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve an id to its live replica, awaiting construction if one is
    /// in progress.
    async fn resolve(&self, id: &ReplicaId) -> Result<Arc<Replica>, SyncError>;
}

enum Slot {
    Ready(Arc<Replica>),
    Pending(Vec<oneshot::Sender<Arc<Replica>>>),
}

/// The in-process replica registry.
///
/// Owns the variant schema set and tracks every replica by id. Remote
/// construction is modeled with pending slots: [`ModelRegistry::begin_remote`]
/// opens one, [`ModelRegistry::insert`] fulfills it and wakes all waiters.
pub struct ModelRegistry {
    config: RegistryConfig,
    sync_config: SyncConfig,
    schemas: SchemaSet,
    slots: Mutex<HashMap<ReplicaId, Slot>>,
}

impl ModelRegistry {
    /// Create a registry with default per-replica sync options.
    pub fn new(schemas: SchemaSet, config: RegistryConfig) -> Arc<Self> {
        Self::with_sync_config(schemas, config, SyncConfig::default())
    }

    /// Create a registry applying `sync_config` to every replica it builds.
    pub fn with_sync_config(
        schemas: SchemaSet,
        config: RegistryConfig,
        sync_config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sync_config,
            schemas,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// The variant schema set this registry dispatches on.
    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    /// Register a replica, fulfilling any pending waiters for its id.
    pub async fn insert(&self, replica: Arc<Replica>) {
        let mut slots = self.slots.lock().await;
        if let Some(Slot::Pending(waiters)) = slots.insert(
            replica.id().clone(),
            Slot::Ready(replica.clone()),
        ) {
            debug!(replica = %replica.id(), waiters = waiters.len(), "fulfilling pending slot");
            for waiter in waiters {
                let _ = waiter.send(replica.clone());
            }
        }
    }

    /// Mark an id as under construction so resolvers wait instead of
    /// failing. A no-op if the id already has a slot.
    pub async fn begin_remote(&self, id: ReplicaId) {
        let mut slots = self.slots.lock().await;
        slots.entry(id).or_insert_with(|| Slot::Pending(Vec::new()));
    }

    /// The replica registered under `id`, if construction has completed.
    pub async fn get(&self, id: &ReplicaId) -> Option<Arc<Replica>> {
        match self.slots.lock().await.get(id) {
            Some(Slot::Ready(replica)) => Some(replica.clone()),
            _ => None,
        }
    }

    /// Drop the slot for `id`. Waiters on a pending slot observe failure.
    pub async fn remove(&self, id: &ReplicaId) -> Option<Arc<Replica>> {
        match self.slots.lock().await.remove(id) {
            Some(Slot::Ready(replica)) => Some(replica),
            _ => None,
        }
    }

    /// Number of ready replicas.
    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Whether no replica is ready.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Build a replica bound to this registry, without registering it.
    pub fn build_replica(self: &Arc<Self>, id: ReplicaId, variant: &str) -> Arc<Replica> {
        self.build_replica_with(id, variant, BTreeMap::new())
    }

    /// Build a replica with initial attribute values layered over the
    /// variant defaults.
    pub fn build_replica_with(
        self: &Arc<Self>,
        id: ReplicaId,
        variant: &str,
        initial: BTreeMap<String, Value>,
    ) -> Arc<Replica> {
        let registry: Arc<dyn Registry> = self.clone();
        Replica::new(
            id,
            variant,
            self.schemas.get(variant),
            Arc::downgrade(&registry),
            self.sync_config.clone(),
            initial,
        )
    }

    /// Create a replica locally over an already-open channel.
    ///
    /// The replica is attached, registered, and announces its whole state
    /// with a `create` flush.
    pub async fn create_local(
        self: &Arc<Self>,
        variant: &str,
        channel: Arc<dyn Channel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        initial: BTreeMap<String, Value>,
    ) -> Result<Arc<Replica>, SyncError> {
        let replica = self.build_replica_with(ReplicaId::random(), variant, initial);
        replica.attach(channel, events).await;
        self.insert(replica.clone()).await;
        replica.announce().await?;
        Ok(replica)
    }

    /// Adopt a remotely constructed replica: build it with the kernel's id
    /// and initial state, attach it, and fulfill any pending waiters.
    pub async fn adopt_remote(
        self: &Arc<Self>,
        id: ReplicaId,
        variant: &str,
        channel: Arc<dyn Channel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        initial: BTreeMap<String, Value>,
    ) -> Arc<Replica> {
        let replica = self.build_replica_with(id, variant, initial);
        replica.attach(channel, events).await;
        self.insert(replica.clone()).await;
        replica
    }
}

#[async_trait]
impl Registry for ModelRegistry {
    async fn resolve(&self, id: &ReplicaId) -> Result<Arc<Replica>, SyncError> {
        let rx = {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(id) {
                Some(Slot::Ready(replica)) => return Ok(replica.clone()),
                Some(Slot::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None if self.config.strict => {
                    return Err(SyncError::UnknownReplica { id: id.clone() })
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    slots.insert(id.clone(), Slot::Pending(vec![tx]));
                    rx
                }
            }
        };
        rx.await
            .map_err(|_| SyncError::UnknownReplica { id: id.clone() })
    }
}
