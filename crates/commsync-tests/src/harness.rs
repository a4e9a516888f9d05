//! Loopback kernel rig for end-to-end tests.
//!
//! A [`TestRig`] wires one replica to a [`MemoryChannel`] whose kernel side
//! the test drives directly: it inspects sent frames, injects updates and
//! custom messages, and reports execution statuses to release send credit.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use commsync_client::{
    memory_channel, MemoryKernel, ModelRegistry, RegistryConfig, Replica, SchemaSet, SentFrame,
    SyncConfig, Value,
};
use commsync_proto::{ReplicaId, SendId};

/// One replica wired to a loopback kernel.
pub struct TestRig {
    /// The registry owning the replica.
    pub registry: Arc<ModelRegistry>,
    /// The replica under test.
    pub replica: Arc<Replica>,
    /// The kernel side of the loopback channel.
    pub kernel: MemoryKernel,
}

/// Build an attribute map from string keys.
pub fn attrs(entries: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Initialize test logging once; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

impl TestRig {
    /// A rig whose replica is registered and attached without announcing
    /// itself, so the first flush finds full credit.
    pub async fn attached(variant: &str, initial: BTreeMap<String, Value>) -> Self {
        Self::attached_with(SchemaSet::new(), SyncConfig::default(), variant, initial).await
    }

    /// Like [`TestRig::attached`] with explicit schemas and sync options.
    pub async fn attached_with(
        schemas: SchemaSet,
        sync_config: SyncConfig,
        variant: &str,
        initial: BTreeMap<String, Value>,
    ) -> Self {
        let registry =
            ModelRegistry::with_sync_config(schemas, RegistryConfig::default(), sync_config);
        let (channel, events, kernel) = memory_channel("rig");
        let replica = registry.build_replica_with(ReplicaId::new("rig-replica"), variant, initial);
        replica.attach(channel, events).await;
        registry.insert(replica.clone()).await;
        Self {
            registry,
            replica,
            kernel,
        }
    }

    /// A rig built through `create_local`, so the replica has announced its
    /// whole state and holds zero credit until the announce is acknowledged.
    pub async fn created(variant: &str, initial: BTreeMap<String, Value>) -> Result<Self> {
        let registry = ModelRegistry::new(SchemaSet::new(), RegistryConfig::default());
        let (channel, events, kernel) = memory_channel("rig");
        let replica = registry
            .create_local(variant, channel, events, initial)
            .await?;
        Ok(Self {
            registry,
            replica,
            kernel,
        })
    }

    /// Give the replica's pump task a chance to drain queued events.
    pub async fn settle(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    /// The send id of the most recently sent frame.
    pub fn last_send_id(&self) -> SendId {
        self.kernel
            .sent()
            .last()
            .expect("no frame has been sent")
            .send_id
    }

    /// Report `idle` for the most recent frame and let the pump process it.
    pub async fn ack_last(&self) {
        self.kernel.report_idle(self.last_send_id());
        self.settle().await;
    }

    /// All frames the kernel has received.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.kernel.sent()
    }
}
