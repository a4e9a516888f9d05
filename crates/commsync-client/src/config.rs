//! Configuration for the synchronization engine.

/// Per-replica synchronization options.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Strip attributes structurally equal to their schema default from
    /// whole-state sends.
    pub drop_defaults: bool,
    /// Broadcast capacity of the per-replica event bus; lagging subscribers
    /// miss events beyond this.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drop_defaults: false,
            event_capacity: 128,
        }
    }
}

/// Registry-wide options.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Fail resolution of ids with no ready or pending slot. When false,
    /// resolution of an unknown id waits for a later registration.
    pub strict: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { strict: true }
    }
}
