//! Per-variant attribute schema tables.
//!
//! Each replica variant gets a schema: default attribute values plus any
//! per-attribute codec overrides. Schemas are composed once at registration
//! by layering a base table with the variant's overrides; dispatch is on the
//! `"_variant"` discriminant carried in wire state.

use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::codec::{AttrCodec, DefaultCodec};
use crate::error::SyncError;
use crate::registry::Registry;
use crate::replica::Replica;
use crate::value::{structural_eq, Value};

/// Reserved attribute carrying the variant discriminant in wire state.
pub const VARIANT_ATTR: &str = "_variant";

/// The composed schema of one replica variant.
pub struct AttrSchema {
    variant: String,
    defaults: BTreeMap<String, Value>,
    codecs: HashMap<String, Arc<dyn AttrCodec>>,
    fallback: Arc<dyn AttrCodec>,
}

impl AttrSchema {
    /// The variant tag this schema was composed for.
    pub fn variant(&self) -> &str {
        &self.variant
    }

    /// The layered default attribute values, including the discriminant.
    pub fn defaults(&self) -> &BTreeMap<String, Value> {
        &self.defaults
    }

    /// The codec used for `name`, falling back to the default codec.
    pub fn codec_for(&self, name: &str) -> &Arc<dyn AttrCodec> {
        self.codecs.get(name).unwrap_or(&self.fallback)
    }

    /// Encode an attribute set for the wire, failing fast on the first
    /// serializer error so no partial payload is ever sent.
    pub fn encode_state(
        &self,
        state: &BTreeMap<String, Value>,
        owner: &Replica,
    ) -> Result<BTreeMap<String, Value>, SyncError> {
        let mut out = BTreeMap::new();
        for (name, value) in state {
            let encoded = self
                .codec_for(name)
                .encode(value, owner)
                .map_err(|e| SyncError::Encode {
                    name: name.clone(),
                    msg: e.to_string(),
                })?;
            out.insert(name.clone(), encoded);
        }
        Ok(out)
    }

    /// Decode an attribute set from the wire as one combined asynchronous
    /// step: every attribute resolves, or the whole decode fails.
    pub async fn decode_state(
        &self,
        state: BTreeMap<String, Value>,
        registry: &dyn Registry,
    ) -> Result<BTreeMap<String, Value>, SyncError> {
        let entries = try_join_all(state.into_iter().map(|(name, value)| {
            let codec = self.codec_for(&name).clone();
            async move { Ok::<_, SyncError>((name, codec.decode(value, registry).await?)) }
        }))
        .await?;
        Ok(entries.into_iter().collect())
    }

    /// Remove attributes structurally equal to their default value.
    ///
    /// The variant discriminant is always kept so the receiving side can
    /// dispatch.
    pub fn strip_defaults(&self, state: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        state
            .into_iter()
            .filter(|(name, value)| {
                name == VARIANT_ATTR
                    || !matches!(self.defaults.get(name), Some(d) if structural_eq(d, value))
            })
            .collect()
    }
}

/// Overrides layered onto the base table when registering a variant.
#[derive(Default)]
pub struct VariantSpec {
    /// Default values added to or replacing the base defaults.
    pub defaults: BTreeMap<String, Value>,
    /// Codecs added to or replacing the base codecs.
    pub codecs: HashMap<String, Arc<dyn AttrCodec>>,
}

/// The set of registered variant schemas.
///
/// Built before the registry is created; each `register` call composes the
/// variant's schema once, so lookups are plain map reads.
pub struct SchemaSet {
    base_defaults: BTreeMap<String, Value>,
    base_codecs: HashMap<String, Arc<dyn AttrCodec>>,
    fallback: Arc<dyn AttrCodec>,
    variants: HashMap<String, Arc<AttrSchema>>,
}

impl SchemaSet {
    /// An empty schema set with the default deep-copy codec as fallback.
    pub fn new() -> Self {
        Self {
            base_defaults: BTreeMap::new(),
            base_codecs: HashMap::new(),
            fallback: Arc::new(DefaultCodec),
            variants: HashMap::new(),
        }
    }

    /// An empty schema set layered on the given base defaults.
    pub fn with_base(defaults: BTreeMap<String, Value>) -> Self {
        Self {
            base_defaults: defaults,
            ..Self::new()
        }
    }

    /// Install a codec in the base table, inherited by every variant
    /// registered afterwards.
    pub fn set_base_codec(&mut self, name: &str, codec: Arc<dyn AttrCodec>) {
        self.base_codecs.insert(name.to_string(), codec);
    }

    /// Register a variant, composing its schema once from the base table
    /// layered with `spec`.
    pub fn register(&mut self, variant: &str, spec: VariantSpec) {
        let schema = self.compose(variant, Some(&spec));
        self.variants.insert(variant.to_string(), Arc::new(schema));
    }

    /// The schema for `variant`; unregistered tags get a base-only schema.
    pub fn get(&self, variant: &str) -> Arc<AttrSchema> {
        match self.variants.get(variant) {
            Some(schema) => schema.clone(),
            None => Arc::new(self.compose(variant, None)),
        }
    }

    /// Read the variant discriminant out of a wire state map.
    pub fn variant_of(state: &BTreeMap<String, Value>) -> Option<&str> {
        match state.get(VARIANT_ATTR) {
            Some(Value::Str(tag)) => Some(tag),
            _ => None,
        }
    }

    fn compose(&self, variant: &str, spec: Option<&VariantSpec>) -> AttrSchema {
        let mut defaults = self.base_defaults.clone();
        let mut codecs = self.base_codecs.clone();
        if let Some(spec) = spec {
            for (k, v) in &spec.defaults {
                defaults.insert(k.clone(), v.clone());
            }
            for (k, c) in &spec.codecs {
                codecs.insert(k.clone(), c.clone());
            }
        }
        defaults.insert(VARIANT_ATTR.to_string(), Value::str(variant));
        AttrSchema {
            variant: variant.to_string(),
            defaults,
            codecs,
            fallback: self.fallback.clone(),
        }
    }
}

impl Default for SchemaSet {
    fn default() -> Self {
        Self::new()
    }
}
