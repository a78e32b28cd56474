//! Durable storage of the IPAM document.
//!
//! The document is updated with RFC 6902 JSON patches. Each patch replaces whole top-level fields
//! of the document's `spec`, so a backend only needs to apply the patch and return the resulting
//! document.

use crate::k8s::{ConfiguredCluster, EndpointMapping, IpamStorageSpec, Subnets};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to apply patch: {0}")]
    Patch(#[from] json_patch::PatchError),

    #[error("failed to encode document: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Top-level fields of the IPAM document.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    Prefixes,
    Pools,
    ReservedSubnets,
    ClusterSubnets,
    ExternalCidr,
    PodCidr,
    ServiceCidr,
    EndpointMappings,
    NatMappingsConfigured,
}

/// A set of field replacements to be applied to the document in one write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Patch {
    fields: BTreeMap<Field, Value>,
}

/// Persists the IPAM document.
///
/// Implementations keep an in-memory copy of the document that reflects the last successful
/// write from this process.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Returns the cached document. The cache is replaced, never mutated, on each write.
    fn document(&self) -> Arc<IpamStorageSpec>;

    /// Applies `patch` to the durable document and refreshes the cache from the result.
    async fn apply(&self, patch: Patch) -> Result<IpamStorageSpec, StorageError>;

    fn pools(&self) -> Vec<String> {
        self.document().pools.clone()
    }

    async fn update_pools(&self, pools: Vec<String>) -> Result<(), StorageError> {
        self.apply(Patch::default().set(Field::Pools, &pools)?).await.map(drop)
    }

    fn reserved_subnets(&self) -> Vec<String> {
        self.document().reserved_subnets.clone()
    }

    async fn update_reserved_subnets(&self, subnets: Vec<String>) -> Result<(), StorageError> {
        self.apply(Patch::default().set(Field::ReservedSubnets, &subnets)?).await.map(drop)
    }

    fn cluster_subnets(&self) -> BTreeMap<String, Subnets> {
        self.document().cluster_subnets.clone()
    }

    async fn update_cluster_subnets(
        &self,
        subnets: BTreeMap<String, Subnets>,
    ) -> Result<(), StorageError> {
        self.apply(Patch::default().set(Field::ClusterSubnets, &subnets)?).await.map(drop)
    }

    fn external_cidr(&self) -> String {
        self.document().external_cidr.clone()
    }

    async fn update_external_cidr(&self, cidr: String) -> Result<(), StorageError> {
        self.apply(Patch::default().set(Field::ExternalCidr, &cidr)?).await.map(drop)
    }

    fn pod_cidr(&self) -> String {
        self.document().pod_cidr.clone()
    }

    async fn update_pod_cidr(&self, cidr: String) -> Result<(), StorageError> {
        self.apply(Patch::default().set(Field::PodCidr, &cidr)?).await.map(drop)
    }

    fn service_cidr(&self) -> String {
        self.document().service_cidr.clone()
    }

    async fn update_service_cidr(&self, cidr: String) -> Result<(), StorageError> {
        self.apply(Patch::default().set(Field::ServiceCidr, &cidr)?).await.map(drop)
    }

    fn endpoint_mappings(&self) -> BTreeMap<String, EndpointMapping> {
        self.document().endpoint_mappings.clone()
    }

    async fn update_endpoint_mappings(
        &self,
        mappings: BTreeMap<String, EndpointMapping>,
    ) -> Result<(), StorageError> {
        self.apply(Patch::default().set(Field::EndpointMappings, &mappings)?).await.map(drop)
    }

    fn nat_mappings_configured(&self) -> BTreeMap<String, ConfiguredCluster> {
        self.document().nat_mappings_configured.clone()
    }

    async fn update_nat_mappings_configured(
        &self,
        configured: BTreeMap<String, ConfiguredCluster>,
    ) -> Result<(), StorageError> {
        let patch = Patch::default().set(Field::NatMappingsConfigured, &configured)?;
        self.apply(patch).await.map(drop)
    }

    fn prefixes(&self) -> BTreeMap<String, String> {
        self.document().prefixes.clone()
    }

    async fn update_prefixes(
        &self,
        prefixes: BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        self.apply(Patch::default().set(Field::Prefixes, &prefixes)?).await.map(drop)
    }
}

/// An in-process [`Storage`], used in tests and when no cluster is available.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    cache: RwLock<Arc<IpamStorageSpec>>,
    write: Mutex<()>,
    writes: AtomicUsize,
}

// === impl Field ===

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Prefixes,
        Field::Pools,
        Field::ReservedSubnets,
        Field::ClusterSubnets,
        Field::ExternalCidr,
        Field::PodCidr,
        Field::ServiceCidr,
        Field::EndpointMappings,
        Field::NatMappingsConfigured,
    ];

    /// The field's name in the serialized document.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prefixes => "prefixes",
            Self::Pools => "pools",
            Self::ReservedSubnets => "reservedSubnets",
            Self::ClusterSubnets => "clusterSubnets",
            Self::ExternalCidr => "externalCIDR",
            Self::PodCidr => "podCIDR",
            Self::ServiceCidr => "serviceCIDR",
            Self::EndpointMappings => "endpointMappings",
            Self::NatMappingsConfigured => "natMappingsConfigured",
        }
    }

    fn get(&self, doc: &IpamStorageSpec) -> Result<Value, serde_json::Error> {
        match self {
            Self::Prefixes => serde_json::to_value(&doc.prefixes),
            Self::Pools => serde_json::to_value(&doc.pools),
            Self::ReservedSubnets => serde_json::to_value(&doc.reserved_subnets),
            Self::ClusterSubnets => serde_json::to_value(&doc.cluster_subnets),
            Self::ExternalCidr => serde_json::to_value(&doc.external_cidr),
            Self::PodCidr => serde_json::to_value(&doc.pod_cidr),
            Self::ServiceCidr => serde_json::to_value(&doc.service_cidr),
            Self::EndpointMappings => serde_json::to_value(&doc.endpoint_mappings),
            Self::NatMappingsConfigured => serde_json::to_value(&doc.nat_mappings_configured),
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// === impl Patch ===

impl Patch {
    /// Builds a patch that turns `before` into `after`, touching only the fields that differ.
    pub fn between(
        before: &IpamStorageSpec,
        after: &IpamStorageSpec,
    ) -> Result<Self, StorageError> {
        let mut fields = BTreeMap::new();
        for field in Field::ALL {
            let value = field.get(after)?;
            if field.get(before)? != value {
                fields.insert(field, value);
            }
        }
        Ok(Self { fields })
    }

    /// Replaces `field` with `value`.
    pub fn set<T>(mut self, field: Field, value: &T) -> Result<Self, StorageError>
    where
        T: Serialize + ?Sized,
    {
        self.fields.insert(field, serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.fields.keys().copied()
    }

    /// Renders the patch as RFC 6902 operations against a resource whose document lives under
    /// `/spec`.
    ///
    /// `add` replaces an existing member and creates a missing one, so it is used for every
    /// field.
    pub fn to_json_patch(&self) -> Result<json_patch::Patch, StorageError> {
        let ops = self
            .fields
            .iter()
            .map(|(field, value)| {
                json!({
                    "op": "add",
                    "path": format!("/spec/{}", field.name()),
                    "value": value,
                })
            })
            .collect::<Vec<_>>();
        Ok(serde_json::from_value(Value::Array(ops))?)
    }
}

// === impl MemoryStorage ===

impl MemoryStorage {
    pub fn new(doc: IpamStorageSpec) -> Self {
        Self {
            cache: RwLock::new(Arc::new(doc)),
            write: Mutex::new(()),
            writes: AtomicUsize::new(0),
        }
    }

    /// The number of patches applied so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    fn document(&self) -> Arc<IpamStorageSpec> {
        self.cache.read().clone()
    }

    async fn apply(&self, patch: Patch) -> Result<IpamStorageSpec, StorageError> {
        let _write = self.write.lock();

        let mut resource = json!({ "spec": &*self.document() });
        json_patch::patch(&mut resource, &patch.to_json_patch()?.0)?;
        let doc: IpamStorageSpec = serde_json::from_value(resource["spec"].take())?;

        *self.cache.write() = Arc::new(doc.clone());
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    #[test]
    fn patches_only_changed_fields() {
        let before = IpamStorageSpec {
            pools: vec!["10.0.0.0/8".to_string()],
            pod_cidr: "10.0.0.0/24".to_string(),
            ..Default::default()
        };
        let mut after = before.clone();
        after.external_cidr = "10.0.1.0/24".to_string();
        after.cluster_subnets = btreemap! {
            "c1".to_string() => Subnets {
                remote_pod_cidr: "10.50.0.0/16".to_string(),
                ..Default::default()
            },
        };

        let patch = Patch::between(&before, &after).unwrap();
        assert_eq!(
            patch.fields().collect::<Vec<_>>(),
            vec![Field::ClusterSubnets, Field::ExternalCidr]
        );
        assert_eq!(
            serde_json::to_value(patch.to_json_patch().unwrap()).unwrap(),
            json!([
                {
                    "op": "add",
                    "path": "/spec/clusterSubnets",
                    "value": { "c1": {
                        "remotePodCIDR": "10.50.0.0/16",
                        "remoteExternalCIDR": "",
                        "localNATPodCIDR": "",
                        "localNATExternalCIDR": "",
                    }},
                },
                { "op": "add", "path": "/spec/externalCIDR", "value": "10.0.1.0/24" },
            ])
        );

        assert!(Patch::between(&after, &after).unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_storage_applies_patches() {
        let storage = MemoryStorage::default();
        storage
            .update_pools(vec!["10.0.0.0/8".to_string()])
            .await
            .unwrap();
        storage
            .update_pod_cidr("10.0.0.0/24".to_string())
            .await
            .unwrap();

        assert_eq!(storage.pools(), vec!["10.0.0.0/8".to_string()]);
        assert_eq!(storage.pod_cidr(), "10.0.0.0/24");
        assert_eq!(storage.writes(), 2);

        // Reads share the cached document instead of copying it.
        let before = storage.document();
        assert!(Arc::ptr_eq(&before, &storage.document()));
        let mut doc = IpamStorageSpec::clone(&before);
        doc.pools.clear();
        assert_eq!(storage.pools().len(), 1);

        let patch = Patch::between(&before, &doc).unwrap();
        let after = storage.apply(patch).await.unwrap();
        assert_eq!(after, doc);
        assert_eq!(*storage.document(), doc);
        // Readers holding the previous document are not affected by the write.
        assert_eq!(before.pools.len(), 1);
    }
}
