use crate::{
    cidr,
    k8s::{Mappings, NatMappingSpec},
    Error, StorageError,
};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, info};

/// Persists the NAT ledger of each remote cluster.
#[async_trait::async_trait]
pub trait NatMappingStorage: Send + Sync {
    async fn get(&self, cluster_id: &str) -> Result<Option<NatMappingSpec>, StorageError>;

    async fn create(&self, ledger: NatMappingSpec) -> Result<(), StorageError>;

    async fn update(&self, ledger: NatMappingSpec) -> Result<(), StorageError>;

    /// Deletes a cluster's ledger, failing with [`StorageError::NotFound`] if there is none.
    async fn delete(&self, cluster_id: &str) -> Result<(), StorageError>;
}

/// Ledgers held in process memory.
#[derive(Debug, Default)]
pub struct MemoryNatMappings {
    ledgers: RwLock<BTreeMap<String, NatMappingSpec>>,
}

/// Keeps the NAT ledger of every initialized remote cluster in memory, mirrored to a
/// [`NatMappingStorage`].
///
/// Ledgers are written to the store before the in-memory copy is updated, so the in-memory state
/// never runs ahead of what has been persisted.
pub struct NatMappingInflater {
    store: Arc<dyn NatMappingStorage>,
    ledgers: RwLock<HashMap<String, NatMappingSpec>>,
}

// === impl MemoryNatMappings ===

impl MemoryNatMappings {
    pub fn ledgers(&self) -> BTreeMap<String, NatMappingSpec> {
        self.ledgers.read().clone()
    }
}

#[async_trait::async_trait]
impl NatMappingStorage for MemoryNatMappings {
    async fn get(&self, cluster_id: &str) -> Result<Option<NatMappingSpec>, StorageError> {
        Ok(self.ledgers.read().get(cluster_id).cloned())
    }

    async fn create(&self, ledger: NatMappingSpec) -> Result<(), StorageError> {
        self.ledgers
            .write()
            .insert(ledger.cluster_id.clone(), ledger);
        Ok(())
    }

    async fn update(&self, ledger: NatMappingSpec) -> Result<(), StorageError> {
        let mut ledgers = self.ledgers.write();
        match ledgers.get_mut(&ledger.cluster_id) {
            Some(existing) => {
                *existing = ledger;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "NAT mappings for cluster {}",
                ledger.cluster_id
            ))),
        }
    }

    async fn delete(&self, cluster_id: &str) -> Result<(), StorageError> {
        self.ledgers
            .write()
            .remove(cluster_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("NAT mappings for cluster {cluster_id}")))
    }
}

// === impl NatMappingInflater ===

impl NatMappingInflater {
    pub fn new(store: Arc<dyn NatMappingStorage>) -> Self {
        Self {
            store,
            ledgers: Default::default(),
        }
    }

    pub fn is_initialized(&self, cluster_id: &str) -> bool {
        self.ledgers.read().contains_key(cluster_id)
    }

    /// Prepares the ledger of a remote cluster.
    ///
    /// A ledger that already exists in the store is recovered as-is; a new, empty one is created
    /// only when there is none.
    pub async fn init_nat_mappings_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(), Error> {
        if cluster_id.is_empty() {
            return Err(Error::invalid("cluster ID must not be empty"));
        }
        cidr::parse_net(pod_cidr)?;
        cidr::parse_net(external_cidr)?;

        if self.is_initialized(cluster_id) {
            debug!(cluster_id, "NAT mappings already initialized");
            return Ok(());
        }
        if self.recover(cluster_id).await? {
            return Ok(());
        }

        let ledger = NatMappingSpec {
            cluster_id: cluster_id.to_string(),
            pod_cidr: pod_cidr.to_string(),
            external_cidr: external_cidr.to_string(),
            cluster_mappings: Mappings::new(),
        };
        self.store.create(ledger.clone()).await?;
        info!(cluster_id, %pod_cidr, %external_cidr, "Initialized NAT mappings");
        self.ledgers.write().insert(cluster_id.to_string(), ledger);
        Ok(())
    }

    /// Loads a cluster's ledger from the store. Returns false if the store has none.
    pub async fn recover(&self, cluster_id: &str) -> Result<bool, Error> {
        match self.store.get(cluster_id).await? {
            Some(ledger) => {
                info!(
                    cluster_id,
                    mappings = ledger.cluster_mappings.len(),
                    "Recovered NAT mappings"
                );
                self.ledgers.write().insert(cluster_id.to_string(), ledger);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drops a cluster's ledger from memory and from the store. Ledgers that do not exist are
    /// ignored.
    pub async fn terminate_nat_mappings_per_cluster(&self, cluster_id: &str) -> Result<(), Error> {
        match self.store.delete(cluster_id).await {
            Ok(()) => info!(cluster_id, "Terminated NAT mappings"),
            Err(StorageError::NotFound(_)) => debug!(cluster_id, "No NAT mappings to terminate"),
            Err(error) => return Err(error.into()),
        }
        self.ledgers.write().remove(cluster_id);
        Ok(())
    }

    pub fn get_nat_mappings(&self, cluster_id: &str) -> Result<Mappings, Error> {
        self.ledger(cluster_id).map(|l| l.cluster_mappings)
    }

    /// Records that `old_ip` is reached as `new_ip` from the cluster.
    pub async fn add_mapping(
        &self,
        old_ip: &str,
        new_ip: &str,
        cluster_id: &str,
    ) -> Result<(), Error> {
        let mut ledger = self.ledger(cluster_id)?;
        if ledger.cluster_mappings.get(old_ip).map(String::as_str) == Some(new_ip) {
            return Ok(());
        }
        ledger
            .cluster_mappings
            .insert(old_ip.to_string(), new_ip.to_string());
        self.store.update(ledger.clone()).await?;
        debug!(cluster_id, %old_ip, %new_ip, "Added NAT mapping");
        self.ledgers.write().insert(cluster_id.to_string(), ledger);
        Ok(())
    }

    pub async fn remove_mapping(&self, old_ip: &str, cluster_id: &str) -> Result<(), Error> {
        let mut ledger = self.ledger(cluster_id)?;
        if ledger.cluster_mappings.remove(old_ip).is_none() {
            return Ok(());
        }
        self.store.update(ledger.clone()).await?;
        debug!(cluster_id, %old_ip, "Removed NAT mapping");
        self.ledgers.write().insert(cluster_id.to_string(), ledger);
        Ok(())
    }

    fn ledger(&self, cluster_id: &str) -> Result<NatMappingSpec, Error> {
        self.ledgers
            .read()
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| Error::missing_init(format!("NAT mappings for cluster {cluster_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use maplit::btreemap;

    #[tokio::test]
    async fn ledger_lifecycle() {
        let store = Arc::new(MemoryNatMappings::default());
        let inflater = NatMappingInflater::new(store.clone());

        assert_eq!(
            inflater.get_nat_mappings("c1").unwrap_err().kind(),
            ErrorKind::MissingInit
        );
        assert_eq!(
            inflater
                .add_mapping("10.200.0.1", "10.0.1.1", "c1")
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::MissingInit
        );

        inflater
            .init_nat_mappings_per_cluster("10.0.0.0/24", "10.0.1.0/24", "c1")
            .await
            .unwrap();
        inflater
            .add_mapping("10.200.0.1", "10.0.1.1", "c1")
            .await
            .unwrap();
        assert_eq!(
            inflater.get_nat_mappings("c1").unwrap(),
            btreemap! { "10.200.0.1".to_string() => "10.0.1.1".to_string() }
        );
        assert_eq!(store.ledgers()["c1"].cluster_mappings.len(), 1);

        inflater.remove_mapping("10.200.0.1", "c1").await.unwrap();
        inflater.remove_mapping("10.200.0.1", "c1").await.unwrap();
        assert!(store.ledgers()["c1"].cluster_mappings.is_empty());

        inflater
            .terminate_nat_mappings_per_cluster("c1")
            .await
            .unwrap();
        inflater
            .terminate_nat_mappings_per_cluster("c1")
            .await
            .unwrap();
        assert!(store.ledgers().is_empty());
        assert!(!inflater.is_initialized("c1"));
    }

    #[tokio::test]
    async fn recovers_existing_ledgers() {
        let store = Arc::new(MemoryNatMappings::default());
        {
            let inflater = NatMappingInflater::new(store.clone());
            inflater
                .init_nat_mappings_per_cluster("10.0.0.0/24", "10.0.1.0/24", "c1")
                .await
                .unwrap();
            inflater
                .add_mapping("10.200.0.1", "10.0.1.1", "c1")
                .await
                .unwrap();
        }

        // A restarted process picks up the stored mappings rather than starting over.
        let inflater = NatMappingInflater::new(store.clone());
        inflater
            .init_nat_mappings_per_cluster("10.0.0.0/24", "10.0.1.0/24", "c1")
            .await
            .unwrap();
        assert_eq!(
            inflater.get_nat_mappings("c1").unwrap().get("10.200.0.1"),
            Some(&"10.0.1.1".to_string())
        );
    }

    #[tokio::test]
    async fn validates_parameters() {
        let inflater = NatMappingInflater::new(Arc::new(MemoryNatMappings::default()));
        for (pod, ext, id) in [
            ("", "10.0.1.0/24", "c1"),
            ("10.0.0.0/24", "10.0.1.1/24", "c1"),
            ("10.0.0.0/24", "10.0.1.0/24", ""),
        ] {
            assert_eq!(
                inflater
                    .init_nat_mappings_per_cluster(pod, ext, id)
                    .await
                    .unwrap_err()
                    .kind(),
                ErrorKind::Invalid
            );
        }
    }
}
