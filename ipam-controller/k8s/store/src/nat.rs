use crate::{backend, is_status};
use linkerd_ipam_controller_core::{
    k8s::{self, NatMapping, NatMappingSpec, REMOTE_CLUSTER_ID_LABEL},
    nat::NatMappingStorage,
    StorageError,
};
use maplit::btreemap;
use tracing::debug;

/// Stores each remote cluster's NAT ledger as a `NatMapping` resource.
#[derive(Clone)]
pub struct KubeNatMappings {
    api: k8s::Api<NatMapping>,
}

// === impl KubeNatMappings ===

impl KubeNatMappings {
    pub fn new(client: k8s::Client, namespace: &str) -> Self {
        Self {
            api: k8s::Api::namespaced(client, namespace),
        }
    }
}

#[async_trait::async_trait]
impl NatMappingStorage for KubeNatMappings {
    async fn get(&self, cluster_id: &str) -> Result<Option<NatMappingSpec>, StorageError> {
        let res = self
            .api
            .get_opt(&NatMapping::name_for(cluster_id))
            .await
            .map_err(backend)?;
        owned_ledger(cluster_id, res)
    }

    async fn create(&self, ledger: NatMappingSpec) -> Result<(), StorageError> {
        let res = resource(ledger);
        self.api
            .create(&k8s::PostParams::default(), &res)
            .await
            .map_err(backend)?;
        debug!(name = ?res.metadata.name, "Created NAT mappings");
        Ok(())
    }

    async fn update(&self, ledger: NatMappingSpec) -> Result<(), StorageError> {
        let name = NatMapping::name_for(&ledger.cluster_id);
        let patch = k8s::Patch::Json::<()>(replace_spec(&ledger)?);
        match self
            .api
            .patch(&name, &k8s::PatchParams::default(), &patch)
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_status(&error, 404) => Err(StorageError::NotFound(name)),
            Err(error) => Err(backend(error)),
        }
    }

    async fn delete(&self, cluster_id: &str) -> Result<(), StorageError> {
        let name = NatMapping::name_for(cluster_id);
        match self.api.delete(&name, &k8s::DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if is_status(&error, 404) => Err(StorageError::NotFound(name)),
            Err(error) => Err(backend(error)),
        }
    }
}

fn resource(ledger: NatMappingSpec) -> NatMapping {
    NatMapping {
        metadata: k8s::ObjectMeta {
            name: Some(NatMapping::name_for(&ledger.cluster_id)),
            labels: Some(btreemap! {
                REMOTE_CLUSTER_ID_LABEL.to_string() => ledger.cluster_id.clone(),
            }),
            ..Default::default()
        },
        spec: ledger,
    }
}

/// Returns the ledger held by a resource if it belongs to `cluster_id`.
fn owned_ledger(
    cluster_id: &str,
    res: Option<NatMapping>,
) -> Result<Option<NatMappingSpec>, StorageError> {
    match res {
        Some(res) if res.spec.cluster_id != cluster_id => Err(StorageError::Backend(
            format!(
                "NAT mappings {} belong to cluster {}, not {cluster_id}",
                res.metadata.name.unwrap_or_default(),
                res.spec.cluster_id
            )
            .into(),
        )),
        res => Ok(res.map(|r| r.spec)),
    }
}

/// Replaces the whole ledger, so that removed mappings are dropped too.
fn replace_spec(ledger: &NatMappingSpec) -> Result<json_patch::Patch, StorageError> {
    let ops = serde_json::json!([{
        "op": "replace",
        "path": "/spec",
        "value": ledger,
    }]);
    Ok(serde_json::from_value(ops)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_error;
    use pretty_assertions::assert_eq;

    fn ledger() -> NatMappingSpec {
        NatMappingSpec {
            cluster_id: "Cluster-1".to_string(),
            pod_cidr: "10.0.0.0/24".to_string(),
            external_cidr: "10.0.1.0/24".to_string(),
            cluster_mappings: btreemap! {
                "10.200.0.5".to_string() => "10.0.1.1".to_string(),
            },
        }
    }

    #[test]
    fn ledger_resources_are_labelled() {
        let res = resource(ledger());
        assert_eq!(
            res.metadata.name.as_deref(),
            Some(NatMapping::name_for("Cluster-1").as_str())
        );
        assert_eq!(
            res.metadata.labels,
            Some(btreemap! {
                REMOTE_CLUSTER_ID_LABEL.to_string() => "Cluster-1".to_string(),
            })
        );
        assert_eq!(res.spec, ledger());
    }

    #[test]
    fn updates_replace_the_ledger() {
        let patch = replace_spec(&ledger()).unwrap();
        assert_eq!(
            serde_json::to_value(patch).unwrap(),
            serde_json::json!([{
                "op": "replace",
                "path": "/spec",
                "value": {
                    "clusterID": "Cluster-1",
                    "podCIDR": "10.0.0.0/24",
                    "externalCIDR": "10.0.1.0/24",
                    "clusterMappings": { "10.200.0.5": "10.0.1.1" },
                },
            }])
        );
    }

    #[test]
    fn ledgers_of_other_clusters_are_rejected() {
        assert_eq!(owned_ledger("Cluster-1", None).unwrap(), None);
        assert_eq!(
            owned_ledger("Cluster-1", Some(resource(ledger()))).unwrap(),
            Some(ledger())
        );
        assert!(matches!(
            owned_ledger("cluster-1", Some(resource(ledger()))),
            Err(StorageError::Backend(_))
        ));
    }

    #[test]
    fn missing_ledgers_are_not_found() {
        assert!(is_status(&api_error(404, "NotFound"), 404));
        assert!(matches!(
            backend(api_error(500, "InternalError")),
            StorageError::Backend(_)
        ));
    }
}
