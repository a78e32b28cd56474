use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Original endpoint IPs mapped to the IPs a remote cluster sees them as.
pub type Mappings = BTreeMap<String, String>;

/// NatMapping is the durable ledger of the IP translations programmed for a
/// single remote cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ipam.linkerd.io",
    version = "v1alpha1",
    kind = "NatMapping",
    namespaced
)]
pub struct NatMappingSpec {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,

    /// The PodCIDR the remote cluster uses to reach local pods.
    #[serde(rename = "podCIDR")]
    pub pod_cidr: String,

    /// The ExternalCIDR the remote cluster uses to reach local endpoints.
    #[serde(rename = "externalCIDR")]
    pub external_cidr: String,

    #[serde(default, rename = "clusterMappings")]
    pub cluster_mappings: Mappings,
}

impl NatMapping {
    /// The resource name used for a remote cluster's ledger.
    ///
    /// IDs that are not valid resource names are sanitized and suffixed with a hash of the ID, so
    /// that IDs differing only in case or punctuation get distinct ledgers.
    pub fn name_for(cluster_id: &str) -> String {
        let name = cluster_id
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '-' => c,
                'A'..='Z' => c.to_ascii_lowercase(),
                _ => '-',
            })
            .collect::<String>();
        if name == cluster_id {
            return format!("natmapping-{name}");
        }
        format!("natmapping-{name}-{:08x}", fnv1a(cluster_id.as_bytes()))
    }
}

/// 32-bit FNV-1a. Resource names must not change between releases, so the hash is fixed here.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn ledger_field_names() {
        let spec = NatMappingSpec {
            cluster_id: "cluster-1".to_string(),
            pod_cidr: "10.0.0.0/24".to_string(),
            external_cidr: "10.0.1.0/24".to_string(),
            cluster_mappings: btreemap! {
                "10.200.0.5".to_string() => "10.0.1.1".to_string(),
            },
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["clusterID"], "cluster-1");
        assert_eq!(json["externalCIDR"], "10.0.1.0/24");
        assert_eq!(json["clusterMappings"]["10.200.0.5"], "10.0.1.1");
    }

    #[test]
    fn resource_names() {
        assert_eq!(NatMapping::name_for("cluster-1"), "natmapping-cluster-1");

        let upper = NatMapping::name_for("Cluster-1");
        assert!(upper.starts_with("natmapping-cluster-1-"), "{upper}");
        assert_ne!(upper, NatMapping::name_for("cluster-1"));
        assert_ne!(upper, NatMapping::name_for("CLUSTER-1"));
        assert_ne!(
            NatMapping::name_for("cluster_1"),
            NatMapping::name_for("cluster.1")
        );
        // Names are stable.
        assert_eq!(upper, NatMapping::name_for("Cluster-1"));
    }
}
