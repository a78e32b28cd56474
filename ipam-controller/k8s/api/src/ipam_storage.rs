use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// IpamStorage is the durable state of a cluster's IPAM. There is a single
/// instance per IPAM controller; every field is updated in place with JSON
/// patches.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ipam.linkerd.io",
    version = "v1alpha1",
    kind = "IpamStorage",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IpamStorageSpec {
    /// Opaque allocator state, keyed by CIDR.
    #[serde(default)]
    pub prefixes: BTreeMap<String, String>,

    /// Network pools from which remapped networks are carved.
    #[serde(default)]
    pub pools: Vec<String>,

    /// Networks that are explicitly out of circulation.
    #[serde(default)]
    pub reserved_subnets: Vec<String>,

    /// Networks negotiated with each remote cluster, keyed by cluster ID.
    #[serde(default)]
    pub cluster_subnets: BTreeMap<String, Subnets>,

    #[serde(default, rename = "externalCIDR")]
    pub external_cidr: String,

    #[serde(default, rename = "podCIDR")]
    pub pod_cidr: String,

    #[serde(default, rename = "serviceCIDR")]
    pub service_cidr: String,

    /// Endpoint IPs mapped into the local ExternalCIDR, keyed by the
    /// endpoint's original IP.
    #[serde(default)]
    pub endpoint_mappings: BTreeMap<String, EndpointMapping>,

    /// Clusters whose NAT mappings have been initialized.
    #[serde(default)]
    pub nat_mappings_configured: BTreeMap<String, ConfiguredCluster>,
}

/// The networks shared between this cluster and a remote cluster.
///
/// The `remote_*` fields hold the networks this cluster uses to reach the
/// remote cluster. The `local_nat_*` fields hold the networks the remote
/// cluster uses to reach this cluster, or [`crate::NONE`] when the remote
/// cluster did not remap them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Subnets {
    #[serde(default, rename = "remotePodCIDR")]
    pub remote_pod_cidr: String,

    #[serde(default, rename = "remoteExternalCIDR")]
    pub remote_external_cidr: String,

    #[serde(default, rename = "localNATPodCIDR")]
    pub local_nat_pod_cidr: String,

    #[serde(default, rename = "localNATExternalCIDR")]
    pub local_nat_external_cidr: String,
}

/// An endpoint IP mapped into the local ExternalCIDR.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct EndpointMapping {
    /// The IP acquired from the local ExternalCIDR for this endpoint.
    #[serde(default, rename = "externalCIDROriginalIP")]
    pub external_cidr_original_ip: String,

    /// Per remote cluster translations of the acquired IP.
    #[serde(default, rename = "clusterMappings")]
    pub cluster_mappings: BTreeMap<String, ClusterMapping>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ClusterMapping {
    /// The acquired IP as seen by the remote cluster.
    #[serde(default, rename = "externalCIDRNattedIP")]
    pub external_cidr_natted_ip: String,
}

/// Membership marker; the value carries no information.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ConfiguredCluster {}

impl Subnets {
    /// Returns true when no network is recorded for the cluster.
    pub fn is_empty(&self) -> bool {
        self.remote_pod_cidr.is_empty()
            && self.remote_external_cidr.is_empty()
            && self.local_nat_pod_cidr.is_empty()
            && self.local_nat_external_cidr.is_empty()
    }
}
