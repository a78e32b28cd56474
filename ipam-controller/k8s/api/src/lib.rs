#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ipam_storage;
pub mod nat_mapping;

pub use self::{
    ipam_storage::{
        ClusterMapping, ConfiguredCluster, EndpointMapping, IpamStorage, IpamStorageSpec, Subnets,
    },
    nat_mapping::{Mappings, NatMapping, NatMappingSpec},
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    Client, Error, Resource,
};

/// The API group of every resource owned by the IPAM controller.
pub const GROUP: &str = "ipam.linkerd.io";

/// Marks a network field as deliberately not remapped.
pub const NONE: &str = "None";

/// Labels a `NatMapping` with the remote cluster it belongs to.
pub const REMOTE_CLUSTER_ID_LABEL: &str = "ipam.linkerd.io/remote-cluster-id";
