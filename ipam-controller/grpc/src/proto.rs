//! Messages of the `ipam.Ipam` service.

include!(concat!(env!("OUT_DIR"), "/ipam.Ipam.rs"));

#[derive(Clone, PartialEq, prost::Message)]
pub struct MapRequest {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub ip: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MapResponse {
    #[prost(string, tag = "1")]
    pub ip: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UnmapRequest {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub ip: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct UnmapResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetHomePodIpRequest {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub ip: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetHomePodIpResponse {
    #[prost(string, tag = "1")]
    pub home_ip: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BelongsRequest {
    #[prost(string, tag = "1")]
    pub ip: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct BelongsResponse {
    #[prost(bool, tag = "1")]
    pub belongs: bool,
}

/// Requests the local ExternalCIDR. `mask` is only used the first time, when the network is
/// allocated.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ExternalCidrRequest {
    #[prost(uint32, tag = "1")]
    pub mask: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExternalCidrResponse {
    #[prost(string, tag = "1")]
    pub external_cidr: String,
}

/// Networks of a remote cluster. Used both to request remote subnets and to record the subnets
/// a remote cluster assigned to this one.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SubnetsRequest {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub pod_cidr: String,
    #[prost(string, tag = "3")]
    pub external_cidr: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubnetsResponse {
    #[prost(string, tag = "1")]
    pub pod_cidr: String,
    #[prost(string, tag = "2")]
    pub external_cidr: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct AddLocalSubnetsResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveClusterConfigRequest {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct RemoveClusterConfigResponse {}
