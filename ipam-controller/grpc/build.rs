use tonic_build::manual::{Builder, Method, Service};

fn main() {
    let unary = |name: &str, route: &str, req: &str, rsp: &str| {
        Method::builder()
            .name(name)
            .route_name(route)
            .input_type(format!("crate::proto::{req}"))
            .output_type(format!("crate::proto::{rsp}"))
            .codec_path("tonic::codec::ProstCodec")
            .build()
    };

    let ipam = Service::builder()
        .name("Ipam")
        .package("ipam")
        .method(unary("map_endpoint_ip", "MapEndpointIP", "MapRequest", "MapResponse"))
        .method(unary("unmap_endpoint_ip", "UnmapEndpointIP", "UnmapRequest", "UnmapResponse"))
        .method(unary(
            "get_home_pod_ip",
            "GetHomePodIP",
            "GetHomePodIpRequest",
            "GetHomePodIpResponse",
        ))
        .method(unary(
            "belongs_to_pod_cidr",
            "BelongsToPodCIDR",
            "BelongsRequest",
            "BelongsResponse",
        ))
        .method(unary(
            "get_or_set_external_cidr",
            "GetOrSetExternalCIDR",
            "ExternalCidrRequest",
            "ExternalCidrResponse",
        ))
        .method(unary(
            "get_subnets_per_cluster",
            "GetSubnetsPerCluster",
            "SubnetsRequest",
            "SubnetsResponse",
        ))
        .method(unary(
            "add_local_subnets_per_cluster",
            "AddLocalSubnetsPerCluster",
            "SubnetsRequest",
            "AddLocalSubnetsResponse",
        ))
        .method(unary(
            "remove_cluster_config",
            "RemoveClusterConfig",
            "RemoveClusterConfigRequest",
            "RemoveClusterConfigResponse",
        ))
        .build();

    Builder::new().build_client(false).compile(&[ipam]);
}
