use crate::{
    metrics::{GrpcServerMetricsFamily, GrpcServerRPCMetrics, ResponseObserver},
    proto::{
        self,
        ipam_server::{Ipam as IpamApi, IpamServer},
    },
};
use linkerd_ipam_controller_core::{Error, ErrorKind, IpNet, Ipam};
use std::{net::IpAddr, sync::Arc};
use tracing::{debug, warn};

const SERVICE: &str = "ipam.Ipam";

/// The engine operations exposed over gRPC.
#[async_trait::async_trait]
pub trait IpamService: Send + Sync + 'static {
    async fn map_endpoint_ip(&self, cluster_id: &str, ip: &str) -> Result<IpAddr, Error>;

    async fn unmap_endpoint_ip(&self, cluster_id: &str, ip: &str) -> Result<(), Error>;

    fn get_home_pod_ip(&self, cluster_id: &str, ip: &str) -> Result<IpAddr, Error>;

    fn belongs_to_pod_cidr(&self, ip: &str) -> Result<bool, Error>;

    async fn get_or_set_external_cidr(&self, mask: u8) -> Result<IpNet, Error>;

    async fn get_subnets_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(IpNet, IpNet), Error>;

    async fn add_local_subnets_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(), Error>;

    async fn remove_cluster_config(&self, cluster_id: &str) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub struct IpamGrpcServer<T> {
    ipam: T,
    metrics: Metrics,
}

#[derive(Clone, Debug)]
struct Metrics {
    map_endpoint_ip: GrpcServerRPCMetrics,
    unmap_endpoint_ip: GrpcServerRPCMetrics,
    get_home_pod_ip: GrpcServerRPCMetrics,
    belongs_to_pod_cidr: GrpcServerRPCMetrics,
    get_or_set_external_cidr: GrpcServerRPCMetrics,
    get_subnets_per_cluster: GrpcServerRPCMetrics,
    add_local_subnets_per_cluster: GrpcServerRPCMetrics,
    remove_cluster_config: GrpcServerRPCMetrics,
}

// === impl IpamService ===

#[async_trait::async_trait]
impl IpamService for Ipam {
    async fn map_endpoint_ip(&self, cluster_id: &str, ip: &str) -> Result<IpAddr, Error> {
        Ipam::map_endpoint_ip(self, cluster_id, ip).await
    }

    async fn unmap_endpoint_ip(&self, cluster_id: &str, ip: &str) -> Result<(), Error> {
        Ipam::unmap_endpoint_ip(self, cluster_id, ip).await
    }

    fn get_home_pod_ip(&self, cluster_id: &str, ip: &str) -> Result<IpAddr, Error> {
        Ipam::get_home_pod_ip(self, cluster_id, ip)
    }

    fn belongs_to_pod_cidr(&self, ip: &str) -> Result<bool, Error> {
        Ipam::belongs_to_pod_cidr(self, ip)
    }

    async fn get_or_set_external_cidr(&self, mask: u8) -> Result<IpNet, Error> {
        Ipam::get_external_cidr(self, mask).await
    }

    async fn get_subnets_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(IpNet, IpNet), Error> {
        Ipam::get_subnets_per_cluster(self, pod_cidr, external_cidr, cluster_id).await
    }

    async fn add_local_subnets_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(), Error> {
        Ipam::add_local_subnets_per_cluster(self, pod_cidr, external_cidr, cluster_id).await
    }

    async fn remove_cluster_config(&self, cluster_id: &str) -> Result<(), Error> {
        Ipam::remove_cluster_config(self, cluster_id).await
    }
}

#[async_trait::async_trait]
impl<T: IpamService + ?Sized> IpamService for Arc<T> {
    async fn map_endpoint_ip(&self, cluster_id: &str, ip: &str) -> Result<IpAddr, Error> {
        (**self).map_endpoint_ip(cluster_id, ip).await
    }

    async fn unmap_endpoint_ip(&self, cluster_id: &str, ip: &str) -> Result<(), Error> {
        (**self).unmap_endpoint_ip(cluster_id, ip).await
    }

    fn get_home_pod_ip(&self, cluster_id: &str, ip: &str) -> Result<IpAddr, Error> {
        (**self).get_home_pod_ip(cluster_id, ip)
    }

    fn belongs_to_pod_cidr(&self, ip: &str) -> Result<bool, Error> {
        (**self).belongs_to_pod_cidr(ip)
    }

    async fn get_or_set_external_cidr(&self, mask: u8) -> Result<IpNet, Error> {
        (**self).get_or_set_external_cidr(mask).await
    }

    async fn get_subnets_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(IpNet, IpNet), Error> {
        (**self)
            .get_subnets_per_cluster(pod_cidr, external_cidr, cluster_id)
            .await
    }

    async fn add_local_subnets_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(), Error> {
        (**self)
            .add_local_subnets_per_cluster(pod_cidr, external_cidr, cluster_id)
            .await
    }

    async fn remove_cluster_config(&self, cluster_id: &str) -> Result<(), Error> {
        (**self).remove_cluster_config(cluster_id).await
    }
}

// === impl IpamGrpcServer ===

impl<T> IpamGrpcServer<T>
where
    T: IpamService,
{
    pub fn new(ipam: T, metrics: GrpcServerMetricsFamily) -> Self {
        let rpc = |method| metrics.unary_rpc(SERVICE, method);
        Self {
            ipam,
            metrics: Metrics {
                map_endpoint_ip: rpc("MapEndpointIP"),
                unmap_endpoint_ip: rpc("UnmapEndpointIP"),
                get_home_pod_ip: rpc("GetHomePodIP"),
                belongs_to_pod_cidr: rpc("BelongsToPodCIDR"),
                get_or_set_external_cidr: rpc("GetOrSetExternalCIDR"),
                get_subnets_per_cluster: rpc("GetSubnetsPerCluster"),
                add_local_subnets_per_cluster: rpc("AddLocalSubnetsPerCluster"),
                remove_cluster_config: rpc("RemoveClusterConfig"),
            },
        }
    }

    pub fn svc(self) -> IpamServer<Self> {
        IpamServer::new(self)
    }
}

#[async_trait::async_trait]
impl<T> IpamApi for IpamGrpcServer<T>
where
    T: IpamService,
{
    async fn map_endpoint_ip(
        &self,
        req: tonic::Request<proto::MapRequest>,
    ) -> Result<tonic::Response<proto::MapResponse>, tonic::Status> {
        let observer = self.metrics.map_endpoint_ip.start();
        let proto::MapRequest { cluster_id, ip } = req.into_inner();
        let res = self.ipam.map_endpoint_ip(&cluster_id, &ip).await;
        respond(observer, res.map(|ip| proto::MapResponse { ip: ip.to_string() }))
    }

    async fn unmap_endpoint_ip(
        &self,
        req: tonic::Request<proto::UnmapRequest>,
    ) -> Result<tonic::Response<proto::UnmapResponse>, tonic::Status> {
        let observer = self.metrics.unmap_endpoint_ip.start();
        let proto::UnmapRequest { cluster_id, ip } = req.into_inner();
        let res = self.ipam.unmap_endpoint_ip(&cluster_id, &ip).await;
        respond(observer, res.map(|()| proto::UnmapResponse {}))
    }

    async fn get_home_pod_ip(
        &self,
        req: tonic::Request<proto::GetHomePodIpRequest>,
    ) -> Result<tonic::Response<proto::GetHomePodIpResponse>, tonic::Status> {
        let observer = self.metrics.get_home_pod_ip.start();
        let proto::GetHomePodIpRequest { cluster_id, ip } = req.into_inner();
        let res = self.ipam.get_home_pod_ip(&cluster_id, &ip);
        respond(
            observer,
            res.map(|ip| proto::GetHomePodIpResponse {
                home_ip: ip.to_string(),
            }),
        )
    }

    async fn belongs_to_pod_cidr(
        &self,
        req: tonic::Request<proto::BelongsRequest>,
    ) -> Result<tonic::Response<proto::BelongsResponse>, tonic::Status> {
        let observer = self.metrics.belongs_to_pod_cidr.start();
        let res = self.ipam.belongs_to_pod_cidr(&req.into_inner().ip);
        respond(observer, res.map(|belongs| proto::BelongsResponse { belongs }))
    }

    async fn get_or_set_external_cidr(
        &self,
        req: tonic::Request<proto::ExternalCidrRequest>,
    ) -> Result<tonic::Response<proto::ExternalCidrResponse>, tonic::Status> {
        let observer = self.metrics.get_or_set_external_cidr.start();
        let proto::ExternalCidrRequest { mask } = req.into_inner();
        let Ok(mask) = u8::try_from(mask) else {
            let status = tonic::Status::invalid_argument(format!("Invalid mask length: {mask}"));
            observer.end(status.code());
            return Err(status);
        };
        let res = self.ipam.get_or_set_external_cidr(mask).await;
        respond(
            observer,
            res.map(|net| proto::ExternalCidrResponse {
                external_cidr: net.to_string(),
            }),
        )
    }

    async fn get_subnets_per_cluster(
        &self,
        req: tonic::Request<proto::SubnetsRequest>,
    ) -> Result<tonic::Response<proto::SubnetsResponse>, tonic::Status> {
        let observer = self.metrics.get_subnets_per_cluster.start();
        let proto::SubnetsRequest {
            cluster_id,
            pod_cidr,
            external_cidr,
        } = req.into_inner();
        let res = self
            .ipam
            .get_subnets_per_cluster(&pod_cidr, &external_cidr, &cluster_id)
            .await;
        respond(
            observer,
            res.map(|(pod, external)| proto::SubnetsResponse {
                pod_cidr: pod.to_string(),
                external_cidr: external.to_string(),
            }),
        )
    }

    async fn add_local_subnets_per_cluster(
        &self,
        req: tonic::Request<proto::SubnetsRequest>,
    ) -> Result<tonic::Response<proto::AddLocalSubnetsResponse>, tonic::Status> {
        let observer = self.metrics.add_local_subnets_per_cluster.start();
        let proto::SubnetsRequest {
            cluster_id,
            pod_cidr,
            external_cidr,
        } = req.into_inner();
        let res = self
            .ipam
            .add_local_subnets_per_cluster(&pod_cidr, &external_cidr, &cluster_id)
            .await;
        respond(observer, res.map(|()| proto::AddLocalSubnetsResponse {}))
    }

    async fn remove_cluster_config(
        &self,
        req: tonic::Request<proto::RemoveClusterConfigRequest>,
    ) -> Result<tonic::Response<proto::RemoveClusterConfigResponse>, tonic::Status> {
        let observer = self.metrics.remove_cluster_config.start();
        let res = self
            .ipam
            .remove_cluster_config(&req.into_inner().cluster_id)
            .await;
        respond(observer, res.map(|()| proto::RemoveClusterConfigResponse {}))
    }
}

fn respond<T>(
    observer: ResponseObserver,
    res: Result<T, Error>,
) -> Result<tonic::Response<T>, tonic::Status> {
    match res {
        Ok(rsp) => {
            observer.end(tonic::Code::Ok);
            Ok(tonic::Response::new(rsp))
        }
        Err(error) => {
            let status = to_status(error);
            observer.end(status.code());
            Err(status)
        }
    }
}

fn to_status(error: Error) -> tonic::Status {
    let kind = error.kind();
    match kind {
        ErrorKind::Storage | ErrorKind::Internal => warn!(%error, "IPAM request failed"),
        _ => debug!(%error, ?kind, "IPAM request rejected"),
    }
    let msg = error.to_string();
    match kind {
        ErrorKind::Invalid => tonic::Status::invalid_argument(msg),
        ErrorKind::Overlap => tonic::Status::already_exists(msg),
        ErrorKind::Exhausted => tonic::Status::resource_exhausted(msg),
        ErrorKind::MissingInit => tonic::Status::failed_precondition(msg),
        ErrorKind::Unavailable => tonic::Status::unavailable(msg),
        ErrorKind::Storage | ErrorKind::Internal => tonic::Status::internal(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_ipam_controller_core::{k8s::NONE, Config, MemoryNatMappings, MemoryStorage};
    use pretty_assertions::assert_eq;
    use prometheus_client::registry::Registry;

    type Server = IpamGrpcServer<Arc<Ipam>>;

    async fn server() -> (Server, Arc<Ipam>) {
        let ipam = Ipam::init(
            Arc::new(MemoryStorage::default()),
            Arc::new(MemoryNatMappings::default()),
            Config::default(),
        )
        .await
        .expect("IPAM must initialize");
        let ipam = Arc::new(ipam);
        ipam.set_pod_cidr("10.0.0.0/24").await.unwrap();

        let metrics = GrpcServerMetricsFamily::register(&mut Registry::default());
        (IpamGrpcServer::new(ipam.clone(), metrics), ipam)
    }

    async fn peer(srv: &Server, cluster_id: &str) -> proto::SubnetsResponse {
        let subnets = srv
            .get_subnets_per_cluster(tonic::Request::new(proto::SubnetsRequest {
                cluster_id: cluster_id.to_string(),
                pod_cidr: "10.50.0.0/16".to_string(),
                external_cidr: "10.60.0.0/16".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        srv.add_local_subnets_per_cluster(tonic::Request::new(proto::SubnetsRequest {
            cluster_id: cluster_id.to_string(),
            pod_cidr: NONE.to_string(),
            external_cidr: NONE.to_string(),
        }))
        .await
        .unwrap();
        subnets
    }

    async fn map(srv: &Server, cluster_id: &str, ip: &str) -> Result<String, tonic::Status> {
        srv.map_endpoint_ip(tonic::Request::new(proto::MapRequest {
            cluster_id: cluster_id.to_string(),
            ip: ip.to_string(),
        }))
        .await
        .map(|rsp| rsp.into_inner().ip)
    }

    #[tokio::test]
    async fn serves_peering_lifecycle() {
        let (srv, _ipam) = server().await;

        let external = srv
            .get_or_set_external_cidr(tonic::Request::new(proto::ExternalCidrRequest { mask: 24 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(external.external_cidr, "10.0.1.0/24");

        let c1 = peer(&srv, "c1").await;
        assert_eq!(
            (c1.pod_cidr.as_str(), c1.external_cidr.as_str()),
            ("10.50.0.0/16", "10.60.0.0/16")
        );
        let c2 = peer(&srv, "c2").await;
        assert_eq!(
            (c2.pod_cidr.as_str(), c2.external_cidr.as_str()),
            ("10.1.0.0/16", "10.2.0.0/16")
        );

        assert_eq!(map(&srv, "c1", "10.200.0.1").await.unwrap(), "10.0.1.1");
        assert_eq!(map(&srv, "c1", "10.0.0.5").await.unwrap(), "10.0.0.5");

        let home = srv
            .get_home_pod_ip(tonic::Request::new(proto::GetHomePodIpRequest {
                cluster_id: "c2".to_string(),
                ip: "10.50.3.4".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(home.home_ip, "10.1.3.4");

        for (ip, belongs) in [("10.0.0.7", true), ("10.0.1.1", false)] {
            let rsp = srv
                .belongs_to_pod_cidr(tonic::Request::new(proto::BelongsRequest {
                    ip: ip.to_string(),
                }))
                .await
                .unwrap()
                .into_inner();
            assert_eq!(rsp.belongs, belongs, "{ip}");
        }

        srv.unmap_endpoint_ip(tonic::Request::new(proto::UnmapRequest {
            cluster_id: "c1".to_string(),
            ip: "10.200.0.1".to_string(),
        }))
        .await
        .unwrap();

        srv.remove_cluster_config(tonic::Request::new(proto::RemoveClusterConfigRequest {
            cluster_id: "c1".to_string(),
        }))
        .await
        .unwrap();
        assert_eq!(
            map(&srv, "c1", "10.200.0.1").await.unwrap_err().code(),
            tonic::Code::FailedPrecondition
        );
    }

    #[tokio::test]
    async fn rejects_malformed_requests() {
        let (srv, _ipam) = server().await;

        for (cluster_id, ip) in [("c1", "10.200.0"), ("", "10.200.0.1"), ("c1", "")] {
            assert_eq!(
                map(&srv, cluster_id, ip).await.unwrap_err().code(),
                tonic::Code::InvalidArgument,
                "{cluster_id:?} {ip:?}"
            );
        }

        for mask in [0, 300] {
            let status = srv
                .get_or_set_external_cidr(tonic::Request::new(proto::ExternalCidrRequest { mask }))
                .await
                .unwrap_err();
            assert_eq!(status.code(), tonic::Code::InvalidArgument, "/{mask}");
        }

        let status = srv
            .get_subnets_per_cluster(tonic::Request::new(proto::SubnetsRequest {
                cluster_id: "c2".to_string(),
                pod_cidr: "10.50.0.1/16".to_string(),
                external_cidr: "10.60.0.0/16".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn requires_initialization() {
        let (srv, _ipam) = server().await;

        // No subnets have been requested for the cluster.
        let status = srv
            .add_local_subnets_per_cluster(tonic::Request::new(proto::SubnetsRequest {
                cluster_id: "c1".to_string(),
                pod_cidr: NONE.to_string(),
                external_cidr: NONE.to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        assert_eq!(
            map(&srv, "c1", "10.200.0.1").await.unwrap_err().code(),
            tonic::Code::FailedPrecondition
        );
    }

    #[tokio::test]
    async fn closed_engine_is_unavailable() {
        let (srv, ipam) = server().await;
        ipam.close().await;
        let status = srv
            .belongs_to_pod_cidr(tonic::Request::new(proto::BelongsRequest {
                ip: "10.0.0.1".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn maps_error_kinds_to_codes() {
        let net = |s: &str| s.parse::<IpNet>().unwrap();
        for (error, code) in [
            (Error::Invalid("bad".into()), tonic::Code::InvalidArgument),
            (
                Error::Overlap {
                    network: net("10.0.0.0/16"),
                    owner: "pool".into(),
                    conflict: net("10.0.0.0/8"),
                },
                tonic::Code::AlreadyExists,
            ),
            (Error::Exhausted(16), tonic::Code::ResourceExhausted),
            (
                Error::MissingInit("ExternalCIDR".into()),
                tonic::Code::FailedPrecondition,
            ),
            (Error::Closed, tonic::Code::Unavailable),
            (
                Error::Exhausted(24).context("cluster c1: failed to map PodCIDR"),
                tonic::Code::ResourceExhausted,
            ),
        ] {
            assert_eq!(to_status(error).code(), code);
        }
    }
}
