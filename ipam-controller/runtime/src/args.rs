use crate::{
    core::{self, IpNet, Ipam, MemoryNatMappings, MemoryStorage, NatMappingStorage, Storage},
    grpc, store,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tonic::transport::Server;
use tracing::{info, instrument, warn};

#[derive(Debug, Parser)]
#[clap(name = "ipam", about = "Multicluster IP address manager")]
pub struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_IPAM_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:6000")]
    grpc_addr: SocketAddr,

    /// The namespace holding the IPAM storage and the NAT mappings.
    #[clap(
        long,
        default_value = "linkerd-multicluster",
        env = "LINKERD_IPAM_NAMESPACE"
    )]
    namespace: String,

    #[clap(long, default_value = "ipam")]
    ipam_storage_name: String,

    /// Networks from which conflicting remote networks are remapped.
    ///
    /// Only used when the storage holds no pools yet.
    #[clap(long, default_value = "10.0.0.0/8,192.168.0.0/16,172.16.0.0/12")]
    pools: IpNets,

    #[clap(long)]
    pod_cidr: Option<IpNet>,

    #[clap(long)]
    service_cidr: Option<IpNet>,

    /// Prefix length of the ExternalCIDR allocated when the pod CIDR is set.
    #[clap(long, default_value = "16")]
    external_cidr_mask: u8,

    /// Networks that must never be handed out.
    #[clap(long)]
    reserved_subnets: Option<IpNets>,

    /// An IP mapped for every remote cluster so that it can probe this cluster.
    #[clap(long)]
    liveness_ip: Option<IpAddr>,

    #[clap(long, default_value = "kubernetes")]
    storage: StorageKind,
}

/// Where the IPAM state is persisted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Custom resources in the controller's namespace.
    Kubernetes,

    /// Process memory. State is lost when the controller restarts.
    Memory,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            grpc_addr,
            namespace,
            ipam_storage_name,
            pools: IpNets(pools),
            pod_cidr,
            service_cidr,
            external_cidr_mask,
            reserved_subnets,
            liveness_ip,
            storage,
        } = self;

        let mut prom = <Registry>::default();
        let grpc_metrics = grpc::metrics::GrpcServerMetricsFamily::register(
            prom.sub_registry_with_prefix("grpc_server"),
        );
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let (storage, nat_storage): (Arc<dyn Storage>, Arc<dyn NatMappingStorage>) =
            match storage {
                StorageKind::Kubernetes => {
                    let storage =
                        store::KubeStorage::init(runtime.client(), &namespace, &ipam_storage_name)
                            .await?;
                    let nat = store::KubeNatMappings::new(runtime.client(), &namespace);
                    (Arc::new(storage), Arc::new(nat))
                }
                StorageKind::Memory => {
                    warn!("IPAM state is kept in memory and will not survive restarts");
                    (
                        Arc::new(MemoryStorage::default()),
                        Arc::new(MemoryNatMappings::default()),
                    )
                }
            };

        let config = core::Config { pools, liveness_ip };
        let ipam = Arc::new(Ipam::init(storage, nat_storage, config).await?);

        if let Some(net) = service_cidr {
            ipam.set_service_cidr(&net.to_string()).await?;
        }
        if let Some(net) = pod_cidr {
            ipam.set_pod_cidr(&net.to_string()).await?;
            let external = ipam.get_external_cidr(external_cidr_mask).await?;
            info!(pod_cidr = %net, %external, "Local networks set");
        }
        if let Some(IpNets(nets)) = reserved_subnets {
            let nets = nets.iter().map(ToString::to_string).collect::<Vec<_>>();
            ipam.set_reserved_subnets(&nets).await?;
        }

        // Run the gRPC server, serving requests against the engine.
        tokio::spawn(grpc(
            grpc_addr,
            ipam.clone(),
            grpc_metrics,
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for the gRPC server to
        // drain before closing the engine.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        ipam.close().await;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct IpNets(Vec<IpNet>);

impl std::str::FromStr for IpNets {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| n.parse().map_err(Into::into))
            .collect::<Result<Vec<IpNet>>>()
            .map(Self)
    }
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kubernetes" => Ok(Self::Kubernetes),
            "memory" => Ok(Self::Memory),
            _ => bail!("invalid storage: {s}; expected 'kubernetes' or 'memory'"),
        }
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(
    addr: SocketAddr,
    ipam: Arc<Ipam>,
    metrics: grpc::metrics::GrpcServerMetricsFamily,
    drain: drain::Watch,
) -> Result<()> {
    let svc = grpc::IpamGrpcServer::new(ipam, metrics).svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder().add_service(svc).serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "IPAM gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["ipam"]).unwrap();
        assert_eq!(args.grpc_addr, "0.0.0.0:6000".parse().unwrap());
        assert_eq!(args.ipam_storage_name, "ipam");
        assert_eq!(args.external_cidr_mask, 16);
        assert_eq!(args.storage, StorageKind::Kubernetes);
        assert_eq!(args.pools.0, core::Config::default().pools);
        assert!(args.pod_cidr.is_none());
        assert!(args.reserved_subnets.is_none());
    }

    #[test]
    fn parses_networks() {
        let args = Args::try_parse_from([
            "ipam",
            "--pod-cidr=10.244.0.0/16",
            "--reserved-subnets=10.100.0.0/16, 10.101.0.0/16",
            "--liveness-ip=10.0.0.1",
            "--storage=memory",
        ])
        .unwrap();
        assert_eq!(args.pod_cidr, Some("10.244.0.0/16".parse().unwrap()));
        assert_eq!(
            args.reserved_subnets.unwrap().0,
            vec![
                "10.100.0.0/16".parse::<IpNet>().unwrap(),
                "10.101.0.0/16".parse().unwrap()
            ]
        );
        assert_eq!(args.liveness_ip, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(args.storage, StorageKind::Memory);

        assert!("10.0.0.0/8,bogus".parse::<IpNets>().is_err());
        assert_eq!(
            "10.0.0.0/8, ,192.168.0.0/16,".parse::<IpNets>().unwrap().0,
            vec![
                "10.0.0.0/8".parse::<IpNet>().unwrap(),
                "192.168.0.0/16".parse().unwrap()
            ]
        );
        assert!("etcd".parse::<StorageKind>().is_err());
    }
}
