use crate::{
    cidr,
    k8s::{ConfiguredCluster, IpamStorageSpec, Mappings, Subnets, NONE},
    nat::{NatMappingInflater, NatMappingStorage},
    store::{Patch, Storage},
    Error,
};
use ipnet::IpNet;
use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

mod endpoints;
mod networks;


/// Pools registered when none are configured.
pub const DEFAULT_POOLS: [&str; 3] = ["10.0.0.0/8", "192.168.0.0/16", "172.16.0.0/12"];

#[derive(Clone, Debug)]
pub struct Config {
    /// Pools registered when the document has none. These cannot be removed at runtime.
    pub pools: Vec<IpNet>,

    /// An IP mapped for every remote cluster when its local subnets are set, so that the cluster
    /// can probe the tunnel endpoint.
    pub liveness_ip: Option<IpAddr>,
}

/// The IPAM engine.
///
/// Every mutation runs under a single lock, works on a copy of the stored document and persists
/// its changes with a single patch. An operation that fails leaves the stored document untouched.
pub struct Ipam {
    storage: Arc<dyn Storage>,
    nat: NatMappingInflater,
    config: Config,
    lock: Mutex<()>,
    closed: AtomicBool,
}

/// A mutable copy of the document along with the state it was copied from.
struct Txn {
    before: IpamStorageSpec,
    doc: IpamStorageSpec,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            pools: DEFAULT_POOLS.iter().filter_map(|p| p.parse().ok()).collect(),
            liveness_ip: None,
        }
    }
}

// === impl Txn ===

impl Txn {
    fn new(storage: &dyn Storage) -> Self {
        let before = IpamStorageSpec::clone(&storage.document());
        Self {
            doc: before.clone(),
            before,
        }
    }
}

// === impl Ipam ===

impl Ipam {
    /// Builds the engine over the given stores.
    ///
    /// Pools are registered if the document has none, and the NAT ledgers of every cluster whose
    /// NAT mappings were configured are recovered.
    pub async fn init(
        storage: Arc<dyn Storage>,
        nat_storage: Arc<dyn NatMappingStorage>,
        config: Config,
    ) -> Result<Self, Error> {
        let ipam = Self {
            nat: NatMappingInflater::new(nat_storage),
            storage,
            config,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        let mut txn = Txn::new(&*ipam.storage);
        if txn.doc.pools.is_empty() {
            for pool in &ipam.config.pools {
                networks::pool_set(&txn.doc)?.check(pool).map_err(|error| {
                    Error::invalid(format!("configured pools overlap: {error}"))
                })?;
                let mut alloc = networks::allocator(&mut txn.doc);
                if alloc.prefix_from(*pool)?.is_none() {
                    alloc.new_prefix(*pool)?;
                }
                txn.doc.pools.push(pool.to_string());
                info!(%pool, "Registered pool");
            }
        }
        ipam.commit(&txn).await?;

        for cluster_id in txn.doc.nat_mappings_configured.keys() {
            if !ipam.nat.recover(cluster_id).await? {
                warn!(%cluster_id, "NAT mappings are configured but not stored");
            }
        }

        Ok(ipam)
    }

    /// Stops accepting operations once in-flight operations complete.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.lock.lock().await;
        info!("IPAM closed");
    }

    // === Cluster subnets ===

    /// Returns the networks this cluster uses to reach the remote cluster's pods and external
    /// endpoints, allocating them on first use.
    pub async fn get_subnets_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(IpNet, IpNet), Error> {
        validate_cluster_id(cluster_id)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        if let Some(subnets) = txn.doc.cluster_subnets.get(cluster_id) {
            if !subnets.remote_pod_cidr.is_empty() && !subnets.remote_external_cidr.is_empty() {
                debug!(%cluster_id, "Cluster subnets already set");
                return Ok((
                    cidr::parse_net(&subnets.remote_pod_cidr)?,
                    cidr::parse_net(&subnets.remote_external_cidr)?,
                ));
            }
        }

        let pod = cidr::parse_net(pod_cidr)?;
        let external = cidr::parse_net(external_cidr)?;
        let ctx =
            |what: &str, net: IpNet| format!("cluster {cluster_id}: failed to map {what} {net}");
        let mapped_pod = networks::get_or_remap_network(&mut txn.doc, pod)
            .map_err(|error| error.context(ctx("PodCIDR", pod)))?;
        // A failure here discards the pod allocation along with the copy of the document.
        let mapped_external = networks::get_or_remap_network(&mut txn.doc, external)
            .map_err(|error| error.context(ctx("ExternalCIDR", external)))?;

        let subnets = txn
            .doc
            .cluster_subnets
            .entry(cluster_id.to_string())
            .or_default();
        subnets.remote_pod_cidr = mapped_pod.to_string();
        subnets.remote_external_cidr = mapped_external.to_string();
        self.commit(&txn).await?;

        info!(
            %cluster_id,
            %pod_cidr,
            %mapped_pod,
            %external_cidr,
            %mapped_external,
            "Set cluster subnets"
        );
        Ok((mapped_pod, mapped_external))
    }

    /// Records the networks the remote cluster uses to reach this cluster and initializes the
    /// cluster's NAT mappings. `"None"` means the remote cluster did not remap the network.
    pub async fn add_local_subnets_per_cluster(
        &self,
        pod_cidr: &str,
        external_cidr: &str,
        cluster_id: &str,
    ) -> Result<(), Error> {
        validate_cluster_id(cluster_id)?;
        for net in [pod_cidr, external_cidr] {
            if net != NONE {
                cidr::parse_net(net)?;
            }
        }
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        let subnets = endpoints::cluster_subnets(&txn.doc, cluster_id)?;
        if subnets.remote_pod_cidr.is_empty() {
            return Err(Error::missing_init(format!(
                "subnets for cluster {cluster_id}"
            )));
        }
        let already_set =
            !subnets.local_nat_pod_cidr.is_empty() && !subnets.local_nat_external_cidr.is_empty();
        // Once set, the stored networks win over the requested ones.
        let (pod_cidr, external_cidr) = if already_set {
            if subnets.local_nat_pod_cidr != pod_cidr
                || subnets.local_nat_external_cidr != external_cidr
            {
                debug!(
                    %cluster_id,
                    %pod_cidr,
                    %external_cidr,
                    stored_pod_cidr = %subnets.local_nat_pod_cidr,
                    stored_external_cidr = %subnets.local_nat_external_cidr,
                    "Local subnets already set to different networks"
                );
            }
            (
                subnets.local_nat_pod_cidr.clone(),
                subnets.local_nat_external_cidr.clone(),
            )
        } else {
            (pod_cidr.to_string(), external_cidr.to_string())
        };
        let (pod_cidr, external_cidr) = (pod_cidr.as_str(), external_cidr.as_str());
        if already_set
            && txn.doc.nat_mappings_configured.contains_key(cluster_id)
            && self.nat.is_initialized(cluster_id)
        {
            debug!(%cluster_id, "Local subnets already set");
            return Ok(());
        }

        // The ledger records the networks the remote cluster sees.
        let ledger_pod = match pod_cidr {
            NONE => endpoints::pod_cidr(&txn.doc)?.to_string(),
            net => net.to_string(),
        };
        let ledger_external = match external_cidr {
            NONE => endpoints::external_cidr(&txn.doc)?.to_string(),
            net => net.to_string(),
        };

        if let Some(subnets) = txn.doc.cluster_subnets.get_mut(cluster_id) {
            subnets.local_nat_pod_cidr = pod_cidr.to_string();
            subnets.local_nat_external_cidr = external_cidr.to_string();
        }
        txn.doc
            .nat_mappings_configured
            .insert(cluster_id.to_string(), ConfiguredCluster {});
        let liveness = match self.config.liveness_ip {
            Some(ip) => {
                let natted = endpoints::map_to_external_cidr(&mut txn.doc, cluster_id, ip)
                    .map_err(|error| {
                        error.context(format!(
                            "cluster {cluster_id}: failed to map liveness IP {ip}"
                        ))
                    })?;
                Some((ip, natted))
            }
            None => None,
        };
        self.commit(&txn).await?;

        let res = async {
            self.nat
                .init_nat_mappings_per_cluster(&ledger_pod, &ledger_external, cluster_id)
                .await?;
            if let Some((ip, natted)) = liveness {
                self.nat
                    .add_mapping(&ip.to_string(), &natted.to_string(), cluster_id)
                    .await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(error) = res {
            self.revert(&txn).await;
            return Err(error.context(format!("cluster {cluster_id}")));
        }

        info!(%cluster_id, %pod_cidr, %external_cidr, "Set local subnets");
        Ok(())
    }

    /// Releases everything held for a remote cluster.
    pub async fn remove_cluster_config(&self, cluster_id: &str) -> Result<(), Error> {
        validate_cluster_id(cluster_id)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        Self::free_remote(&mut txn.doc, cluster_id)?;
        Self::clear_local(&mut txn.doc, cluster_id)?;
        self.commit(&txn).await?;
        self.nat
            .terminate_nat_mappings_per_cluster(cluster_id)
            .await?;

        info!(%cluster_id, "Removed cluster configuration");
        Ok(())
    }

    /// Releases the networks granted to a remote cluster.
    pub async fn free_subnets_per_cluster(&self, cluster_id: &str) -> Result<(), Error> {
        validate_cluster_id(cluster_id)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);
        Self::free_remote(&mut txn.doc, cluster_id)?;
        self.commit(&txn).await
    }

    /// Forgets how the remote cluster reaches this cluster and terminates its NAT mappings.
    pub async fn remove_local_subnets_per_cluster(&self, cluster_id: &str) -> Result<(), Error> {
        validate_cluster_id(cluster_id)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);
        Self::clear_local(&mut txn.doc, cluster_id)?;
        self.commit(&txn).await?;
        self.nat
            .terminate_nat_mappings_per_cluster(cluster_id)
            .await
    }

    pub fn get_cluster_subnets(&self, cluster_id: &str) -> Option<Subnets> {
        self.storage.cluster_subnets().remove(cluster_id)
    }

    fn free_remote(doc: &mut IpamStorageSpec, cluster_id: &str) -> Result<(), Error> {
        let Some(subnets) = doc.cluster_subnets.get(cluster_id).cloned() else {
            debug!(%cluster_id, "No cluster subnets to free");
            return Ok(());
        };
        for net in [&subnets.remote_pod_cidr, &subnets.remote_external_cidr] {
            if !net.is_empty() {
                networks::free_network(doc, cidr::parse_net(net)?).map_err(|error| {
                    error.context(format!("cluster {cluster_id}: failed to free {net}"))
                })?;
            }
        }
        Self::update_subnets(doc, cluster_id, |s| {
            s.remote_pod_cidr.clear();
            s.remote_external_cidr.clear();
        });
        Ok(())
    }

    fn clear_local(doc: &mut IpamStorageSpec, cluster_id: &str) -> Result<(), Error> {
        let unmapped = endpoints::unmap_cluster(doc, cluster_id)?;
        if !unmapped.is_empty() {
            debug!(%cluster_id, endpoints = unmapped.len(), "Unmapped endpoints");
        }
        doc.nat_mappings_configured.remove(cluster_id);
        Self::update_subnets(doc, cluster_id, |s| {
            s.local_nat_pod_cidr.clear();
            s.local_nat_external_cidr.clear();
        });
        Ok(())
    }

    /// Updates a cluster's subnets, dropping the entry once it is empty.
    fn update_subnets(doc: &mut IpamStorageSpec, cluster_id: &str, f: impl FnOnce(&mut Subnets)) {
        if let Some(subnets) = doc.cluster_subnets.get_mut(cluster_id) {
            f(subnets);
            if subnets.is_empty() {
                doc.cluster_subnets.remove(cluster_id);
            }
        }
    }

    // === Reserved subnets ===

    /// Takes a network out of circulation.
    pub async fn acquire_reserved_subnet(&self, network: &str) -> Result<(), Error> {
        let net = cidr::parse_net(network)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);
        Self::reserve(&mut txn.doc, net)?;
        self.commit(&txn).await?;
        info!(%net, "Acquired reserved subnet");
        Ok(())
    }

    /// Puts a reserved network back into circulation. Networks that are not reserved are ignored.
    pub async fn free_reserved_subnet(&self, network: &str) -> Result<(), Error> {
        let net = cidr::parse_net(network)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);
        networks::free_network(&mut txn.doc, net)
            .map_err(|error| error.context(format!("failed to free reserved subnet {net}")))?;
        self.commit(&txn).await
    }

    /// Reserves a network unless it is already reserved.
    pub async fn mark_as_acquired_reserved_subnet(&self, network: &str) -> Result<(), Error> {
        let net = cidr::parse_net(network)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);
        Self::mark_as_acquired(&mut txn.doc, net)?;
        self.commit(&txn).await
    }

    /// Reconciles the reserved subnets with `desired`.
    ///
    /// Changes are persisted one subnet at a time: when a subnet fails, the subnets handled before
    /// it stay as they are and the ones after it are not handled.
    pub async fn set_reserved_subnets(&self, desired: &[String]) -> Result<(), Error> {
        let mut nets = Vec::with_capacity(desired.len());
        for net in desired {
            let net = cidr::parse_net(net)?;
            if !nets.contains(&net) {
                nets.push(net);
            }
        }
        let desired = nets;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        let current = txn
            .doc
            .reserved_subnets
            .iter()
            .map(|s| cidr::parse_net(s))
            .collect::<Result<Vec<_>, _>>()?;

        for net in current.iter().filter(|n| !desired.contains(n)) {
            networks::free_network(&mut txn.doc, *net)
                .map_err(|error| error.context(format!("failed to free reserved subnet {net}")))?;
            txn.doc.reserved_subnets.retain(|s| *s != net.to_string());
            self.commit(&txn).await?;
            txn = Txn::new(&*self.storage);
            info!(%net, "Freed reserved subnet");
        }

        for net in current.iter().filter(|n| desired.contains(n)) {
            Self::mark_as_acquired(&mut txn.doc, *net)?;
        }
        self.commit(&txn).await?;
        txn = Txn::new(&*self.storage);

        for net in desired.iter().filter(|n| !current.contains(n)) {
            let mut known = networks::reserved_set(&txn.doc)?;
            known.extend(networks::cluster_set(&txn.doc)?);
            known.check(net)?;
            Self::reserve(&mut txn.doc, *net)?;
            txn.doc.reserved_subnets.push(net.to_string());
            self.commit(&txn).await?;
            txn = Txn::new(&*self.storage);
            info!(%net, "Reserved subnet");
        }
        Ok(())
    }

    pub fn get_reserved_subnets(&self) -> Vec<String> {
        self.storage.reserved_subnets()
    }

    fn reserve(doc: &mut IpamStorageSpec, net: IpNet) -> Result<(), Error> {
        networks::cluster_set(doc)?.check(&net)?;
        networks::reserve_network(doc, net)
            .map_err(|error| error.context(format!("failed to reserve {net}")))
    }

    fn mark_as_acquired(doc: &mut IpamStorageSpec, net: IpNet) -> Result<(), Error> {
        if networks::is_network_reserved(doc, net)? {
            debug!(%net, "Subnet already reserved");
            return Ok(());
        }
        Self::reserve(doc, net)
    }

    // === Pools ===

    pub async fn add_network_pool(&self, pool: &str) -> Result<(), Error> {
        let pool = cidr::parse_net(pool)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        let mut known = networks::pool_set(&txn.doc)?;
        known.extend(networks::cluster_set(&txn.doc)?);
        known.extend(networks::reserved_set(&txn.doc)?);
        known.check(&pool)?;
        networks::allocator(&mut txn.doc).new_prefix(pool)?;
        txn.doc.pools.push(pool.to_string());
        self.commit(&txn).await?;

        info!(%pool, "Added pool");
        Ok(())
    }

    /// Removes a pool that was added at runtime and from which nothing is allocated.
    pub async fn remove_network_pool(&self, pool: &str) -> Result<(), Error> {
        let pool = cidr::parse_net(pool)?;
        if self.config.pools.contains(&pool) {
            return Err(Error::invalid(format!("default pool {pool} cannot be removed")));
        }
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        let pool_str = pool.to_string();
        if !txn.doc.pools.contains(&pool_str) {
            return Err(Error::invalid(format!("{pool} is not a pool")));
        }
        if let Some((owner, net)) = networks::cluster_set(&txn.doc)?.find_overlap(&pool) {
            return Err(Error::Overlap {
                network: pool,
                owner: owner.to_string(),
                conflict: net,
            }
            .context(format!("pool {pool} is in use")));
        }
        networks::allocator(&mut txn.doc)
            .delete_prefix(pool)
            .map_err(|error| Error::from(error).context(format!("pool {pool} is in use")))?;
        txn.doc.pools.retain(|p| *p != pool_str);
        self.commit(&txn).await?;

        info!(%pool, "Removed pool");
        Ok(())
    }

    pub fn get_pools(&self) -> Vec<String> {
        self.storage.pools()
    }

    // === Local networks ===

    /// Sets the local PodCIDR once and reserves it.
    pub async fn set_pod_cidr(&self, pod_cidr: &str) -> Result<(), Error> {
        self.set_local_cidr(pod_cidr, "PodCIDR", |doc| &mut doc.pod_cidr)
            .await
    }

    /// Sets the local ServiceCIDR once and reserves it.
    pub async fn set_service_cidr(&self, service_cidr: &str) -> Result<(), Error> {
        self.set_local_cidr(service_cidr, "ServiceCIDR", |doc| &mut doc.service_cidr)
            .await
    }

    async fn set_local_cidr(
        &self,
        value: &str,
        what: &str,
        field: impl Fn(&mut IpamStorageSpec) -> &mut String,
    ) -> Result<(), Error> {
        let net = cidr::parse_net(value)?;
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        let current = field(&mut txn.doc).clone();
        if current == net.to_string() {
            debug!(%net, "{what} already set");
            return Ok(());
        }
        if !current.is_empty() {
            return Err(Error::invalid(format!(
                "{what} is already set to {current}"
            )));
        }

        Self::reserve(&mut txn.doc, net)?;
        *field(&mut txn.doc) = net.to_string();
        self.commit(&txn).await?;

        info!(%net, "Set {what}");
        Ok(())
    }

    /// Returns the local ExternalCIDR, allocating a network of length `mask` the first time.
    pub async fn get_external_cidr(&self, mask: u8) -> Result<IpNet, Error> {
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);
        if !txn.doc.external_cidr.is_empty() {
            return cidr::parse_net(&txn.doc.external_cidr);
        }
        if mask == 0 || mask > 128 {
            return Err(Error::invalid(format!("invalid mask length /{mask}")));
        }

        // The ExternalCIDR shares the PodCIDR's address family once that is known.
        let v6 = match txn.doc.pod_cidr.as_str() {
            "" => None,
            net => Some(cidr::parse_net(net)?.network().is_ipv6()),
        };
        let net = networks::acquire_from_pools(&mut txn.doc, mask, v6, None)
            .map_err(|error| error.context("failed to allocate the ExternalCIDR"))?;
        txn.doc.external_cidr = net.to_string();
        self.commit(&txn).await?;

        info!(%net, "Set ExternalCIDR");
        Ok(net)
    }

    pub fn get_external_cidr_if_set(&self) -> Result<Option<IpNet>, Error> {
        match self.storage.external_cidr().as_str() {
            "" => Ok(None),
            net => cidr::parse_net(net).map(Some),
        }
    }

    // === Endpoints ===

    /// Returns the IP that the remote cluster uses to reach a local endpoint.
    pub async fn map_endpoint_ip(&self, cluster_id: &str, ip: &str) -> Result<IpAddr, Error> {
        validate_cluster_id(cluster_id)?;
        let ip = cidr::parse_ip(ip)?;
        let ctx = |error: Error| error.context(format!("cluster {cluster_id}: failed to map {ip}"));
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        let subnets = endpoints::cluster_subnets(&txn.doc, cluster_id).map_err(ctx)?;
        if endpoints::pod_cidr(&txn.doc).map_err(ctx)?.contains(&ip) {
            return endpoints::project_pod_ip(subnets, ip).map_err(ctx);
        }

        self.nat.get_nat_mappings(cluster_id).map_err(ctx)?;
        let natted =
            endpoints::map_to_external_cidr(&mut txn.doc, cluster_id, ip).map_err(ctx)?;
        self.commit(&txn).await.map_err(ctx)?;

        if let Err(error) = self
            .nat
            .add_mapping(&ip.to_string(), &natted.to_string(), cluster_id)
            .await
        {
            self.revert(&txn).await;
            return Err(ctx(error));
        }
        Ok(natted)
    }

    /// Undoes [`Ipam::map_endpoint_ip`]. Endpoints that are not mapped are ignored.
    pub async fn unmap_endpoint_ip(&self, cluster_id: &str, ip: &str) -> Result<(), Error> {
        validate_cluster_id(cluster_id)?;
        let ip = cidr::parse_ip(ip)?.to_string();
        let ctx =
            |error: Error| error.context(format!("cluster {cluster_id}: failed to unmap {ip}"));
        let _guard = self.lock().await?;
        let mut txn = Txn::new(&*self.storage);

        if endpoints::unmap(&mut txn.doc, cluster_id, &ip).map_err(ctx)? {
            self.commit(&txn).await.map_err(ctx)?;
            debug!(%cluster_id, %ip, "Unmapped endpoint");
        }
        match self.nat.remove_mapping(&ip, cluster_id).await {
            Err(error) if !error.is_missing_init() => Err(ctx(error)),
            _ => Ok(()),
        }
    }

    /// Translates a pod IP of the remote cluster into the address this cluster uses to reach it.
    pub fn get_home_pod_ip(&self, cluster_id: &str, ip: &str) -> Result<IpAddr, Error> {
        validate_cluster_id(cluster_id)?;
        let ip = cidr::parse_ip(ip)?;
        self.ensure_open()?;
        let doc = self.storage.document();
        let subnets = endpoints::cluster_subnets(&doc, cluster_id)?;
        if subnets.remote_pod_cidr.is_empty() {
            return Err(Error::invalid(format!(
                "remote PodCIDR of cluster {cluster_id} is not set"
            )));
        }
        cidr::map_ip_to_network(ip, cidr::parse_net(&subnets.remote_pod_cidr)?)
    }

    pub fn belongs_to_pod_cidr(&self, ip: &str) -> Result<bool, Error> {
        let ip = cidr::parse_ip(ip)?;
        self.ensure_open()?;
        Ok(endpoints::pod_cidr(&self.storage.document())?.contains(&ip))
    }

    pub fn get_nat_mappings(&self, cluster_id: &str) -> Result<Mappings, Error> {
        self.nat.get_nat_mappings(cluster_id)
    }

    // === Internals ===

    async fn lock(&self) -> Result<MutexGuard<'_, ()>, Error> {
        self.ensure_open()?;
        let guard = self.lock.lock().await;
        self.ensure_open()?;
        Ok(guard)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Persists the changes made in a transaction, if any.
    async fn commit(&self, txn: &Txn) -> Result<(), Error> {
        let patch = Patch::between(&txn.before, &txn.doc)?;
        if patch.is_empty() {
            return Ok(());
        }
        self.storage.apply(patch).await?;
        Ok(())
    }

    /// Undoes a committed transaction after a later step failed.
    async fn revert(&self, txn: &Txn) {
        let res = async {
            let patch = Patch::between(&txn.doc, &txn.before)?;
            if !patch.is_empty() {
                self.storage.apply(patch).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        if let Err(error) = res {
            warn!(%error, "Failed to revert IPAM document");
        }
    }
}

fn validate_cluster_id(cluster_id: &str) -> Result<(), Error> {
    if cluster_id.is_empty() {
        return Err(Error::invalid("cluster ID must not be empty"));
    }
    Ok(())
}
