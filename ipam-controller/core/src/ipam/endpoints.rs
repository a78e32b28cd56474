//! Endpoint IP mappings into the local ExternalCIDR.

use super::networks::allocator;
use crate::{
    allocator::AllocError,
    cidr,
    k8s::{ClusterMapping, EndpointMapping, IpamStorageSpec, Subnets, NONE},
    Error,
};
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{debug, warn};

pub(super) fn external_cidr(doc: &IpamStorageSpec) -> Result<IpNet, Error> {
    if doc.external_cidr.is_empty() {
        return Err(Error::missing_init("ExternalCIDR"));
    }
    cidr::parse_net(&doc.external_cidr)
}

pub(super) fn pod_cidr(doc: &IpamStorageSpec) -> Result<IpNet, Error> {
    if doc.pod_cidr.is_empty() {
        return Err(Error::missing_init("PodCIDR"));
    }
    cidr::parse_net(&doc.pod_cidr)
}

pub(super) fn cluster_subnets<'d>(
    doc: &'d IpamStorageSpec,
    cluster_id: &str,
) -> Result<&'d Subnets, Error> {
    doc.cluster_subnets
        .get(cluster_id)
        .ok_or_else(|| Error::missing_init(format!("subnets for cluster {cluster_id}")))
}

/// Projects a local pod IP into the network the remote cluster uses to reach local pods.
pub(super) fn project_pod_ip(subnets: &Subnets, ip: IpAddr) -> Result<IpAddr, Error> {
    match subnets.local_nat_pod_cidr.as_str() {
        "" => Err(Error::missing_init("local NAT PodCIDR")),
        NONE => Ok(ip),
        net => cidr::map_ip_to_network(ip, cidr::parse_net(net)?),
    }
}

/// Maps an endpoint IP into the local ExternalCIDR as seen by `cluster_id`.
///
/// An IP is acquired from the ExternalCIDR the first time an endpoint is mapped and shared by
/// every cluster the endpoint is mapped for.
pub(super) fn map_to_external_cidr(
    doc: &mut IpamStorageSpec,
    cluster_id: &str,
    ip: IpAddr,
) -> Result<IpAddr, Error> {
    let external = external_cidr(doc)?;
    let target = match cluster_subnets(doc, cluster_id)?
        .local_nat_external_cidr
        .as_str()
    {
        "" | NONE => external,
        net => cidr::parse_net(net)?,
    };

    let key = ip.to_string();
    let original = match doc.endpoint_mappings.get(&key) {
        Some(mapping) => {
            if let Some(mapped) = mapping.cluster_mappings.get(cluster_id) {
                debug!(
                    cluster_id,
                    %ip,
                    natted = %mapped.external_cidr_natted_ip,
                    "Endpoint already mapped"
                );
                return cidr::parse_ip(&mapped.external_cidr_natted_ip);
            }
            cidr::parse_ip(&mapping.external_cidr_original_ip)?
        }
        None => allocator(doc).acquire_ip(external)?,
    };

    let natted = cidr::map_ip_to_network(original, target)?;
    let mapping = doc
        .endpoint_mappings
        .entry(key)
        .or_insert_with(|| EndpointMapping {
            external_cidr_original_ip: original.to_string(),
            ..Default::default()
        });
    mapping.cluster_mappings.insert(
        cluster_id.to_string(),
        ClusterMapping {
            external_cidr_natted_ip: natted.to_string(),
        },
    );
    Ok(natted)
}

/// Removes the cluster from an endpoint's mapping, releasing the acquired IP when no cluster uses
/// it anymore. Returns false when the endpoint was not mapped for the cluster.
pub(super) fn unmap(doc: &mut IpamStorageSpec, cluster_id: &str, ip: &str) -> Result<bool, Error> {
    let Some(mapping) = doc.endpoint_mappings.get_mut(ip) else {
        return Ok(false);
    };
    if mapping.cluster_mappings.remove(cluster_id).is_none() {
        return Ok(false);
    }
    if !mapping.cluster_mappings.is_empty() {
        return Ok(true);
    }

    let original = cidr::parse_ip(&mapping.external_cidr_original_ip)?;
    doc.endpoint_mappings.remove(ip);
    let external = external_cidr(doc)?;
    match allocator(doc).release_ip_from_prefix(external, original) {
        Ok(()) => debug!(%ip, %original, "Released endpoint IP"),
        Err(AllocError::IpNotFound { .. } | AllocError::NotFound(_)) => {
            warn!(%ip, %original, "Endpoint IP already released")
        }
        Err(error) => return Err(error.into()),
    }
    Ok(true)
}

/// Unmaps every endpoint mapped for the cluster. Returns the endpoint IPs that were unmapped.
pub(super) fn unmap_cluster(
    doc: &mut IpamStorageSpec,
    cluster_id: &str,
) -> Result<Vec<String>, Error> {
    let ips = doc
        .endpoint_mappings
        .iter()
        .filter(|(_, m)| m.cluster_mappings.contains_key(cluster_id))
        .map(|(ip, _)| ip.clone())
        .collect::<Vec<_>>();
    for ip in &ips {
        unmap(doc, cluster_id, ip)?;
    }
    Ok(ips)
}
