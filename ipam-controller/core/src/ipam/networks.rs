//! Network reservation and remapping against the pools of a document.

use crate::{
    allocator::{AllocError, Allocator, PrefixStorage},
    cidr::{self, NetworkSet},
    k8s::{IpamStorageSpec, NONE},
    Error,
};
use ipnet::IpNet;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub(super) fn allocator(doc: &mut IpamStorageSpec) -> Allocator<'_, BTreeMap<String, String>> {
    Allocator::new(&mut doc.prefixes)
}

/// Returns the registered pools in registration order.
pub(super) fn pools(doc: &IpamStorageSpec) -> Result<Vec<IpNet>, Error> {
    doc.pools.iter().map(|p| cidr::parse_net(p)).collect()
}

pub(super) fn pool_set(doc: &IpamStorageSpec) -> Result<NetworkSet, Error> {
    let mut set = NetworkSet::new();
    for pool in pools(doc)? {
        set.insert("pool", pool);
    }
    Ok(set)
}

/// The remote networks granted to every cluster.
pub(super) fn cluster_set(doc: &IpamStorageSpec) -> Result<NetworkSet, Error> {
    let mut set = NetworkSet::new();
    for (id, subnets) in &doc.cluster_subnets {
        for (what, net) in [
            ("remote pod CIDR", &subnets.remote_pod_cidr),
            ("remote external CIDR", &subnets.remote_external_cidr),
        ] {
            if !net.is_empty() {
                set.insert(format!("cluster {id} {what}"), cidr::parse_net(net)?);
            }
        }
    }
    Ok(set)
}

/// The local networks and reserved subnets.
pub(super) fn reserved_set(doc: &IpamStorageSpec) -> Result<NetworkSet, Error> {
    let mut set = NetworkSet::new();
    for (what, net) in [
        ("pod CIDR", &doc.pod_cidr),
        ("service CIDR", &doc.service_cidr),
        ("external CIDR", &doc.external_cidr),
    ] {
        if !net.is_empty() && net != NONE {
            set.insert(what, cidr::parse_net(net)?);
        }
    }
    for net in &doc.reserved_subnets {
        set.insert("reserved subnet", cidr::parse_net(net)?);
    }
    Ok(set)
}

/// Grants `requested` if nothing uses it yet, or a free network of the same size otherwise.
pub(super) fn get_or_remap_network(
    doc: &mut IpamStorageSpec,
    requested: IpNet,
) -> Result<IpNet, Error> {
    match allocator(doc).new_prefix(requested) {
        Ok(_) => {
            info!(%requested, "Granted network");
            return Ok(requested);
        }
        Err(AllocError::Overlap { .. }) => {}
        Err(error) => return Err(error.into()),
    }

    let v6 = Some(is_v6(&requested));
    let pools = pools(doc)?;
    if let Some(pool) = pools.iter().copied().find(|p| p.contains(&requested)) {
        if pool == requested {
            return match acquire_from_pools(doc, requested.prefix_len(), v6, Some(pool)) {
                Ok(net) => {
                    info!(%requested, remapped = %net, "Remapped network");
                    Ok(net)
                }
                Err(Error::Exhausted(_)) => {
                    reserve_pool_in_halves(doc, pool)?;
                    info!(%requested, "Granted pool");
                    Ok(pool)
                }
                Err(error) => Err(error),
            };
        }

        match allocator(doc).acquire_specific_child_prefix(pool, requested) {
            Ok(_) => {
                info!(%requested, %pool, "Granted network");
                return Ok(requested);
            }
            Err(AllocError::Overlap { .. }) => {}
            Err(error) => return Err(error.into()),
        }
    }

    let net = acquire_from_pools(doc, requested.prefix_len(), v6, None)?;
    info!(%requested, remapped = %net, "Remapped network");
    Ok(net)
}

/// Acquires a network of length `len` from the first pool that can host it. When `v6` is set,
/// only pools of that address family are considered.
pub(super) fn acquire_from_pools(
    doc: &mut IpamStorageSpec,
    len: u8,
    v6: Option<bool>,
    skip: Option<IpNet>,
) -> Result<IpNet, Error> {
    for pool in pools(doc)? {
        if Some(pool) == skip
            || v6.is_some_and(|v6| is_v6(&pool) != v6)
            || pool.prefix_len() >= len
            || pool.max_prefix_len() < len
        {
            continue;
        }
        match allocator(doc).acquire_child_prefix(pool, len) {
            Ok(prefix) => return Ok(prefix.cidr),
            Err(AllocError::NoPrefixAvailable { .. }) | Err(AllocError::HasIps(_)) => {
                debug!(%pool, len, "Pool is exhausted");
            }
            Err(error) => return Err(error.into()),
        }
    }
    Err(Error::Exhausted(len))
}

fn is_v6(net: &IpNet) -> bool {
    matches!(net, IpNet::V6(_))
}

/// Takes an entire pool out of circulation.
///
/// A child can never be as large as its parent, so the pool is acquired as its two halves.
pub(super) fn reserve_pool_in_halves(
    doc: &mut IpamStorageSpec,
    pool: IpNet,
) -> Result<(), Error> {
    let (lo, hi) = cidr::halves(&pool)
        .ok_or_else(|| Error::invalid(format!("pool {pool} cannot be split")))?;
    let mut alloc = allocator(doc);
    alloc.acquire_specific_child_prefix(pool, lo)?;
    alloc.acquire_specific_child_prefix(pool, hi)?;
    Ok(())
}

/// Acquires exactly `net`, either as a child of the pool containing it or as a new top-level
/// prefix.
pub(super) fn reserve_network(doc: &mut IpamStorageSpec, net: IpNet) -> Result<(), Error> {
    let pool = pools(doc)?.into_iter().find(|p| p.contains(&net));
    let res = match pool {
        Some(pool) if pool == net => return reserve_pool_in_halves(doc, pool),
        Some(pool) => allocator(doc)
            .acquire_specific_child_prefix(pool, net)
            .map(|_| ()),
        None => allocator(doc).new_prefix(net).map(|_| ()),
    };
    res.map_err(|error| match error {
        AllocError::Overlap { .. } => explain_overlap(doc, net).unwrap_or(error.into()),
        error => error.into(),
    })
}

/// Returns true if `net` has been reserved with [`reserve_network`].
pub(super) fn is_network_reserved(doc: &IpamStorageSpec, net: IpNet) -> Result<bool, Error> {
    let exists = |net: IpNet| doc.prefixes.read_prefix(&net).map(|p| p.is_some());
    if pools(doc)?.contains(&net) {
        let (lo, hi) = cidr::halves(&net)
            .ok_or_else(|| Error::invalid(format!("pool {net} cannot be split")))?;
        return Ok(exists(lo)? && exists(hi)?);
    }
    Ok(exists(net)?)
}

/// Releases a network. Networks that are not allocated are ignored.
pub(super) fn free_network(doc: &mut IpamStorageSpec, net: IpNet) -> Result<(), Error> {
    if pools(doc)?.contains(&net) {
        let (lo, hi) = cidr::halves(&net)
            .ok_or_else(|| Error::invalid(format!("pool {net} cannot be split")))?;
        release(doc, lo)?;
        return release(doc, hi);
    }
    release(doc, net)
}

fn release(doc: &mut IpamStorageSpec, net: IpNet) -> Result<(), Error> {
    let mut alloc = allocator(doc);
    match alloc.release_child_prefix(net) {
        Ok(()) => {
            info!(%net, "Released network");
            Ok(())
        }
        Err(AllocError::NotFound(_)) => {
            warn!(%net, "Network already released");
            Ok(())
        }
        Err(AllocError::NotAChild(_)) => {
            alloc.delete_prefix(net)?;
            info!(%net, "Released network");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

/// Names the known network that `net` collides with.
pub(super) fn explain_overlap(doc: &IpamStorageSpec, net: IpNet) -> Option<Error> {
    let mut known = reserved_set(doc).ok()?;
    known.extend(cluster_set(doc).ok()?);
    known.check(&net).err()
}
