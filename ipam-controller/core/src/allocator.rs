//! A prefix allocator over CIDR networks.
//!
//! Top-level prefixes are registered with [`Allocator::new_prefix`] and never overlap each other.
//! Child prefixes are carved out of a parent and released independently; IPs are handed out from
//! prefixes that have no children. All state is kept in a [`PrefixStorage`], one opaque entry per
//! prefix.

use crate::cidr::{self, overlaps};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("prefix {0} not found")]
    NotFound(IpNet),

    #[error("{requested} overlaps with prefix {existing}")]
    Overlap { requested: IpNet, existing: IpNet },

    #[error("no /{len} prefix is available in {parent}")]
    NoPrefixAvailable { parent: IpNet, len: u8 },

    #[error("no IP is available in {0}")]
    NoIpAvailable(IpNet),

    #[error("{ip} is not allocated in {prefix}")]
    IpNotFound { prefix: IpNet, ip: IpAddr },

    #[error("{ip} is already allocated in {prefix}")]
    IpAlreadyAllocated { prefix: IpNet, ip: IpAddr },

    #[error("{what} is outside of prefix {prefix}")]
    OutOfRange { prefix: IpNet, what: String },

    #[error("prefix {0} has allocated IPs")]
    HasIps(IpNet),

    #[error("prefix {0} has child prefixes")]
    HasChildren(IpNet),

    #[error("prefix {0} is not a child prefix")]
    NotAChild(IpNet),

    #[error("prefix {child} is a child of {parent}")]
    IsChild { child: IpNet, parent: IpNet },

    #[error("length /{len} must be longer than the length of {parent}")]
    InvalidLength { parent: IpNet, len: u8 },

    #[error("{0} is not a network address")]
    NotCanonical(IpNet),

    #[error("prefix {0} already exists")]
    AlreadyExists(IpNet),

    #[error("malformed state for prefix {cidr}: {source}")]
    Codec {
        cidr: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The allocation state of a single prefix.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Prefix {
    pub cidr: IpNet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<IpNet>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub children: BTreeSet<IpNet>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ips: BTreeSet<IpAddr>,
}

/// Persists prefixes for an [`Allocator`].
///
/// Any backend that can store one opaque value per CIDR can satisfy this.
pub trait PrefixStorage {
    fn create_prefix(&mut self, prefix: &Prefix) -> Result<(), AllocError>;

    fn read_prefix(&self, cidr: &IpNet) -> Result<Option<Prefix>, AllocError>;

    fn read_all_prefixes(&self) -> Result<Vec<Prefix>, AllocError>;

    fn update_prefix(&mut self, prefix: &Prefix) -> Result<(), AllocError>;

    fn delete_prefix(&mut self, cidr: &IpNet) -> Result<(), AllocError>;
}

/// Operates on the prefixes held by a storage.
pub struct Allocator<'s, S: ?Sized> {
    storage: &'s mut S,
}

// === impl Prefix ===

impl Prefix {
    fn new(cidr: IpNet, parent: Option<IpNet>) -> Self {
        Self {
            cidr,
            parent,
            children: BTreeSet::new(),
            ips: BTreeSet::new(),
        }
    }

    /// Returns the range of addresses that may be handed out. The network and broadcast
    /// addresses of IPv4 networks are excluded, except for /31 and /32 networks.
    fn host_bounds(&self) -> (u128, u128) {
        let (first, last) = cidr::bounds(&self.cidr);
        match self.cidr {
            IpNet::V4(net) if net.prefix_len() < 31 => (first + 1, last - 1),
            _ => (first, last),
        }
    }

    fn is_v4(&self) -> bool {
        matches!(self.cidr, IpNet::V4(_))
    }

    /// Finds the lowest aligned network of length `len` that does not overlap any child.
    fn free_child(&self, len: u8) -> Option<IpNet> {
        let (first, last) = cidr::bounds(&self.cidr);
        let step = 1u128.checked_shl(u32::from(self.cidr.max_prefix_len() - len))?;

        let mut candidate = first;
        for child in &self.children {
            let (lo, hi) = cidr::bounds(child);
            if hi < candidate {
                continue;
            }
            if candidate.checked_add(step - 1)? < lo {
                break;
            }
            candidate = align_up(hi.checked_add(1)?, step)?;
        }

        if candidate.checked_add(step - 1)? > last {
            return None;
        }
        IpNet::new(cidr::from_u128(candidate, self.is_v4()), len).ok()
    }
}

fn align_up(value: u128, step: u128) -> Option<u128> {
    Some(value.checked_add(step - 1)? / step * step)
}

// === impl Allocator ===

impl<'s, S: PrefixStorage + ?Sized> Allocator<'s, S> {
    pub fn new(storage: &'s mut S) -> Self {
        Self { storage }
    }

    /// Returns the state of a prefix, if it exists.
    pub fn prefix_from(&self, cidr: IpNet) -> Result<Option<Prefix>, AllocError> {
        self.storage.read_prefix(&cidr)
    }

    /// Registers a top-level prefix. Fails if it overlaps any existing prefix.
    pub fn new_prefix(&mut self, cidr: IpNet) -> Result<Prefix, AllocError> {
        if cidr.trunc() != cidr {
            return Err(AllocError::NotCanonical(cidr));
        }
        if let Some(existing) = self
            .storage
            .read_all_prefixes()?
            .into_iter()
            .find(|p| overlaps(&p.cidr, &cidr))
        {
            return Err(AllocError::Overlap {
                requested: cidr,
                existing: existing.cidr,
            });
        }

        let prefix = Prefix::new(cidr, None);
        self.storage.create_prefix(&prefix)?;
        Ok(prefix)
    }

    /// Deletes a top-level prefix that holds neither IPs nor children.
    pub fn delete_prefix(&mut self, cidr: IpNet) -> Result<Prefix, AllocError> {
        let prefix = self.read(cidr)?;
        if let Some(parent) = prefix.parent {
            return Err(AllocError::IsChild {
                child: cidr,
                parent,
            });
        }
        if !prefix.ips.is_empty() {
            return Err(AllocError::HasIps(cidr));
        }
        if !prefix.children.is_empty() {
            return Err(AllocError::HasChildren(cidr));
        }
        self.storage.delete_prefix(&cidr)?;
        Ok(prefix)
    }

    /// Acquires the lowest free child of length `len` from `parent`.
    pub fn acquire_child_prefix(&mut self, parent: IpNet, len: u8) -> Result<Prefix, AllocError> {
        let parent = self.read(parent)?;
        if len <= parent.cidr.prefix_len() || len > parent.cidr.max_prefix_len() {
            return Err(AllocError::InvalidLength {
                parent: parent.cidr,
                len,
            });
        }
        if !parent.ips.is_empty() {
            return Err(AllocError::HasIps(parent.cidr));
        }

        let child = parent
            .free_child(len)
            .ok_or(AllocError::NoPrefixAvailable {
                parent: parent.cidr,
                len,
            })?;
        self.insert_child(parent, child)
    }

    /// Acquires exactly `child` from `parent`.
    ///
    /// The child must be strictly smaller than its parent, so a prefix can never be acquired as a
    /// child of itself.
    pub fn acquire_specific_child_prefix(
        &mut self,
        parent: IpNet,
        child: IpNet,
    ) -> Result<Prefix, AllocError> {
        if child.trunc() != child {
            return Err(AllocError::NotCanonical(child));
        }
        let parent = self.read(parent)?;
        if child.prefix_len() <= parent.cidr.prefix_len() {
            return Err(AllocError::InvalidLength {
                parent: parent.cidr,
                len: child.prefix_len(),
            });
        }
        if !parent.cidr.contains(&child) {
            return Err(AllocError::OutOfRange {
                prefix: parent.cidr,
                what: child.to_string(),
            });
        }
        if !parent.ips.is_empty() {
            return Err(AllocError::HasIps(parent.cidr));
        }
        if let Some(existing) = parent.children.iter().find(|c| overlaps(c, &child)) {
            return Err(AllocError::Overlap {
                requested: child,
                existing: *existing,
            });
        }
        self.insert_child(parent, child)
    }

    /// Releases a child prefix back to its parent.
    pub fn release_child_prefix(&mut self, child: IpNet) -> Result<(), AllocError> {
        let prefix = self.read(child)?;
        let parent = prefix.parent.ok_or(AllocError::NotAChild(child))?;
        if !prefix.ips.is_empty() {
            return Err(AllocError::HasIps(child));
        }
        if !prefix.children.is_empty() {
            return Err(AllocError::HasChildren(child));
        }

        let mut parent = self.read(parent)?;
        parent.children.remove(&child);
        self.storage.update_prefix(&parent)?;
        self.storage.delete_prefix(&child)
    }

    /// Acquires the lowest free IP of a prefix.
    pub fn acquire_ip(&mut self, cidr: IpNet) -> Result<IpAddr, AllocError> {
        let mut prefix = self.read(cidr)?;
        if !prefix.children.is_empty() {
            return Err(AllocError::HasChildren(cidr));
        }

        let (first, last) = prefix.host_bounds();
        let mut candidate = first;
        for used in prefix.ips.iter().map(|ip| cidr::to_u128(*ip)) {
            if used < candidate {
                continue;
            }
            if used > candidate {
                break;
            }
            candidate = candidate
                .checked_add(1)
                .ok_or(AllocError::NoIpAvailable(cidr))?;
        }
        if candidate > last {
            return Err(AllocError::NoIpAvailable(cidr));
        }

        let ip = cidr::from_u128(candidate, prefix.is_v4());
        prefix.ips.insert(ip);
        self.storage.update_prefix(&prefix)?;
        Ok(ip)
    }

    /// Acquires exactly `ip` from a prefix.
    pub fn acquire_specific_ip(&mut self, cidr: IpNet, ip: IpAddr) -> Result<IpAddr, AllocError> {
        let mut prefix = self.read(cidr)?;
        if !prefix.children.is_empty() {
            return Err(AllocError::HasChildren(cidr));
        }

        let (first, last) = prefix.host_bounds();
        let value = cidr::to_u128(ip);
        if ip.is_ipv4() != prefix.is_v4() || value < first || value > last {
            return Err(AllocError::OutOfRange {
                prefix: cidr,
                what: ip.to_string(),
            });
        }
        if !prefix.ips.insert(ip) {
            return Err(AllocError::IpAlreadyAllocated { prefix: cidr, ip });
        }
        self.storage.update_prefix(&prefix)?;
        Ok(ip)
    }

    pub fn release_ip_from_prefix(&mut self, cidr: IpNet, ip: IpAddr) -> Result<(), AllocError> {
        let mut prefix = self.read(cidr)?;
        if !prefix.ips.remove(&ip) {
            return Err(AllocError::IpNotFound { prefix: cidr, ip });
        }
        self.storage.update_prefix(&prefix)
    }

    fn read(&self, cidr: IpNet) -> Result<Prefix, AllocError> {
        self.storage
            .read_prefix(&cidr)?
            .ok_or(AllocError::NotFound(cidr))
    }

    fn insert_child(&mut self, mut parent: Prefix, child: IpNet) -> Result<Prefix, AllocError> {
        let prefix = Prefix::new(child, Some(parent.cidr));
        self.storage.create_prefix(&prefix)?;
        parent.children.insert(child);
        self.storage.update_prefix(&parent)?;
        Ok(prefix)
    }
}

// === impl PrefixStorage for BTreeMap ===

/// Prefixes are stored as JSON text keyed by CIDR, which is how they are kept in the IPAM
/// document.
impl PrefixStorage for BTreeMap<String, String> {
    fn create_prefix(&mut self, prefix: &Prefix) -> Result<(), AllocError> {
        let key = prefix.cidr.to_string();
        if self.contains_key(&key) {
            return Err(AllocError::AlreadyExists(prefix.cidr));
        }
        self.insert(key, encode(prefix)?);
        Ok(())
    }

    fn read_prefix(&self, cidr: &IpNet) -> Result<Option<Prefix>, AllocError> {
        let key = cidr.to_string();
        self.get(&key).map(|value| decode(&key, value)).transpose()
    }

    fn read_all_prefixes(&self) -> Result<Vec<Prefix>, AllocError> {
        self.iter().map(|(key, value)| decode(key, value)).collect()
    }

    fn update_prefix(&mut self, prefix: &Prefix) -> Result<(), AllocError> {
        match self.get_mut(&prefix.cidr.to_string()) {
            Some(value) => {
                *value = encode(prefix)?;
                Ok(())
            }
            None => Err(AllocError::NotFound(prefix.cidr)),
        }
    }

    fn delete_prefix(&mut self, cidr: &IpNet) -> Result<(), AllocError> {
        self.remove(&cidr.to_string())
            .map(|_| ())
            .ok_or(AllocError::NotFound(*cidr))
    }
}

fn encode(prefix: &Prefix) -> Result<String, AllocError> {
    serde_json::to_string(prefix).map_err(|source| AllocError::Codec {
        cidr: prefix.cidr.to_string(),
        source,
    })
}

fn decode(key: &str, value: &str) -> Result<Prefix, AllocError> {
    serde_json::from_str(value).map_err(|source| AllocError::Codec {
        cidr: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn top_level_prefixes_do_not_overlap() {
        let mut prefixes = BTreeMap::new();
        let mut alloc = Allocator::new(&mut prefixes);

        alloc.new_prefix(net("10.0.0.0/8")).unwrap();
        alloc.new_prefix(net("192.168.0.0/16")).unwrap();

        assert!(matches!(
            alloc.new_prefix(net("10.50.0.0/16")),
            Err(AllocError::Overlap { existing, .. }) if existing == net("10.0.0.0/8")
        ));
        assert!(matches!(
            alloc.new_prefix(net("0.0.0.0/0")),
            Err(AllocError::Overlap { .. })
        ));
        assert!(matches!(
            alloc.new_prefix(net("10.0.0.1/8")),
            Err(AllocError::NotCanonical(_))
        ));
    }

    #[test]
    fn child_prefixes_are_allocated_lowest_first() {
        let mut prefixes = BTreeMap::new();
        let mut alloc = Allocator::new(&mut prefixes);
        alloc.new_prefix(net("10.0.0.0/8")).unwrap();

        alloc
            .acquire_specific_child_prefix(net("10.0.0.0/8"), net("10.0.0.0/24"))
            .unwrap();
        let child = alloc.acquire_child_prefix(net("10.0.0.0/8"), 24).unwrap();
        assert_eq!(child.cidr, net("10.0.1.0/24"));
        assert_eq!(child.parent, Some(net("10.0.0.0/8")));

        // Larger children skip over the space used by smaller ones.
        let child = alloc.acquire_child_prefix(net("10.0.0.0/8"), 16).unwrap();
        assert_eq!(child.cidr, net("10.1.0.0/16"));

        let parent = alloc.prefix_from(net("10.0.0.0/8")).unwrap().unwrap();
        assert_eq!(parent.children.len(), 3);

        // Children are themselves prefixes.
        assert!(matches!(
            alloc.new_prefix(net("10.1.2.0/24")),
            Err(AllocError::Overlap { .. })
        ));
    }

    #[test]
    fn specific_child_prefixes() {
        let mut prefixes = BTreeMap::new();
        let mut alloc = Allocator::new(&mut prefixes);
        alloc.new_prefix(net("192.168.0.0/16")).unwrap();

        alloc
            .acquire_specific_child_prefix(net("192.168.0.0/16"), net("192.168.4.0/22"))
            .unwrap();
        assert!(matches!(
            alloc.acquire_specific_child_prefix(net("192.168.0.0/16"), net("192.168.5.0/24")),
            Err(AllocError::Overlap { existing, .. }) if existing == net("192.168.4.0/22")
        ));
        assert!(matches!(
            alloc.acquire_specific_child_prefix(net("192.168.0.0/16"), net("192.168.0.0/16")),
            Err(AllocError::InvalidLength { .. })
        ));
        assert!(matches!(
            alloc.acquire_specific_child_prefix(net("192.168.0.0/16"), net("10.0.0.0/24")),
            Err(AllocError::OutOfRange { .. })
        ));
    }

    #[test]
    fn exhausts_child_prefixes() {
        let mut prefixes = BTreeMap::new();
        let mut alloc = Allocator::new(&mut prefixes);
        alloc.new_prefix(net("10.0.0.0/8")).unwrap();

        assert_eq!(
            alloc.acquire_child_prefix(net("10.0.0.0/8"), 9).unwrap().cidr,
            net("10.0.0.0/9")
        );
        assert_eq!(
            alloc.acquire_child_prefix(net("10.0.0.0/8"), 9).unwrap().cidr,
            net("10.128.0.0/9")
        );
        assert!(matches!(
            alloc.acquire_child_prefix(net("10.0.0.0/8"), 24),
            Err(AllocError::NoPrefixAvailable { len: 24, .. })
        ));

        alloc.release_child_prefix(net("10.128.0.0/9")).unwrap();
        assert_eq!(
            alloc.acquire_child_prefix(net("10.0.0.0/8"), 24).unwrap().cidr,
            net("10.128.0.0/24")
        );
    }

    #[test]
    fn releases_and_deletes() {
        let mut prefixes = BTreeMap::new();
        let mut alloc = Allocator::new(&mut prefixes);
        alloc.new_prefix(net("10.0.0.0/8")).unwrap();
        alloc.acquire_child_prefix(net("10.0.0.0/8"), 16).unwrap();

        assert!(matches!(
            alloc.delete_prefix(net("10.0.0.0/8")),
            Err(AllocError::HasChildren(_))
        ));
        assert!(matches!(
            alloc.delete_prefix(net("10.0.0.0/16")),
            Err(AllocError::IsChild { .. })
        ));
        assert!(matches!(
            alloc.release_child_prefix(net("10.0.0.0/8")),
            Err(AllocError::NotAChild(_))
        ));

        alloc.release_child_prefix(net("10.0.0.0/16")).unwrap();
        assert!(matches!(
            alloc.release_child_prefix(net("10.0.0.0/16")),
            Err(AllocError::NotFound(_))
        ));
        alloc.delete_prefix(net("10.0.0.0/8")).unwrap();
        assert!(alloc.prefix_from(net("10.0.0.0/8")).unwrap().is_none());
    }

    #[test]
    fn acquires_and_releases_ips() {
        let mut prefixes = BTreeMap::new();
        let mut alloc = Allocator::new(&mut prefixes);
        alloc.new_prefix(net("10.0.1.0/30")).unwrap();

        // The network and broadcast addresses are never handed out.
        assert_eq!(alloc.acquire_ip(net("10.0.1.0/30")).unwrap(), ip("10.0.1.1"));
        assert_eq!(alloc.acquire_ip(net("10.0.1.0/30")).unwrap(), ip("10.0.1.2"));
        assert!(matches!(
            alloc.acquire_ip(net("10.0.1.0/30")),
            Err(AllocError::NoIpAvailable(_))
        ));

        alloc
            .release_ip_from_prefix(net("10.0.1.0/30"), ip("10.0.1.1"))
            .unwrap();
        assert!(matches!(
            alloc.release_ip_from_prefix(net("10.0.1.0/30"), ip("10.0.1.1")),
            Err(AllocError::IpNotFound { .. })
        ));
        assert_eq!(
            alloc
                .acquire_specific_ip(net("10.0.1.0/30"), ip("10.0.1.1"))
                .unwrap(),
            ip("10.0.1.1")
        );
        assert!(matches!(
            alloc.acquire_specific_ip(net("10.0.1.0/30"), ip("10.0.1.1")),
            Err(AllocError::IpAlreadyAllocated { .. })
        ));
        assert!(matches!(
            alloc.acquire_specific_ip(net("10.0.1.0/30"), ip("10.0.1.3")),
            Err(AllocError::OutOfRange { .. })
        ));

        // A prefix holding IPs cannot be removed or split.
        assert!(matches!(
            alloc.delete_prefix(net("10.0.1.0/30")),
            Err(AllocError::HasIps(_))
        ));
        assert!(matches!(
            alloc.acquire_child_prefix(net("10.0.1.0/30"), 31),
            Err(AllocError::HasIps(_))
        ));
    }

    #[test]
    fn parents_do_not_hand_out_ips() {
        let mut prefixes = BTreeMap::new();
        let mut alloc = Allocator::new(&mut prefixes);
        alloc.new_prefix(net("fd00::/48")).unwrap();
        let child = alloc.acquire_child_prefix(net("fd00::/48"), 64).unwrap();
        assert_eq!(child.cidr, net("fd00::/64"));

        assert!(matches!(
            alloc.acquire_ip(net("fd00::/48")),
            Err(AllocError::HasChildren(_))
        ));
        assert_eq!(alloc.acquire_ip(net("fd00::/64")).unwrap(), ip("fd00::"));
    }

    #[test]
    fn state_is_stored_per_prefix() {
        let mut prefixes = BTreeMap::new();
        {
            let mut alloc = Allocator::new(&mut prefixes);
            alloc.new_prefix(net("10.0.0.0/8")).unwrap();
            alloc.acquire_child_prefix(net("10.0.0.0/8"), 24).unwrap();
        }
        assert_eq!(
            prefixes.keys().cloned().collect::<Vec<_>>(),
            vec!["10.0.0.0/24".to_string(), "10.0.0.0/8".to_string()]
        );

        prefixes.insert("10.0.0.0/24".to_string(), "not json".to_string());
        let alloc = Allocator::new(&mut prefixes);
        assert!(matches!(
            alloc.prefix_from(net("10.0.0.0/24")),
            Err(AllocError::Codec { .. })
        ));
    }
}
