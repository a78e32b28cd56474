use crate::Error;
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A named collection of networks against which requested networks are checked for overlap.
///
/// Each member carries a description of its owner (e.g. `pool`, `reserved subnet`, `cluster c1
/// remote pod CIDR`) so that conflicts can be reported with enough context for the caller to
/// pick a different network.
#[derive(Clone, Debug, Default)]
pub struct NetworkSet {
    members: Vec<(String, IpNet)>,
}

// === impl NetworkSet ===

impl NetworkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, owner: impl Into<String>, net: IpNet) {
        self.members.push((owner.into(), net));
    }

    pub fn with(mut self, owner: impl Into<String>, net: IpNet) -> Self {
        self.insert(owner, net);
        self
    }

    /// Adds every member of `other` to this set.
    pub fn extend(&mut self, other: NetworkSet) {
        self.members.extend(other.members);
    }

    /// Returns the first member that overlaps `net`, along with its owner.
    pub fn find_overlap(&self, net: &IpNet) -> Option<(&str, IpNet)> {
        self.members
            .iter()
            .find(|(_, m)| overlaps(m, net))
            .map(|(owner, m)| (owner.as_str(), *m))
    }

    /// Fails with an overlap error naming the colliding member, if any.
    pub fn check(&self, net: &IpNet) -> Result<(), Error> {
        match self.find_overlap(net) {
            Some((owner, conflict)) => Err(Error::Overlap {
                network: *net,
                owner: owner.to_string(),
                conflict,
            }),
            None => Ok(()),
        }
    }
}

/// Returns true if either network contains the other.
pub fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

/// Parses a CIDR, rejecting addresses with host bits set.
pub fn parse_net(s: &str) -> Result<IpNet, Error> {
    if s.is_empty() {
        return Err(Error::invalid("empty CIDR"));
    }
    let net = s
        .parse::<IpNet>()
        .map_err(|_| Error::invalid(format!("{s:?} is not a valid CIDR")))?;
    if net.trunc() != net {
        return Err(Error::invalid(format!(
            "{s} is not a network address; did you mean {}?",
            net.trunc()
        )));
    }
    Ok(net)
}

pub fn parse_ip(s: &str) -> Result<IpAddr, Error> {
    if s.is_empty() {
        return Err(Error::invalid("empty IP address"));
    }
    s.parse()
        .map_err(|_| Error::invalid(format!("{s:?} is not a valid IP address")))
}

/// Replaces the network part of `ip` with `net`, keeping the host part.
///
/// Used to translate an address between two networks of the same size.
pub fn map_ip_to_network(ip: IpAddr, net: IpNet) -> Result<IpAddr, Error> {
    match (ip, net) {
        (IpAddr::V4(ip), IpNet::V4(net)) => {
            let host = u32::from(ip) & u32::from(net.hostmask());
            Ok(Ipv4Addr::from(u32::from(net.network()) | host).into())
        }
        (IpAddr::V6(ip), IpNet::V6(net)) => {
            let host = u128::from(ip) & u128::from(net.hostmask());
            Ok(Ipv6Addr::from(u128::from(net.network()) | host).into())
        }
        _ => Err(Error::invalid(format!(
            "{ip} and {net} belong to different address families"
        ))),
    }
}

/// Splits a network into its two halves.
pub fn halves(net: &IpNet) -> Option<(IpNet, IpNet)> {
    let mut subnets = net.subnets(net.prefix_len() + 1).ok()?;
    Some((subnets.next()?, subnets.next()?))
}

pub(crate) fn to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(addr) => u32::from(addr).into(),
        IpAddr::V6(addr) => addr.into(),
    }
}

pub(crate) fn from_u128(value: u128, v4: bool) -> IpAddr {
    if v4 {
        // Callers only produce values within the bounds of an IPv4 network.
        Ipv4Addr::from(value as u32).into()
    } else {
        Ipv6Addr::from(value).into()
    }
}

/// Returns the first and last addresses of a network.
pub(crate) fn bounds(net: &IpNet) -> (u128, u128) {
    (to_u128(net.network()), to_u128(net.broadcast()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn maps_ips_between_networks() {
        let ip = "10.0.0.27".parse().unwrap();
        assert_eq!(
            map_ip_to_network(ip, net("192.168.4.0/24")).unwrap(),
            "192.168.4.27".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            map_ip_to_network("10.50.3.4".parse().unwrap(), net("10.1.0.0/16")).unwrap(),
            "10.1.3.4".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            map_ip_to_network("fd00::1:5".parse().unwrap(), net("fd01::/64")).unwrap(),
            "fd01::1:5".parse::<IpAddr>().unwrap()
        );
        assert!(map_ip_to_network(ip, net("fd01::/64")).is_err());
    }

    #[test]
    fn reports_the_colliding_member() {
        let set = NetworkSet::new()
            .with("pool", net("10.0.0.0/8"))
            .with("cluster c1 remote pod CIDR", net("100.64.0.0/16"));

        assert!(set.check(&net("192.168.0.0/16")).is_ok());
        assert_eq!(
            set.find_overlap(&net("100.64.128.0/17")),
            Some(("cluster c1 remote pod CIDR", net("100.64.0.0/16")))
        );
        // Containment is checked in both directions.
        assert_eq!(
            set.find_overlap(&net("0.0.0.0/0")).map(|(owner, _)| owner),
            Some("pool")
        );
        assert!(matches!(
            set.check(&net("10.1.0.0/16")),
            Err(Error::Overlap { owner, conflict, .. }) if owner == "pool" && conflict == net("10.0.0.0/8")
        ));
    }

    #[test]
    fn rejects_host_bits() {
        assert_eq!(parse_net("10.0.0.0/24").unwrap(), net("10.0.0.0/24"));
        assert!(parse_net("10.0.0.1/24").is_err());
        assert!(parse_net("10.0.0.0").is_err());
        assert!(parse_net("").is_err());
        assert!(parse_ip("10.0.0.256").is_err());
    }

    #[test]
    fn splits_in_halves() {
        assert_eq!(
            halves(&net("10.0.0.0/8")),
            Some((net("10.0.0.0/9"), net("10.128.0.0/9")))
        );
        assert_eq!(halves(&net("10.0.0.1/32")), None);
    }
}
