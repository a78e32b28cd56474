//! Linkerd IPAM Controller
//!
//! When meshed clusters peer with each other, their pod and external networks frequently collide.
//! The IPAM controller keeps the address space of a cluster collision-free from the point of view
//! of each of its peers:
//!
//! - Each remote cluster's networks are granted verbatim when they do not conflict with anything
//!   known locally, and are otherwise remapped onto a free network carved from a pool.
//! - Endpoints reflected to a remote cluster are mapped, one IP at a time, into the local
//!   ExternalCIDR and then translated through whatever remapping the remote cluster applied to
//!   it. The resulting translations are recorded in a per-cluster NAT ledger.
//!
//! ```text
//! [ Ipam ] -> [ Allocator ] -> [ Storage ] <- [ NatMappingInflater ] -> [ NatMappingStorage ]
//! ```
//!
//! All state lives in a single document behind the [`Storage`] trait; every mutation works on a
//! private copy of that document and is persisted with a single patch, so failed operations leave
//! nothing behind.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod allocator;
pub mod cidr;
mod error;
pub mod ipam;
pub mod nat;
pub mod store;

pub use self::{
    cidr::NetworkSet,
    error::{Error, ErrorKind},
    ipam::{Config, Ipam, DEFAULT_POOLS},
    nat::{MemoryNatMappings, NatMappingInflater, NatMappingStorage},
    store::{MemoryStorage, Patch, Storage, StorageError},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};
pub use linkerd_ipam_controller_k8s_api as k8s;
