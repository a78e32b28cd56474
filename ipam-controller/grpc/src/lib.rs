#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod ipam;
pub mod metrics;
pub mod proto;

pub use self::ipam::{IpamGrpcServer, IpamService};
