#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use linkerd_ipam_controller_core as core;
pub use linkerd_ipam_controller_grpc as grpc;
pub use linkerd_ipam_controller_k8s_store as store;

mod args;

pub use self::args::{Args, StorageKind};
