//! Kubernetes-backed persistence for the IPAM engine.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod nat;
mod storage;

pub use self::{nat::KubeNatMappings, storage::KubeStorage};

use linkerd_ipam_controller_core::{k8s, StorageError};

fn is_status(error: &k8s::Error, code: u16) -> bool {
    matches!(error, k8s::Error::Api(rsp) if rsp.code == code)
}

fn backend(error: k8s::Error) -> StorageError {
    StorageError::Backend(Box::new(error))
}

#[cfg(test)]
fn api_error(code: u16, reason: &str) -> k8s::Error {
    k8s::Error::Api(k8s::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    })
}
