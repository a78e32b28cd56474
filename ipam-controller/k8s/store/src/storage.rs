use crate::{backend, is_status};
use linkerd_ipam_controller_core::{
    k8s::{self, IpamStorage, IpamStorageSpec},
    store::{Patch, Storage},
    StorageError,
};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info};

const CREATE_ATTEMPTS: u32 = 5;
const CREATE_BACKOFF: Duration = Duration::from_millis(100);

/// Persists the IPAM document in the `spec` of a single `IpamStorage` resource.
pub struct KubeStorage {
    api: k8s::Api<IpamStorage>,
    name: String,
    cache: RwLock<Arc<IpamStorageSpec>>,
}

// === impl KubeStorage ===

impl KubeStorage {
    /// Loads the named resource, creating an empty one when it does not exist yet.
    ///
    /// Another replica may create the resource concurrently; conflicting creations are retried
    /// with exponential backoff.
    pub async fn init(
        client: k8s::Client,
        namespace: &str,
        name: &str,
    ) -> Result<Self, k8s::Error> {
        let api = k8s::Api::<IpamStorage>::namespaced(client, namespace);
        let mut backoffs = backoffs();
        loop {
            if let Some(res) = api.get_opt(name).await? {
                debug!(%namespace, %name, "Loaded IPAM storage");
                return Ok(Self::new(api, name, res.spec));
            }

            let res = IpamStorage::new(name, IpamStorageSpec::default());
            match api.create(&k8s::PostParams::default(), &res).await {
                Ok(res) => {
                    info!(%namespace, %name, "Created IPAM storage");
                    return Ok(Self::new(api, name, res.spec));
                }
                Err(error) if is_status(&error, 409) => match backoffs.next() {
                    Some(backoff) => {
                        debug!(%name, ?backoff, "IPAM storage created concurrently; retrying");
                        time::sleep(backoff).await;
                    }
                    None => return Err(error),
                },
                Err(error) => return Err(error),
            }
        }
    }

    fn new(api: k8s::Api<IpamStorage>, name: &str, spec: IpamStorageSpec) -> Self {
        Self {
            api,
            name: name.to_string(),
            cache: RwLock::new(Arc::new(spec)),
        }
    }
}

#[async_trait::async_trait]
impl Storage for KubeStorage {
    fn document(&self) -> Arc<IpamStorageSpec> {
        self.cache.read().clone()
    }

    async fn apply(&self, patch: Patch) -> Result<IpamStorageSpec, StorageError> {
        let fields = patch.fields().map(|f| f.name()).collect::<Vec<_>>();
        let patch = k8s::Patch::Json::<()>(patch.to_json_patch()?);
        let res = self
            .api
            .patch(&self.name, &k8s::PatchParams::default(), &patch)
            .await
            .map_err(backend)?;
        debug!(name = %self.name, ?fields, "Patched IPAM storage");

        *self.cache.write() = Arc::new(res.spec.clone());
        Ok(res.spec)
    }
}

/// Delays between conflicting creations: 100ms doubling, for at most [`CREATE_ATTEMPTS`]
/// attempts overall.
fn backoffs() -> impl Iterator<Item = Duration> {
    (0..CREATE_ATTEMPTS - 1).map(|n| CREATE_BACKOFF * 2u32.pow(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_error;

    #[test]
    fn create_backoff_doubles() {
        assert_eq!(
            backoffs().collect::<Vec<_>>(),
            [100, 200, 400, 800].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn only_conflicts_are_retried() {
        assert!(is_status(&api_error(409, "AlreadyExists"), 409));
        assert!(!is_status(&api_error(403, "Forbidden"), 409));
    }
}
