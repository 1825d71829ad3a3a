//! # kube-directory
//!
//! Kubernetes implementation of the kube subnet manager's directory:
//! a node watcher feeding a local cache, annotation patches against the
//! node status subresource, and the pod lookup used to find the local node.
use std::{
    fmt,
    path::Path,
    pin::pin,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    Api, Config as KubeConfig,
    api::{Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{WatchStreamExt, watcher},
};
use kube_subnet::{
    DirectoryCache, DirectoryClient, DirectoryError, Entry, EntryPatch, Notification,
    NotificationHandler, RESYNC_PERIOD,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod store;

pub use kube::Client;
pub use store::node_to_entry;
use store::NodeStore;

/// Build a client. An explicit API URL or kubeconfig selects out of cluster
/// config, otherwise the in-cluster service account is used.
pub async fn client(api_url: Option<&str>, kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("unable to read kubeconfig {}", path.display()))?;
            KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("unable to create k8s config")?
        }
        None if api_url.is_some() => KubeConfig::infer()
            .await
            .context("unable to create k8s config")?,
        None => KubeConfig::incluster().context("unable to initialize inclusterconfig")?,
    };
    if let Some(url) = api_url {
        config.cluster_url = url
            .parse()
            .with_context(|| format!("invalid api url {url:?}"))?;
    }
    Client::try_from(config).context("unable to initialize client")
}

/// Name of the node the pod `namespace/pod_name` is scheduled on.
pub async fn pod_node_name(client: Client, namespace: &str, pod_name: &str) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let pod = pods
        .get(pod_name)
        .await
        .with_context(|| format!("error retrieving pod spec for '{namespace}/{pod_name}'"))?;
    pod.spec
        .and_then(|spec| spec.node_name)
        .filter(|name| !name.is_empty())
        .with_context(|| format!("node name not present in pod spec '{namespace}/{pod_name}'"))
}

/// Node directory backed by the Kubernetes API.
#[derive(Clone)]
pub struct NodeDirectory {
    api: Api<Node>,
    store: Arc<RwLock<NodeStore>>,
    resync: Duration,
}

impl fmt::Debug for NodeDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDirectory")
            .field("resync", &self.resync)
            .finish_non_exhaustive()
    }
}

impl NodeDirectory {
    /// Watch all nodes visible to `client`
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            store: Arc::default(),
            resync: RESYNC_PERIOD,
        }
    }

    /// change how often cached nodes are re-delivered
    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    fn reflect(&self, event: watcher::Event<Node>) -> Vec<Notification> {
        self.store.write().apply(event)
    }

    fn resync_all(&self) -> Vec<Notification> {
        self.store.read().resync()
    }
}

fn map_error(name: &str, err: kube::Error) -> DirectoryError {
    match err {
        kube::Error::Api(resp) if resp.code == 409 => DirectoryError::Conflict {
            name: name.to_owned(),
            message: resp.message,
        },
        kube::Error::Api(resp) if resp.code == 404 => DirectoryError::NotFound(name.to_owned()),
        kube::Error::SerdeError(err) => DirectoryError::Codec(err.to_string()),
        other => DirectoryError::Transport(other.to_string()),
    }
}

#[async_trait]
impl DirectoryCache for NodeDirectory {
    fn get(&self, name: &str) -> Result<Entry, DirectoryError> {
        self.store
            .read()
            .get(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_owned()))
    }

    fn has_synced(&self) -> bool {
        self.store.read().has_synced()
    }

    async fn run(
        &self,
        handler: Arc<dyn NotificationHandler>,
        token: CancellationToken,
    ) -> Result<(), DirectoryError> {
        info!(resync = ?self.resync, "starting node watcher");
        let mut stream = pin!(
            watcher(self.api.clone(), watcher::Config::default()).default_backoff()
        );
        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resync,
            self.resync,
        );

        loop {
            let notifications = tokio::select! {
                _ = token.cancelled() => {
                    debug!("node watcher stopping");
                    return Ok(());
                }
                _ = resync.tick() => self.resync_all(),
                event = stream.try_next() => match event {
                    Ok(Some(event)) => self.reflect(event),
                    Ok(None) => {
                        return Err(DirectoryError::Transport("node watch stream ended".into()));
                    }
                    Err(err) => {
                        warn!(?err, "node watch failed, backing off");
                        continue;
                    }
                },
            };
            for notification in notifications {
                handler.handle(notification).await;
            }
        }
    }
}

#[async_trait]
impl DirectoryClient for NodeDirectory {
    async fn patch(&self, name: &str, patch: &EntryPatch) -> Result<(), DirectoryError> {
        let body = patch.to_merge_patch();
        debug!(node = name, %body, "patching node");
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Strategic(&body))
            .await
            .map(|_| ())
            .map_err(|err| map_error(name, err))
    }
}
