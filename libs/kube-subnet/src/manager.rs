//! The kube subnet manager: lease acquisition for the local node and the
//! lease event feed for the rest of the cluster.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use ipnet::Ipv4Net;
use subnet::{Config, Lease, LeaseAttrs, LeaseWatchResult, SubnetManager};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    annotations,
    directory::{DirectoryCache, DirectoryClient},
    entry::{Entry, EntryPatch},
    error::SubnetError,
    metrics,
    queue::{self, EVENT_QUEUE_CAPACITY, EventReceiver},
    translate::Translator,
};

/// Resync interval a directory cache is expected to use.
pub const RESYNC_PERIOD: Duration = Duration::from_secs(5 * 60);
/// How long startup waits for the node cache to sync.
pub const NODE_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// How often startup checks whether the node cache has synced.
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(1);
// a zero period would make `tokio::time::interval` panic
const MIN_SYNC_POLL: Duration = Duration::from_millis(1);

/// What to do when a lease patch loses against a concurrent write.
///
/// With `max_retries == 0` (the default) the conflict goes back to the
/// caller unchanged. Otherwise the lease is recomputed from a fresh snapshot
/// after `base_delay * 2^(attempt - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after a conflicting patch.
    pub max_retries: u32,
    /// Base delay between retries (actual delay uses exponential backoff).
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Subnet manager storing leases in node annotations.
///
/// Holds the directory handle, the local node name and the event queue. The
/// directory's delivery loop is driven by [`KubeSubnetManager::run`], which
/// callers spawn on a background task.
#[derive(Debug)]
pub struct KubeSubnetManager<D> {
    directory: Arc<D>,
    node_name: String,
    config: Arc<Config>,
    translator: Translator,
    events: EventReceiver,
    retry_policy: RetryPolicy,
}

impl<D> KubeSubnetManager<D>
where
    D: DirectoryCache + DirectoryClient,
{
    /// Create a manager for `node_name` with the default queue size and
    /// retry policy.
    pub fn new(directory: Arc<D>, config: Arc<Config>, node_name: impl Into<String>) -> Self {
        Self::with_capacity(directory, config, node_name, EVENT_QUEUE_CAPACITY)
    }

    /// Create a manager with an event queue of `capacity` events
    pub fn with_capacity(
        directory: Arc<D>,
        config: Arc<Config>,
        node_name: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let (tx, events) = queue::channel(capacity);
        Self {
            directory,
            node_name: node_name.into(),
            config,
            translator: Translator::new(tx),
            events,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// replace the conflict retry policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// the local node
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// the directory this manager reads and writes
    pub fn directory(&self) -> &Arc<D> {
        &self.directory
    }

    /// Run the directory's delivery loop, feeding the event queue, until
    /// `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<(), SubnetError> {
        info!(node = %self.node_name, "starting kube subnet manager");
        self.directory
            .run(Arc::new(self.translator.clone()), token)
            .await?;
        debug!("kube subnet manager stopped");
        Ok(())
    }

    /// Poll the directory every `poll` (at least 1ms) until its initial sync
    /// completes, failing after `timeout`.
    pub async fn wait_for_sync(&self, timeout: Duration, poll: Duration) -> Result<(), SubnetError> {
        info!(?timeout, "waiting for node cache to sync");
        let poll = poll.max(MIN_SYNC_POLL);
        let wait = async {
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                if self.directory.has_synced() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SubnetError::SyncTimeout(timeout))?;
        info!("node cache sync successful");
        Ok(())
    }

    /// Publish `attrs` on the local node and return its lease.
    ///
    /// Writes nothing when the node already carries the desired
    /// annotations. The returned lease holds the caller's `attrs`, not a
    /// value read back from the directory.
    pub async fn acquire(&self, attrs: &LeaseAttrs) -> Result<Lease, SubnetError> {
        let mut attempts = 0u32;
        loop {
            match self.acquire_once(attrs).await {
                Err(SubnetError::Directory(err))
                    if err.is_conflict() && self.retry_policy.max_retries > 0 =>
                {
                    attempts += 1;
                    if attempts > self.retry_policy.max_retries {
                        return Err(SubnetError::MaxRetriesExhausted {
                            attempts,
                            source: err,
                        });
                    }
                    let delay = self.retry_policy.base_delay * 2u32.saturating_pow(attempts - 1);
                    warn!(node = %self.node_name, %err, attempts, ?delay, "lease patch conflicted, retrying");
                    tokio::time::sleep(delay).await;
                }
                res => return res,
            }
        }
    }

    async fn acquire_once(&self, attrs: &LeaseAttrs) -> Result<Lease, SubnetError> {
        let snapshot = self.directory.get(&self.node_name)?;

        if snapshot.pod_cidr.is_empty() {
            return Err(SubnetError::NotAssigned(self.node_name.clone()));
        }
        let subnet = snapshot
            .pod_cidr
            .parse::<Ipv4Net>()
            .map_err(|_| SubnetError::InvalidCidr {
                node: self.node_name.clone(),
                cidr: snapshot.pod_cidr.clone(),
            })?
            .trunc();

        let desired = desired_annotations(&snapshot, attrs);
        let patch = EntryPatch::diff(&snapshot, &desired);

        if patch.is_empty() {
            debug!(node = %self.node_name, "lease annotations up to date, skipping patch");
            metrics::PATCHES_SKIPPED.inc();
        } else {
            if let Err(err) = self.directory.patch(&self.node_name, &patch).await {
                metrics::PATCH_ERRORS.inc();
                if err.is_conflict() {
                    metrics::PATCH_CONFLICTS.inc();
                }
                return Err(err.into());
            }
            metrics::PATCHES_APPLIED.inc();
            info!(node = %self.node_name, keys = ?patch.keys().collect::<Vec<_>>(), "patched lease annotations");
        }

        Ok(Lease::acquired_at(subnet, attrs.clone(), Utc::now()))
    }

    /// Wait for the next lease event or `cancel`. Cancellation, and a queue
    /// whose producer is gone, return an empty result.
    pub async fn next_event(&self, cancel: &CancellationToken) -> LeaseWatchResult {
        match self.events.pop(cancel).await {
            Some(event) => LeaseWatchResult::single(event),
            None => LeaseWatchResult::default(),
        }
    }
}

/// Annotations the local node should carry for `attrs`. A non-empty
/// override annotation replaces the public ip from `attrs`.
fn desired_annotations(snapshot: &Entry, attrs: &LeaseAttrs) -> BTreeMap<String, String> {
    let public_ip = attrs.public_ip.to_string();
    let overwrite = snapshot.annotation(annotations::BACKEND_PUBLIC_IP_OVERWRITE);
    let public_ip = if overwrite.is_empty() {
        public_ip
    } else {
        if snapshot.annotation(annotations::BACKEND_PUBLIC_IP) != overwrite {
            info!(
                node = %snapshot.name,
                overwrite,
                requested = %public_ip,
                "overriding public ip from node annotation {}",
                annotations::BACKEND_PUBLIC_IP_OVERWRITE
            );
        }
        overwrite.to_owned()
    };

    BTreeMap::from([
        (
            annotations::BACKEND_TYPE.to_owned(),
            attrs.backend_type.clone(),
        ),
        (
            annotations::BACKEND_DATA.to_owned(),
            attrs.encoded_backend_data().to_owned(),
        ),
        (annotations::BACKEND_PUBLIC_IP.to_owned(), public_ip),
        (
            annotations::SUBNET_KUBE_MANAGED.to_owned(),
            annotations::MANAGED.to_owned(),
        ),
    ])
}

#[async_trait]
impl<D> SubnetManager for KubeSubnetManager<D>
where
    D: DirectoryCache + DirectoryClient,
{
    type Error = SubnetError;

    async fn get_network_config(&self) -> Result<Arc<Config>, SubnetError> {
        Ok(Arc::clone(&self.config))
    }

    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease, SubnetError> {
        self.acquire(attrs).await
    }

    async fn renew_lease(&self, _lease: &Lease) -> Result<(), SubnetError> {
        Err(SubnetError::Unsupported("renew lease"))
    }

    async fn watch_leases(
        &self,
        cancel: &CancellationToken,
    ) -> Result<LeaseWatchResult, SubnetError> {
        Ok(self.next_event(cancel).await)
    }

    async fn watch_lease(
        &self,
        _subnet: Ipv4Net,
        _cancel: &CancellationToken,
    ) -> Result<LeaseWatchResult, SubnetError> {
        Err(SubnetError::Unsupported("watch lease"))
    }

    fn name(&self) -> String {
        format!("Kubernetes Subnet Manager - {}", self.node_name)
    }
}
