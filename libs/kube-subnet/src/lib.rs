//! # kube-subnet
//!
//! Subnet lease coordination that keeps every lease in the annotations of
//! the cluster's node objects instead of a dedicated lease store.
//!
//! The crate is organised around three paths:
//! - **translate**: node change notifications from a watched cache become
//!   typed lease [`Event`]s. Nodes that did not opt in are ignored and
//!   updates that leave the lease untouched are dropped, which also absorbs
//!   the echo of our own writes.
//! - **queue**: a bounded channel turns the serial push feed of the cache
//!   into a cancellable pull API.
//! - **acquire**: the local node's annotations are diffed against the
//!   desired lease and a minimal conditional patch is sent only when
//!   something changed.
//!
//! The directory itself sits behind the [`DirectoryCache`] and
//! [`DirectoryClient`] traits. [`memory::MemoryDirectory`] implements both
//! in process.
//!
//! [`Event`]: subnet::Event
//! [`DirectoryCache`]: crate::directory::DirectoryCache
//! [`DirectoryClient`]: crate::directory::DirectoryClient

pub mod annotations;
pub mod directory;
pub mod entry;
pub mod error;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod translate;

pub use directory::{DirectoryCache, DirectoryClient, DirectoryError, NotificationHandler};
pub use entry::{Entry, EntryPatch, Notification};
pub use error::SubnetError;
pub use manager::{
    KubeSubnetManager, NODE_CACHE_SYNC_TIMEOUT, RESYNC_PERIOD, RetryPolicy, SYNC_POLL_INTERVAL,
};
pub use queue::{EVENT_QUEUE_CAPACITY, EventReceiver, EventSender};
pub use translate::Translator;
