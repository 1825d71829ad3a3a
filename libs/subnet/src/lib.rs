//! # subnet
//!
//! Types shared by every subnet manager implementation:
//!
//! - [`Lease`], [`LeaseAttrs`] and the [`Event`] stream items produced when
//!   a node's lease appears, changes or goes away.
//! - [`Config`], the network configuration read once at startup.
//! - [`SubnetManager`], the async contract a lease backend exposes to the
//!   rest of the agent.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod lease;

pub use crate::config::Config;
pub use crate::lease::{Event, EventType, LEASE_TTL_HOURS, Lease, LeaseAttrs, LeaseWatchResult};

/// A source of subnet leases for the local node and a feed of lease events
/// for the rest of the cluster.
#[async_trait]
pub trait SubnetManager: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    /// error returned by every fallible operation
    type Error: std::error::Error + Send + Sync + 'static;

    /// network configuration this manager was started with
    async fn get_network_config(&self) -> Result<Arc<Config>, Self::Error>;

    /// publish `attrs` for the local node and return its lease
    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease, Self::Error>;

    /// extend the validity of a previously acquired lease
    async fn renew_lease(&self, lease: &Lease) -> Result<(), Self::Error>;

    /// wait for the next lease event in the cluster. Returns an empty
    /// [`LeaseWatchResult`] when `cancel` fires first.
    async fn watch_leases(&self, cancel: &CancellationToken)
    -> Result<LeaseWatchResult, Self::Error>;

    /// wait for the next event concerning a single subnet
    async fn watch_lease(
        &self,
        subnet: Ipv4Net,
        cancel: &CancellationToken,
    ) -> Result<LeaseWatchResult, Self::Error>;

    /// human readable name of this manager
    fn name(&self) -> String;
}
