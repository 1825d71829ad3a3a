//! Lease manager metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.
#![allow(missing_docs)]

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// process uptime in seconds, refreshed on every scrape
    pub static ref UPTIME: IntGauge = register_int_gauge!("kube_subnet_uptime", "process uptime (seconds)").unwrap();

    /// lease events pushed onto the event queue, labelled by event type
    pub static ref LEASE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "kube_subnet_lease_events",
        "count of lease events emitted from node notifications",
        &["type"]
    ).unwrap();

    /// managed nodes whose annotations could not be turned into a lease
    pub static ref MALFORMED_ENTRIES: IntCounter = register_int_counter!(
        "kube_subnet_malformed_entries",
        "count of managed nodes dropped because their lease could not be parsed"
    ).unwrap();

    /// node updates that left backend data, type and public ip alone
    pub static ref UPDATES_SUPPRESSED: IntCounter = register_int_counter!(
        "kube_subnet_updates_suppressed",
        "count of node updates dropped because the lease did not change"
    ).unwrap();

    pub static ref PATCHES_APPLIED: IntCounter = register_int_counter!(
        "kube_subnet_patches_applied",
        "count of annotation patches written for the local node"
    ).unwrap();

    pub static ref PATCHES_SKIPPED: IntCounter = register_int_counter!(
        "kube_subnet_patches_skipped",
        "count of lease acquisitions that needed no write"
    ).unwrap();

    pub static ref PATCH_ERRORS: IntCounter = register_int_counter!(
        "kube_subnet_patch_errors",
        "count of annotation patches rejected by the directory"
    ).unwrap();

    pub static ref PATCH_CONFLICTS: IntCounter = register_int_counter!(
        "kube_subnet_patch_conflicts",
        "count of annotation patches rejected because the node changed underneath"
    ).unwrap();
}
