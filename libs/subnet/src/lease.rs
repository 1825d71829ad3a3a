//! Lease and lease-event types.
use std::{fmt, net::Ipv4Addr};

use chrono::{DateTime, Duration, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// How long an acquired lease is considered valid. Nothing renews or revokes
/// leases, the value is informational for callers.
pub const LEASE_TTL_HOURS: i64 = 24;

/// Attributes a node publishes alongside its subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAttrs {
    /// address other nodes use to reach this node
    #[serde(rename = "PublicIP")]
    pub public_ip: Ipv4Addr,
    /// backend tag, e.g. `vxlan`
    #[serde(rename = "BackendType", default)]
    pub backend_type: String,
    /// backend specific payload. Stored as raw JSON text, never interpreted here.
    #[serde(rename = "BackendData", default)]
    pub backend_data: String,
    /// operator supplied public address that wins over `public_ip`
    #[serde(
        rename = "PublicIPOverwrite",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub public_ip_overwrite: Option<Ipv4Addr>,
}

impl LeaseAttrs {
    /// Create attrs without a public ip override
    pub fn new(
        public_ip: Ipv4Addr,
        backend_type: impl Into<String>,
        backend_data: impl Into<String>,
    ) -> Self {
        Self {
            public_ip,
            backend_type: backend_type.into(),
            backend_data: backend_data.into(),
            public_ip_overwrite: None,
        }
    }

    /// backend data as it is written to the directory. An empty payload
    /// encodes as JSON `null`.
    pub fn encoded_backend_data(&self) -> &str {
        if self.backend_data.is_empty() {
            "null"
        } else {
            &self.backend_data
        }
    }
}

/// A subnet bound to a node together with its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// assigned address block
    #[serde(rename = "Subnet")]
    pub subnet: Ipv4Net,
    /// published attributes
    #[serde(rename = "Attrs")]
    pub attrs: LeaseAttrs,
    /// set on leases returned from an acquire; leases observed in the
    /// cluster carry no expiration
    #[serde(rename = "Expiration", default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl Lease {
    /// A lease observed from the cluster, without expiration
    pub fn new(subnet: Ipv4Net, attrs: LeaseAttrs) -> Self {
        Self {
            subnet,
            attrs,
            expiration: None,
        }
    }

    /// A lease valid for [`LEASE_TTL_HOURS`] starting at `now`
    pub fn acquired_at(subnet: Ipv4Net, attrs: LeaseAttrs, now: DateTime<Utc>) -> Self {
        Self {
            subnet,
            attrs,
            expiration: Some(now + Duration::hours(LEASE_TTL_HOURS)),
        }
    }
}

/// Kind of change a lease event describes. Changes to an existing lease
/// are reported as `Added`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// lease appeared or its attributes changed
    Added,
    /// lease went away
    Removed,
}

impl EventType {
    /// lowercase label, used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Removed => "removed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lease change in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// what happened
    #[serde(rename = "Type")]
    pub event_type: EventType,
    /// the lease it happened to
    #[serde(rename = "Lease")]
    pub lease: Lease,
}

impl Event {
    /// Create a new event
    pub fn new(event_type: EventType, lease: Lease) -> Self {
        Self { event_type, lease }
    }
}

/// Result of a watch call. An empty event list means the watch was
/// cancelled, which is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseWatchResult {
    /// events observed, at most one per call for the kube manager
    #[serde(rename = "Events", default)]
    pub events: Vec<Event>,
}

impl LeaseWatchResult {
    /// result carrying a single event
    pub fn single(event: Event) -> Self {
        Self {
            events: vec![event],
        }
    }

    /// true when the watch ended without an event
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_backend_data_encodes_null() {
        let attrs = LeaseAttrs::new(Ipv4Addr::new(10, 0, 0, 5), "vxlan", "");
        assert_eq!(attrs.encoded_backend_data(), "null");

        let attrs = LeaseAttrs::new(Ipv4Addr::new(10, 0, 0, 5), "vxlan", r#"{"VNI":1}"#);
        assert_eq!(attrs.encoded_backend_data(), r#"{"VNI":1}"#);
    }

    #[test]
    fn test_acquired_lease_expires_a_day_later() {
        let now = Utc::now();
        let lease = Lease::acquired_at(
            "10.1.0.0/24".parse().unwrap(),
            LeaseAttrs::new(Ipv4Addr::new(10, 0, 0, 5), "vxlan", ""),
            now,
        );
        assert_eq!(lease.expiration, Some(now + Duration::hours(24)));
        assert_eq!(Lease::new(lease.subnet, lease.attrs).expiration, None);
    }

    #[test]
    fn test_attrs_json_field_names() {
        let attrs = LeaseAttrs::new(Ipv4Addr::new(10, 0, 0, 5), "vxlan", "{}");
        let json = serde_json::to_string(&attrs).unwrap();
        assert!(json.contains("\"PublicIP\":\"10.0.0.5\""));
        assert!(json.contains("\"BackendType\":\"vxlan\""));
        assert!(!json.contains("PublicIPOverwrite"));
    }

    #[test]
    fn test_watch_result() {
        assert!(LeaseWatchResult::default().is_empty());
        let lease = Lease::new(
            "10.1.0.0/24".parse().unwrap(),
            LeaseAttrs::new(Ipv4Addr::new(10, 0, 0, 5), "vxlan", ""),
        );
        let res = LeaseWatchResult::single(Event::new(EventType::Removed, lease));
        assert_eq!(res.events.len(), 1);
        assert_eq!(res.events[0].event_type.to_string(), "removed");
    }
}
