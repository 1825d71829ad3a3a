//! Turns node notifications into lease events.
use std::net::{AddrParseError, Ipv4Addr};

use async_trait::async_trait;
use ipnet::{AddrParseError as NetParseError, Ipv4Net};
use subnet::{Event, EventType, Lease, LeaseAttrs};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    annotations,
    directory::NotificationHandler,
    entry::{Entry, Notification},
    metrics,
    queue::EventSender,
};

/// Why a managed node could not be turned into a lease.
#[derive(Debug, Error)]
pub enum LeaseParseError {
    #[error("invalid public ip {value:?}: {source}")]
    PublicIp {
        value: String,
        source: AddrParseError,
    },
    #[error("invalid pod cidr {value:?}: {source}")]
    PodCidr {
        value: String,
        source: NetParseError,
    },
}

/// Build the lease described by a node's annotations and address block.
///
/// Backend data is passed through as-is. An override annotation that does
/// not parse is ignored rather than failing the lease.
pub fn entry_to_lease(entry: &Entry) -> Result<Lease, LeaseParseError> {
    let public_ip = entry.annotation(annotations::BACKEND_PUBLIC_IP);
    let public_ip = public_ip
        .parse::<Ipv4Addr>()
        .map_err(|source| LeaseParseError::PublicIp {
            value: public_ip.to_owned(),
            source,
        })?;

    let subnet = entry
        .pod_cidr
        .parse::<Ipv4Net>()
        .map_err(|source| LeaseParseError::PodCidr {
            value: entry.pod_cidr.clone(),
            source,
        })?
        .trunc();

    let overwrite = entry.annotation(annotations::BACKEND_PUBLIC_IP_OVERWRITE);
    let public_ip_overwrite = if overwrite.is_empty() {
        None
    } else {
        match overwrite.parse::<Ipv4Addr>() {
            Ok(ip) => Some(ip),
            Err(err) => {
                debug!(node = %entry.name, ?err, overwrite, "ignoring unparseable public ip overwrite");
                None
            }
        }
    };

    Ok(Lease::new(
        subnet,
        LeaseAttrs {
            public_ip,
            backend_type: entry.annotation(annotations::BACKEND_TYPE).to_owned(),
            backend_data: entry.annotation(annotations::BACKEND_DATA).to_owned(),
            public_ip_overwrite,
        },
    ))
}

/// Handles node notifications and pushes the resulting lease events.
#[derive(Debug, Clone)]
pub struct Translator {
    events: EventSender,
}

impl Translator {
    /// Create a translator feeding `events`
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    /// a node appeared
    pub async fn on_add(&self, entry: &Entry) {
        self.emit(EventType::Added, entry).await
    }

    /// a node went away
    pub async fn on_delete(&self, entry: &Entry) {
        self.emit(EventType::Removed, entry).await
    }

    /// A node changed. Only changes to backend data, backend type or public
    /// ip produce an event, and that event is `Added`.
    pub async fn on_update(&self, old: &Entry, new: &Entry) {
        if !new.is_managed() {
            return;
        }
        if !old.lease_changed(new) {
            trace!(node = %new.name, "no change to lease");
            metrics::UPDATES_SUPPRESSED.inc();
            return;
        }
        self.emit_managed(EventType::Added, new).await
    }

    async fn emit(&self, event_type: EventType, entry: &Entry) {
        if !entry.is_managed() {
            return;
        }
        self.emit_managed(event_type, entry).await
    }

    async fn emit_managed(&self, event_type: EventType, entry: &Entry) {
        let lease = match entry_to_lease(entry) {
            Ok(lease) => lease,
            Err(err) => {
                info!(node = %entry.name, %err, "error turning node to lease");
                metrics::MALFORMED_ENTRIES.inc();
                return;
            }
        };
        debug!(node = %entry.name, %event_type, subnet = %lease.subnet, "lease event");
        if self.events.push(Event::new(event_type, lease)).await {
            metrics::LEASE_EVENTS
                .with_label_values(&[event_type.as_str()])
                .inc();
        } else {
            warn!(node = %entry.name, "lease event dropped, event queue closed");
        }
    }
}

#[async_trait]
impl NotificationHandler for Translator {
    async fn handle(&self, notification: Notification) {
        match notification {
            Notification::Added(entry) => self.on_add(&entry).await,
            Notification::Updated { old, new } => self.on_update(&old, &new).await,
            Notification::Deleted(entry) => self.on_delete(&entry).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use super::*;
    use crate::annotations::*;
    use crate::queue::{self, EventReceiver};

    fn node_1() -> Entry {
        Entry::new("node-1")
            .with_annotation(SUBNET_KUBE_MANAGED, "true")
            .with_annotation(BACKEND_TYPE, "vxlan")
            .with_annotation(BACKEND_DATA, r#"{"VNI":1}"#)
            .with_annotation(BACKEND_PUBLIC_IP, "10.0.0.5")
            .with_pod_cidr("10.1.0.0/24")
    }

    fn translator() -> (Translator, EventReceiver) {
        let (tx, rx) = queue::channel(16);
        (Translator::new(tx), rx)
    }

    async fn drain(rx: &EventReceiver) -> Vec<Event> {
        let token = CancellationToken::new();
        let mut events = Vec::new();
        while !rx.is_empty() {
            events.push(rx.pop(&token).await.unwrap());
        }
        events
    }

    #[test]
    fn test_entry_to_lease() {
        let lease = entry_to_lease(&node_1()).unwrap();
        assert_eq!(lease.subnet, "10.1.0.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(lease.attrs.public_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(lease.attrs.backend_type, "vxlan");
        assert_eq!(lease.attrs.backend_data, r#"{"VNI":1}"#);
        assert_eq!(lease.attrs.public_ip_overwrite, None);
        assert_eq!(lease.expiration, None);
    }

    #[test]
    fn test_entry_to_lease_overwrite() {
        let entry = node_1().with_annotation(BACKEND_PUBLIC_IP_OVERWRITE, "192.168.0.9");
        let lease = entry_to_lease(&entry).unwrap();
        assert_eq!(
            lease.attrs.public_ip_overwrite,
            Some(Ipv4Addr::new(192, 168, 0, 9))
        );

        let entry = node_1().with_annotation(BACKEND_PUBLIC_IP_OVERWRITE, "nope");
        assert_eq!(entry_to_lease(&entry).unwrap().attrs.public_ip_overwrite, None);
    }

    #[test]
    fn test_entry_to_lease_errors() {
        let entry = node_1().with_annotation(BACKEND_PUBLIC_IP, "10.0.0");
        assert!(matches!(
            entry_to_lease(&entry),
            Err(LeaseParseError::PublicIp { .. })
        ));

        let entry = node_1().with_annotation(BACKEND_PUBLIC_IP, "fd00::1");
        assert!(matches!(
            entry_to_lease(&entry),
            Err(LeaseParseError::PublicIp { .. })
        ));

        let entry = node_1().with_pod_cidr("");
        assert!(matches!(
            entry_to_lease(&entry),
            Err(LeaseParseError::PodCidr { .. })
        ));
    }

    #[tokio::test]
    async fn test_unmanaged_nodes_are_invisible() {
        let (translator, rx) = translator();
        let mut unmanaged = node_1();
        unmanaged.annotations.remove(SUBNET_KUBE_MANAGED);
        let wrong_value = node_1().with_annotation(SUBNET_KUBE_MANAGED, "false");

        for entry in [&unmanaged, &wrong_value] {
            translator.on_add(entry).await;
            translator.on_delete(entry).await;
            let changed = entry.clone().with_annotation(BACKEND_DATA, r#"{"VNI":9}"#);
            translator.on_update(entry, &changed).await;
        }
        assert!(drain(&rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_delete() {
        let (translator, rx) = translator();
        translator.on_add(&node_1()).await;
        translator.on_delete(&node_1()).await;

        let events = drain(&rx).await;
        let lease = entry_to_lease(&node_1()).unwrap();
        assert_eq!(
            events,
            vec![
                Event::new(EventType::Added, lease.clone()),
                Event::new(EventType::Removed, lease),
            ]
        );
    }

    #[tokio::test]
    async fn test_update_scenario() {
        let (translator, rx) = translator();
        let v1 = node_1();
        translator.handle(Notification::Added(v1.clone())).await;

        // unrelated annotation only
        let v2 = v1.clone().with_annotation("example.com/owner", "ops");
        translator
            .handle(Notification::Updated {
                old: v1.clone(),
                new: v2.clone(),
            })
            .await;

        // backend data changes
        let v3 = v2.clone().with_annotation(BACKEND_DATA, r#"{"VNI":2}"#);
        translator
            .handle(Notification::Updated {
                old: v2,
                new: v3.clone(),
            })
            .await;

        let events = drain(&rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Added);
        assert_eq!(events[0].lease.attrs.backend_data, r#"{"VNI":1}"#);
        assert_eq!(events[1].event_type, EventType::Added);
        assert_eq!(events[1].lease.attrs.backend_data, r#"{"VNI":2}"#);
        assert_eq!(events[1].lease.subnet, "10.1.0.0/24".parse::<Ipv4Net>().unwrap());
    }

    #[tokio::test]
    async fn test_update_to_newly_managed_node() {
        let (translator, rx) = translator();
        let old = Entry::new("node-2").with_pod_cidr("10.1.1.0/24");
        let new = old
            .clone()
            .with_annotation(SUBNET_KUBE_MANAGED, "true")
            .with_annotation(BACKEND_TYPE, "vxlan")
            .with_annotation(BACKEND_PUBLIC_IP, "10.0.0.6");
        translator.on_update(&old, &new).await;

        let events = drain(&rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Added);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_entry_does_not_stop_processing() {
        let (translator, rx) = translator();
        let bad = node_1().with_annotation(BACKEND_PUBLIC_IP, "not-an-ip");
        translator.on_add(&bad).await;
        translator.on_add(&node_1()).await;

        let events = drain(&rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].lease.attrs.public_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert!(logs_contain("error turning node to lease"));
    }
}
