//! Node records as seen by the lease manager, change notifications and
//! annotation patches.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::annotations;

/// A cluster member record. Owned and versioned by the directory, the
/// manager only ever holds snapshots of it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    /// node name
    pub name: String,
    /// node annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// address block assigned by the cluster allocator, empty until assigned
    #[serde(default)]
    pub pod_cidr: String,
    /// opaque version used as the precondition for patches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl Entry {
    /// Create an entry with no annotations and no address block
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// builder style annotation setter
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// builder style address block setter
    pub fn with_pod_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.pod_cidr = cidr.into();
        self
    }

    /// annotation value, absent keys read as `""`
    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map(String::as_str).unwrap_or("")
    }

    /// true when the node opted in to subnet management
    pub fn is_managed(&self) -> bool {
        self.annotations
            .get(annotations::SUBNET_KUBE_MANAGED)
            .is_some_and(|v| v == annotations::MANAGED)
    }

    /// true when any of backend data, backend type or public ip differ
    pub fn lease_changed(&self, other: &Entry) -> bool {
        annotations::LEASE_KEYS
            .iter()
            .any(|key| self.annotation(key) != other.annotation(key))
    }
}

/// A change delivered by the directory cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// entry appeared
    Added(Entry),
    /// entry changed, or was resynced unchanged
    Updated {
        /// previous state
        old: Entry,
        /// current state
        new: Entry,
    },
    /// entry went away
    Deleted(Entry),
}

impl Notification {
    /// name of the entry this notification is about
    pub fn name(&self) -> &str {
        match self {
            Notification::Added(entry) | Notification::Deleted(entry) => &entry.name,
            Notification::Updated { new, .. } => &new.name,
        }
    }
}

/// Minimal set of annotation changes against a snapshot.
///
/// `None` values remove the key. `resource_version` is the version of the
/// snapshot the patch was computed from; directories reject the patch when
/// the stored entry has moved on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryPatch {
    /// version of the snapshot the patch is relative to
    pub resource_version: Option<String>,
    /// changed annotation keys
    pub annotations: BTreeMap<String, Option<String>>,
}

impl EntryPatch {
    /// keys of `desired` whose value differs from `snapshot`
    pub fn diff(snapshot: &Entry, desired: &BTreeMap<String, String>) -> Self {
        let annotations = desired
            .iter()
            .filter(|(key, value)| snapshot.annotations.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), Some(value.clone())))
            .collect();
        Self {
            resource_version: snapshot.resource_version.clone(),
            annotations,
        }
    }

    /// nothing to write
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// changed keys, in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.annotations.keys().map(String::as_str)
    }

    /// apply the annotation changes to `entry`
    pub fn apply_to(&self, entry: &mut Entry) {
        for (key, value) in &self.annotations {
            match value {
                Some(value) => {
                    entry.annotations.insert(key.clone(), value.clone());
                }
                None => {
                    entry.annotations.remove(key);
                }
            }
        }
    }

    /// merge patch body, also valid as a strategic merge patch for a node
    pub fn to_merge_patch(&self) -> Value {
        let annotations = self
            .annotations
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    Some(value) => Value::String(value.clone()),
                    None => Value::Null,
                };
                (key.clone(), value)
            })
            .collect::<Map<String, Value>>();

        let mut metadata = json!({ "annotations": annotations });
        if let Some(version) = &self.resource_version {
            metadata["resourceVersion"] = Value::String(version.clone());
        }
        json!({ "metadata": metadata })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::*;

    fn managed() -> Entry {
        Entry::new("node-1")
            .with_annotation(SUBNET_KUBE_MANAGED, "true")
            .with_annotation(BACKEND_TYPE, "vxlan")
            .with_annotation(BACKEND_DATA, r#"{"VNI":1}"#)
            .with_annotation(BACKEND_PUBLIC_IP, "10.0.0.5")
            .with_pod_cidr("10.1.0.0/24")
    }

    #[test]
    fn test_is_managed_requires_exact_true() {
        assert!(managed().is_managed());
        assert!(!Entry::new("n").is_managed());
        for value in ["True", "TRUE", "yes", "1", "", " true"] {
            let entry = Entry::new("n").with_annotation(SUBNET_KUBE_MANAGED, value);
            assert!(!entry.is_managed(), "{value:?} should not opt in");
        }
    }

    #[test]
    fn test_lease_changed_ignores_other_keys() {
        let old = managed();
        let new = old.clone().with_annotation("example.com/unrelated", "x");
        assert!(!old.lease_changed(&new));

        let new = old.clone().with_annotation(BACKEND_DATA, r#"{"VNI":2}"#);
        assert!(old.lease_changed(&new));

        let mut new = old.clone();
        new.annotations.remove(BACKEND_PUBLIC_IP);
        assert!(old.lease_changed(&new));
    }

    #[test]
    fn test_diff_only_changed_keys() {
        let mut snapshot = managed();
        snapshot.resource_version = Some("7".into());

        let mut desired = BTreeMap::new();
        desired.insert(BACKEND_TYPE.to_owned(), "vxlan".to_owned());
        desired.insert(BACKEND_DATA.to_owned(), r#"{"VNI":2}"#.to_owned());
        let patch = EntryPatch::diff(&snapshot, &desired);

        assert_eq!(patch.keys().collect::<Vec<_>>(), vec![BACKEND_DATA]);
        assert_eq!(patch.resource_version.as_deref(), Some("7"));

        let mut applied = snapshot.clone();
        patch.apply_to(&mut applied);
        assert_eq!(applied.annotation(BACKEND_DATA), r#"{"VNI":2}"#);
        assert_eq!(applied.annotation(BACKEND_TYPE), "vxlan");
    }

    #[test]
    fn test_diff_of_matching_state_is_empty() {
        let snapshot = managed();
        let desired = snapshot.annotations.clone();
        assert!(EntryPatch::diff(&snapshot, &desired).is_empty());
    }

    #[test]
    fn test_merge_patch_body() {
        let mut patch = EntryPatch {
            resource_version: Some("42".into()),
            ..Default::default()
        };
        patch
            .annotations
            .insert(BACKEND_PUBLIC_IP.to_owned(), Some("10.0.0.9".into()));
        patch.annotations.insert("gone".to_owned(), None);

        let body = patch.to_merge_patch();
        assert_eq!(body["metadata"]["resourceVersion"], "42");
        assert_eq!(body["metadata"]["annotations"][BACKEND_PUBLIC_IP], "10.0.0.9");
        assert!(body["metadata"]["annotations"]["gone"].is_null());

        patch.resource_version = None;
        assert!(patch.to_merge_patch()["metadata"].get("resourceVersion").is_none());
    }
}
