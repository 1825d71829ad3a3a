//! Local mirror of the node list, fed by watcher events.
use std::collections::HashMap;

use k8s_openapi::api::core::v1::Node;
use kube::{ResourceExt, runtime::watcher};
use kube_subnet::{Entry, Notification};

/// Project a node onto the fields the lease manager reads.
pub fn node_to_entry(node: &Node) -> Entry {
    Entry {
        name: node.name_any(),
        annotations: node.annotations().clone(),
        pod_cidr: node
            .spec
            .as_ref()
            .and_then(|spec| spec.pod_cidr.clone())
            .unwrap_or_default(),
        resource_version: node.resource_version(),
    }
}

#[derive(Debug, Default)]
pub(crate) struct NodeStore {
    entries: HashMap<String, Entry>,
    // nodes listed so far during a (re)list, swapped in on `InitDone`
    init: Option<HashMap<String, Entry>>,
    synced: bool,
}

impl NodeStore {
    pub(crate) fn get(&self, name: &str) -> Option<Entry> {
        self.entries.get(name).cloned()
    }

    pub(crate) fn has_synced(&self) -> bool {
        self.synced
    }

    /// Update the mirror and return the notifications to deliver, in order.
    pub(crate) fn apply(&mut self, event: watcher::Event<Node>) -> Vec<Notification> {
        match event {
            watcher::Event::Init => {
                self.init = Some(HashMap::new());
                Vec::new()
            }
            watcher::Event::InitApply(node) => {
                let entry = node_to_entry(&node);
                self.init
                    .get_or_insert_with(HashMap::new)
                    .insert(entry.name.clone(), entry);
                Vec::new()
            }
            watcher::Event::InitDone => {
                let listed = self.init.take().unwrap_or_default();
                let mut notifications = self
                    .entries
                    .values()
                    .filter(|old| !listed.contains_key(&old.name))
                    .map(|old| Notification::Deleted(old.clone()))
                    .collect::<Vec<_>>();
                let mut names = listed.keys().cloned().collect::<Vec<_>>();
                names.sort();
                for name in names {
                    let new = listed[&name].clone();
                    notifications.push(match self.entries.get(&name) {
                        Some(old) => Notification::Updated {
                            old: old.clone(),
                            new,
                        },
                        None => Notification::Added(new),
                    });
                }
                self.entries = listed;
                self.synced = true;
                notifications
            }
            watcher::Event::Apply(node) => {
                let entry = node_to_entry(&node);
                match self.entries.insert(entry.name.clone(), entry.clone()) {
                    Some(old) => vec![Notification::Updated { old, new: entry }],
                    None => vec![Notification::Added(entry)],
                }
            }
            watcher::Event::Delete(node) => {
                let entry = node_to_entry(&node);
                self.entries.remove(&entry.name);
                vec![Notification::Deleted(entry)]
            }
        }
    }

    /// Re-deliver every cached node as an unchanged update.
    pub(crate) fn resync(&self) -> Vec<Notification> {
        let mut entries = self.entries.values().cloned().collect::<Vec<_>>();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
            .into_iter()
            .map(|entry| Notification::Updated {
                old: entry.clone(),
                new: entry,
            })
            .collect()
    }
}
