//! Figure out which node this process manages.
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use kube_directory::Client;
use tracing::info;

/// finds the node a pod is scheduled on
#[async_trait]
pub trait PodLookup {
    async fn node_name(&self, namespace: &str, pod_name: &str) -> Result<String>;
}

#[async_trait]
impl PodLookup for Client {
    async fn node_name(&self, namespace: &str, pod_name: &str) -> Result<String> {
        kube_directory::pod_node_name(self.clone(), namespace, pod_name).await
    }
}

/// An explicit node name wins. Otherwise we are running as a pod and the
/// node comes from our own pod spec.
pub async fn resolve_node_name(
    node_name: Option<&str>,
    pod_name: Option<&str>,
    pod_namespace: Option<&str>,
    lookup: &(impl PodLookup + Sync),
) -> Result<String> {
    if let Some(name) = node_name.filter(|name| !name.is_empty()) {
        return Ok(name.to_owned());
    }
    let (Some(pod_name), Some(namespace)) = (
        pod_name.filter(|name| !name.is_empty()),
        pod_namespace.filter(|ns| !ns.is_empty()),
    ) else {
        bail!("env variables POD_NAME and POD_NAMESPACE must be set");
    };
    let node = lookup
        .node_name(namespace, pod_name)
        .await
        .context("unable to resolve node name from pod")?;
    info!(%node, pod = pod_name, %namespace, "resolved node name from pod spec");
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeLookup(Option<&'static str>);

    #[async_trait]
    impl PodLookup for FakeLookup {
        async fn node_name(&self, namespace: &str, pod_name: &str) -> Result<String> {
            match self.0 {
                Some(node) => Ok(node.to_owned()),
                None => bail!("error retrieving pod spec for '{namespace}/{pod_name}'"),
            }
        }
    }

    #[tokio::test]
    async fn test_explicit_node_name() {
        let node = resolve_node_name(Some("node-1"), None, None, &FakeLookup(None))
            .await
            .unwrap();
        assert_eq!(node, "node-1");
    }

    #[tokio::test]
    async fn test_node_name_from_pod() {
        let node = resolve_node_name(
            Some(""),
            Some("kube-flannel-abcde"),
            Some("kube-system"),
            &FakeLookup(Some("node-2")),
        )
        .await
        .unwrap();
        assert_eq!(node, "node-2");
    }

    #[tokio::test]
    async fn test_missing_pod_env() {
        let err = resolve_node_name(None, Some("kube-flannel-abcde"), None, &FakeLookup(None))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "env variables POD_NAME and POD_NAMESPACE must be set"
        );
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let err = resolve_node_name(None, Some("p"), Some("ns"), &FakeLookup(None))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("error retrieving pod spec for 'ns/p'"));
    }
}
