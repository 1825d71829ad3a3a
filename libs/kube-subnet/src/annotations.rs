//! Annotation keys read and written on node objects. Other agents in the
//! cluster read the same keys, so they must not change.

/// opt-in marker, the node is managed only when the value is exactly `"true"`
pub const SUBNET_KUBE_MANAGED: &str = "flannel.alpha.coreos.com/kube-subnet-manager";
/// raw backend payload
pub const BACKEND_DATA: &str = "flannel.alpha.coreos.com/backend-data";
/// backend tag
pub const BACKEND_TYPE: &str = "flannel.alpha.coreos.com/backend-type";
/// public address of the node
pub const BACKEND_PUBLIC_IP: &str = "flannel.alpha.coreos.com/public-ip";
/// operator override for the public address
pub const BACKEND_PUBLIC_IP_OVERWRITE: &str = "flannel.alpha.coreos.com/public-ip-overwrite";

/// value of [`SUBNET_KUBE_MANAGED`] on managed nodes
pub const MANAGED: &str = "true";

/// Keys compared when deciding whether an update changed the lease
pub const LEASE_KEYS: [&str; 3] = [BACKEND_DATA, BACKEND_TYPE, BACKEND_PUBLIC_IP];
