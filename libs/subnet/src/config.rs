//! network configuration
use std::{net::Ipv4Addr, path::Path};

use anyhow::{Context, Result, bail};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// backend used when the config does not name one
pub const DEFAULT_BACKEND_TYPE: &str = "udp";

/// Resolved network configuration. Defaults are filled in and the subnet
/// range is checked against the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// cluster wide network every node subnet is carved from
    pub network: Ipv4Net,
    /// lowest subnet address handed out
    pub subnet_min: Ipv4Addr,
    /// highest subnet address handed out
    pub subnet_max: Ipv4Addr,
    /// prefix length of each node subnet
    pub subnet_len: u8,
    /// `Type` of the backend section
    pub backend_type: String,
    /// raw backend section
    pub backend: Option<serde_json::Value>,
}

pub mod wire {
    //! on-disk shape of the config file
    use super::*;

    /// network config as written in `net-conf.json`
    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct NetConf {
        /// cluster network
        pub network: Ipv4Net,
        /// lowest subnet, defaults to the second subnet of the network
        #[serde(default)]
        pub subnet_min: Option<Ipv4Addr>,
        /// highest subnet, defaults to the last subnet of the network
        #[serde(default)]
        pub subnet_max: Option<Ipv4Addr>,
        /// per node prefix length, 0 means pick one
        #[serde(default)]
        pub subnet_len: u8,
        /// backend section, only `Type` is read here
        #[serde(default)]
        pub backend: Option<serde_json::Value>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct BackendType {
        #[serde(rename = "Type", default)]
        pub(super) ty: String,
    }
}

impl Config {
    /// read and parse the config file at `path`
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read net conf at {}", path.display()))?;
        Self::parse_str(s)
    }

    /// parse a config from a JSON string
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let conf: wire::NetConf =
            serde_json::from_str(s.as_ref()).context("error parsing subnet config")?;
        let config = Self::try_from(conf)?;
        debug!(?config);
        Ok(config)
    }

    /// number of addresses in each node subnet
    fn subnet_size(&self) -> u32 {
        1u32 << (32 - u32::from(self.subnet_len))
    }
}

impl TryFrom<wire::NetConf> for Config {
    type Error = anyhow::Error;

    fn try_from(conf: wire::NetConf) -> Result<Self> {
        let network = conf.network.trunc();
        let prefix = network.prefix_len();

        let subnet_len = if conf.subnet_len > 0 {
            if conf.subnet_len > 32 {
                bail!("SubnetLen {} is not a valid prefix length", conf.subnet_len);
            }
            if conf.subnet_len < prefix {
                bail!("Network must be able to accommodate at least one subnet");
            }
            conf.subnet_len
        } else if prefix < 24 {
            // give each host a /24 unless the whole network is that small
            24
        } else {
            // otherwise split the network in half
            (prefix + 1).min(32)
        };

        let backend_type = match &conf.backend {
            None => DEFAULT_BACKEND_TYPE.to_owned(),
            Some(value) => {
                serde_json::from_value::<wire::BackendType>(value.clone())
                    .context("error decoding Backend property of config")?
                    .ty
            }
        };

        let mut config = Config {
            network,
            subnet_min: Ipv4Addr::UNSPECIFIED,
            subnet_max: Ipv4Addr::UNSPECIFIED,
            subnet_len,
            backend_type,
            backend: conf.backend,
        };
        let size = config.subnet_size();

        config.subnet_min = match conf.subnet_min {
            // skip the first subnet, it would collide with the network address
            None => Ipv4Addr::from(u32::from(network.network()).wrapping_add(size)),
            Some(min) if !network.contains(&min) => {
                bail!("SubnetMin is not in the range of the Network")
            }
            Some(min) => min,
        };
        config.subnet_max = match conf.subnet_max {
            None => Ipv4Addr::from(
                u32::from(network.broadcast())
                    .wrapping_add(1)
                    .wrapping_sub(size),
            ),
            Some(max) if !network.contains(&max) => {
                bail!("SubnetMax is not in the range of the Network")
            }
            Some(max) => max,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_large_network() {
        let cfg = Config::parse_str(r#"{"Network": "10.244.0.0/16"}"#).unwrap();
        assert_eq!(cfg.subnet_len, 24);
        assert_eq!(cfg.subnet_min, Ipv4Addr::new(10, 244, 1, 0));
        assert_eq!(cfg.subnet_max, Ipv4Addr::new(10, 244, 255, 0));
        assert_eq!(cfg.backend_type, "udp");
        assert!(cfg.backend.is_none());
    }

    #[test]
    fn test_small_network_is_halved() {
        let cfg = Config::parse_str(r#"{"Network": "10.3.0.0/24"}"#).unwrap();
        assert_eq!(cfg.subnet_len, 25);
        assert_eq!(cfg.subnet_min, Ipv4Addr::new(10, 3, 0, 128));
        assert_eq!(cfg.subnet_max, Ipv4Addr::new(10, 3, 0, 128));
    }

    #[test]
    fn test_backend_type() {
        let cfg = Config::parse_str(
            r#"{"Network": "10.244.0.0/16", "Backend": {"Type": "vxlan", "VNI": 4}}"#,
        )
        .unwrap();
        assert_eq!(cfg.backend_type, "vxlan");
        assert_eq!(cfg.backend.unwrap()["VNI"], 4);
    }

    #[test]
    fn test_explicit_range() {
        let cfg = Config::parse_str(
            r#"{"Network": "10.0.0.0/8", "SubnetLen": 20, "SubnetMin": "10.10.0.0", "SubnetMax": "10.99.0.0"}"#,
        )
        .unwrap();
        assert_eq!(cfg.subnet_len, 20);
        assert_eq!(cfg.subnet_min, Ipv4Addr::new(10, 10, 0, 0));
        assert_eq!(cfg.subnet_max, Ipv4Addr::new(10, 99, 0, 0));
    }

    #[test]
    fn test_invalid_configs() {
        // subnet larger than network
        assert!(Config::parse_str(r#"{"Network": "10.1.0.0/16", "SubnetLen": 8}"#).is_err());
        // range outside the network
        assert!(
            Config::parse_str(r#"{"Network": "10.1.0.0/16", "SubnetMin": "10.2.0.0"}"#).is_err()
        );
        assert!(
            Config::parse_str(r#"{"Network": "10.1.0.0/16", "SubnetMax": "11.0.0.0"}"#).is_err()
        );
        // missing network
        assert!(Config::parse_str(r#"{"SubnetLen": 24}"#).is_err());
        // backend must be an object
        assert!(Config::parse_str(r#"{"Network": "10.1.0.0/16", "Backend": 3}"#).is_err());
        assert!(Config::parse_str("not json").is_err());
    }

    #[test]
    fn test_parse_missing_file() {
        let err = Config::parse("/nonexistent/net-conf.json").unwrap_err();
        assert!(format!("{err}").contains("failed to read net conf"));
    }
}
