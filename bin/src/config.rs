//! subnet manager process configs

pub mod cli {
    //! Parse from either cli or env var

    /// default location of the network config inside the daemonset pod
    pub static DEFAULT_NET_CONF_PATH: &str = "/etc/kube-flannel/net-conf.json";
    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "kube-subnet-worker";
    /// default log level. Can use this argument or SUBNET_LOG env var
    pub const DEFAULT_SUBNET_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub static DEFAULT_LOG_FORMAT: &str = "standard";
    /// how long to wait for the node cache before giving up, in seconds
    pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 10 * 60;
    /// how often to check whether the node cache synced, in millis
    pub const DEFAULT_SYNC_POLL_MS: u64 = 1_000;

    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "kube-subnet-mgr", bin_name = "kube-subnet-mgr", about, long_about = None)]
    /// parses from cli & environment var. `.env` in the working dir is loaded as well
    pub struct Config {
        /// path to the network config json
        #[clap(long, env, value_parser, default_value = DEFAULT_NET_CONF_PATH)]
        pub net_conf_path: PathBuf,
        /// address of the kubernetes API server, overrides the kubeconfig
        #[clap(long, env, value_parser)]
        pub kube_api_url: Option<String>,
        /// kubeconfig to use when running outside the cluster
        #[clap(long, env, value_parser)]
        pub kubeconfig: Option<PathBuf>,
        /// name of the node we run on, looked up from the pod otherwise
        #[clap(long, env, value_parser)]
        pub node_name: Option<String>,
        /// name of our own pod
        #[clap(long, env, value_parser)]
        pub pod_name: Option<String>,
        /// namespace of our own pod
        #[clap(long, env, value_parser)]
        pub pod_namespace: Option<String>,
        /// the address to serve health and metrics on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of cpus
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_SUBNET_LOG)]
        pub subnet_log: String,
        /// log format, one of "standard", "json" or "pretty"
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        /// seconds to wait for the initial node list
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SYNC_TIMEOUT_SECS)]
        pub sync_timeout_secs: u64,
        /// millis between checks of the node cache during startup, at least 1
        #[clap(
            long,
            env,
            value_parser = clap::value_parser!(u64).range(1..),
            default_value_t = DEFAULT_SYNC_POLL_MS
        )]
        pub sync_poll_ms: u64,
    }

    impl Config {
        /// how long to wait for the node cache
        pub fn sync_timeout(&self) -> Duration {
            Duration::from_secs(self.sync_timeout_secs)
        }

        /// interval between node cache sync checks
        pub fn sync_poll(&self) -> Duration {
            Duration::from_millis(self.sync_poll_ms)
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Logging setup applied once at startup
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// install the global subscriber
        pub fn parse(subnet_log: &str, log_frmt: &str) -> Result<Self> {
            // kube's http stack is noisy below info
            let filter = EnvFilter::try_new(subnet_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("tower=warn".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::cli::{self, Parser};

    #[test]
    fn test_defaults() {
        let config = cli::Config::try_parse_from(["kube-subnet-mgr"]).unwrap();
        assert_eq!(
            config.net_conf_path,
            PathBuf::from(cli::DEFAULT_NET_CONF_PATH)
        );
        assert_eq!(config.external_api, "[::]:3333".parse().unwrap());
        assert_eq!(config.sync_timeout().as_secs(), 600);
        assert_eq!(config.sync_poll().as_millis(), 1_000);
        assert_eq!(config.log_format, "standard");
    }

    #[test]
    fn test_flags() {
        let config = cli::Config::try_parse_from([
            "kube-subnet-mgr",
            "--net-conf-path",
            "/tmp/net-conf.json",
            "--node-name",
            "node-1",
            "--kube-api-url",
            "https://10.0.0.1:6443",
            "--sync-timeout-secs",
            "5",
            "--threads",
            "2",
        ])
        .unwrap();
        assert_eq!(config.net_conf_path, PathBuf::from("/tmp/net-conf.json"));
        assert_eq!(config.node_name.as_deref(), Some("node-1"));
        assert_eq!(config.kube_api_url.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(config.sync_timeout().as_secs(), 5);
        assert_eq!(config.threads, Some(2));
    }

    #[test]
    fn test_zero_sync_poll_rejected() {
        let err = cli::Config::try_parse_from(["kube-subnet-mgr", "--sync-poll-ms", "0"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let config =
            cli::Config::try_parse_from(["kube-subnet-mgr", "--sync-poll-ms", "1"]).unwrap();
        assert_eq!(config.sync_poll().as_millis(), 1);
    }
}
