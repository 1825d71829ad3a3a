#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod config;
mod identity;
mod startup_health;

use config::{
    cli::{self, Parser},
    trace,
};
use external_api::{ExternalApi, Health};
use kube_directory::NodeDirectory;
use kube_subnet::KubeSubnetManager;
use startup_health::verify_startup_subsystems;
use subnet::{Config, SubnetManager};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tracing::*;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.subnet_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start subnet manager"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("parsing network config");
    let net_cfg = Arc::new(Config::parse(&config.net_conf_path)?);
    info!(network = %net_cfg.network, backend = %net_cfg.backend_type, "loaded network config");

    let client =
        kube_directory::client(config.kube_api_url.as_deref(), config.kubeconfig.as_deref())
            .await?;
    let node_name = identity::resolve_node_name(
        config.node_name.as_deref(),
        config.pod_name.as_deref(),
        config.pod_namespace.as_deref(),
        &client,
    )
    .await?;

    let directory = Arc::new(NodeDirectory::new(client));
    let manager = Arc::new(KubeSubnetManager::new(
        directory,
        Arc::clone(&net_cfg),
        node_name,
    ));
    info!(name = %manager.name(), "created subnet manager");

    // start external api for healthchecks
    let api = ExternalApi::new(config.external_api, Arc::clone(&net_cfg));
    let api_sender = api.sender();
    let mut api_task = api.start();

    let token = CancellationToken::new();
    let mut manager_task: JoinHandle<Result<()>> = tokio::spawn({
        let manager = Arc::clone(&manager);
        let token = token.clone();
        async move { manager.run(token).await.map_err(|err| anyhow!(err)) }
    });

    // Keep health BAD until the watcher is running and the cache has synced.
    if let Err(err) = verify_startup_subsystems(&mut api_task, &mut manager_task).await {
        token.cancel();
        api_task.abort();
        return Err(err);
    }
    if let Err(err) = manager
        .wait_for_sync(config.sync_timeout(), config.sync_poll())
        .await
        .context("waiting for the node cache to sync")
    {
        token.cancel();
        api_task.abort();
        return Err(err);
    }

    debug!("changing health to good after node cache sync");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let log_task = spawn_lease_log_task(Arc::clone(&manager), token.clone());
    tokio::spawn(shutdown_signal(token.clone()));

    let result = flatten(manager_task).await;
    if result.is_err() {
        let _ = api_sender.send(Health::Bad).await;
    }
    token.cancel();
    if let Err(err) = log_task.await {
        error!(?err, "error waiting for lease log task");
    }
    api_task.abort();
    result
}

/// Drain the lease feed, logging every change seen in the cluster.
fn spawn_lease_log_task<M: SubnetManager>(
    manager: Arc<M>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match manager.watch_leases(&token).await {
                Ok(batch) if batch.is_empty() => {
                    debug!("lease log task stopping");
                    return;
                }
                Ok(batch) => {
                    for event in batch.events {
                        info!(
                            event_type = %event.event_type,
                            subnet = %event.lease.subnet,
                            public_ip = %event.lease.attrs.public_ip,
                            backend_type = %event.lease.attrs.backend_type,
                            "lease event"
                        );
                    }
                }
                Err(err) => {
                    warn!(?err, "error watching leases");
                    return;
                }
            }
        }
    })
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
