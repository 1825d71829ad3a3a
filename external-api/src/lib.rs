//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, diagnostics, and metrics
//! of the subnet manager. It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /config
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};

use subnet::Config;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing::{error, info, trace};

pub use crate::models::{Health, State};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard drop called");
        self.task_handle.abort();
    }
}

/// Listens for health changes of the subnet manager and reports them,
/// together with metrics and the network config, over HTTP
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    cfg: Arc<Config>,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, cfg: Arc<Config>) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            cfg,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(addr: SocketAddr, state: State, cfg: Arc<Config>) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/config", routing::get(handlers::config))
            .layer(Extension(state))
            .layer(Extension(cfg));

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app).await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening for health changes
    pub fn start(mut self) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let cfg = self.cfg.clone();

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, cfg),
                self.listen_status()
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start serving, the task is aborted when the guard drops
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(),
        }
    }
}

mod handlers {

    use std::sync::Arc;

    use axum::{
        Json,
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use kube_subnet::metrics::{START_TIME, UPTIME};
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use subnet::Config;
    use tracing::error;

    use crate::models::{Health, ServerResult, State};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn config(
        Extension(cfg): Extension<Arc<Config>>,
    ) -> ServerResult<impl IntoResponse> {
        Ok(Json(serde_json::to_value(&*cfg)?))
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::response::IntoResponse;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// node cache synced and serving
        Good,
        /// still starting, or unable to serve
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match *self {
                Health::Good => "GOOD",
                Health::Bad => "BAD",
            })
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Wraps `anyhow::Error` so handlers can use `?`
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}
