//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, live stats, and metrics
//! It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /stats
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};
use qbench_core::Stats;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

pub use crate::models::{Health, State, StatsBody};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl ExternalApiGuard {
    /// true once the api task has exited, which only happens on error or shutdown
    pub fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiGuard drop called");
        self.task_handle.abort();
    }
}

/// Listens for health changes from the running role and reports them,
/// alongside live stats and metrics, over HTTP
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    stats: Arc<Stats>,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, stats: Arc<Stats>) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            stats,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Listen to Health changes over the channel
    async fn listen_status(mut rx: mpsc::Receiver<Health>, state: State) -> Result<()> {
        while let Some(health) = rx.recv().await {
            let mut guard = state.lock();
            if *guard != health {
                debug!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(
        addr: SocketAddr,
        state: State,
        stats: Arc<Stats>,
        token: CancellationToken,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = router(state, stats);

        debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .await?;
        if token.is_cancelled() {
            return Ok(());
        }
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on the health channel.
    /// Runs until `token` is cancelled.
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        let ExternalApi {
            tx,
            rx,
            addr,
            state,
            stats,
        } = self;
        // our own sender would keep the channel open forever
        drop(tx);

        tokio::spawn(async move {
            let status = ExternalApi::listen_status(rx, state.clone());
            tokio::select! {
                res = ExternalApi::run(addr, state, stats, token) => {
                    if let Err(err) = res {
                        error!(?err, "external api returning, this should not happen");
                    }
                }
                // every sender is gone, keep serving with the last known health
                _ = async { let _ = status.await; std::future::pending::<()>().await } => {}
            }
        })
    }

    /// Start the api, aborting it when the guard drops
    pub fn serve(self, token: CancellationToken) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(token),
        }
    }
}

/// Provides:
/// /health
/// /ping
/// /metrics
/// /metrics-text
/// /stats
fn router(state: State, stats: Arc<Stats>) -> Router {
    Router::new()
        .route("/health", routing::get(handlers::ok))
        .route("/ping", routing::get(handlers::ping))
        .route("/metrics", routing::get(handlers::metrics))
        .route("/metrics-text", routing::get(handlers::metrics_text))
        .route("/stats", routing::get(handlers::stats))
        .layer(Extension(state))
        .layer(Extension(stats))
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
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use qbench_core::{
        Stats,
        metrics::{START_TIME, UPTIME},
    };
    use tracing::error;

    use crate::models::{Health, ServerResult, State, StatsBody};

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn stats(
        Extension(stats): Extension<Arc<Stats>>,
    ) -> ServerResult<impl IntoResponse> {
        let snapshot = stats.snapshot();
        Ok(Json(StatsBody {
            bytes: snapshot.bytes,
            messages: snapshot.messages,
            uptime_secs: START_TIME.elapsed().as_secs(),
        }))
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
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// `/stats` response
    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone)]
    pub struct StatsBody {
        /// bytes recorded so far
        pub bytes: u64,
        /// messages recorded so far
        pub messages: u64,
        /// seconds since the process started
        pub uptime_secs: u64,
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
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
