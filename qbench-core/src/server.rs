//! # Server
//!
//! Accepts QUIC sessions and echoes every stream a peer opens. One task per
//! session runs the stream-accept loop, one task per stream runs an echo
//! worker. A session task only returns once all of its workers have.
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use credential::Credential;
use quinn::{Connection, Endpoint, VarInt};
use tokio::{task::JoinSet, time};
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::{
    config::cli::{Config, DEFAULT_READ_BUF},
    error::{Error, Result},
    metrics::{ACTIVE_SESSIONS, GaugeGuard, SESSIONS},
    stats::Stats,
    transport::{self, DEFAULT_MAX_STREAMS},
    worker::{Job, StreamWorker},
};

/// how long shutdown waits for sessions to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Per-server tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// read buffer for each echo stream
    pub read_buf: usize,
    /// max concurrently open streams per session
    pub max_streams: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_buf: DEFAULT_READ_BUF,
            max_streams: DEFAULT_MAX_STREAMS,
        }
    }
}

impl From<&Config> for ServerOptions {
    fn from(config: &Config) -> Self {
        Self {
            read_buf: config.read_buf,
            max_streams: config.max_streams,
        }
    }
}

/// A bound echo server
#[derive(Debug)]
pub struct Server {
    endpoint: Endpoint,
    stats: Arc<Stats>,
    opts: ServerOptions,
}

impl Server {
    /// Bind a QUIC endpoint on `addr` presenting `cred`. Fails if the address
    /// can't be bound.
    pub fn bind(
        addr: SocketAddr,
        cred: &Credential,
        stats: Arc<Stats>,
        opts: ServerOptions,
    ) -> Result<Self> {
        let config = transport::server_config(cred, opts.max_streams)?;
        let endpoint = transport::server_endpoint(addr, config)?;
        Ok(Self {
            endpoint,
            stats,
            opts,
        })
    }

    /// the address actually bound, useful after binding port 0
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Accept sessions until `shutdown` resolves, then close the endpoint and
    /// give running sessions a short window to finish.
    pub async fn listen<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let mut sessions = JoinSet::new();
        tokio::select! {
            _ = self.accept_loop(&mut sessions) => {
                error!("endpoint stopped accepting sessions");
            }
            res = shutdown => {
                info!("caught shutdown signal handler");
                if let Err(err) = res {
                    error!(?err);
                }
            }
        }

        info!("closing endpoint...");
        self.endpoint.close(VarInt::from_u32(0), b"server shutdown");
        let drain = async { while sessions.join_next().await.is_some() {} };
        if time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            error!("sessions did not finish within 3 seconds-- exiting anyway");
            sessions.abort_all();
        } else {
            info!("all sessions finished cleanly");
        }
        Ok(())
    }

    /// Only returns when the endpoint is closed. A failed handshake is logged
    /// and the loop moves on.
    async fn accept_loop(&self, sessions: &mut JoinSet<()>) {
        loop {
            tokio::select! {
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        return;
                    };
                    let remote = incoming.remote_address();
                    let stats = Arc::clone(&self.stats);
                    let opts = self.opts;
                    // handshake runs on the session task, not the accept loop
                    sessions.spawn(
                        async move {
                            match incoming.await {
                                Ok(conn) => handle_session(conn, stats, opts).await,
                                Err(source) => {
                                    let err = Error::Incoming { remote, source };
                                    err.count();
                                    warn!(%err, "listen accept fail");
                                }
                            }
                        }
                        .in_current_span(),
                    );
                }
                Some(res) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = res {
                        error!(?err, "session task panicked");
                    }
                }
            }
        }
    }
}

/// Accept streams on `conn` until the session fails, spawning an echo worker
/// for each. Failing to accept a stream is the only way a session ends.
#[instrument(name = "session", skip_all, fields(remote = %conn.remote_address(), id = conn.stable_id()))]
pub async fn handle_session(conn: Connection, stats: Arc<Stats>, opts: ServerOptions) {
    SESSIONS.inc();
    let _active = GaugeGuard::new(&ACTIVE_SESSIONS);
    info!("accept session");

    let job = Job::Echo {
        read_buf: opts.read_buf,
    };
    let mut streams = JoinSet::new();
    let err = loop {
        tokio::select! {
            res = conn.accept_bi() => match res {
                Ok((send, recv)) => {
                    let id = send.id().index();
                    debug!(stream = id, "new stream success");
                    let worker = StreamWorker::new(id, recv, send, Arc::clone(&stats));
                    streams.spawn(worker.run(job).in_current_span());
                }
                Err(err) => break Error::AcceptStream(err),
            },
            // reap finished workers so the set doesn't grow with the session
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
        }
    };

    err.count();
    if err.is_clean_close() {
        info!(%err, "session closed");
    } else {
        warn!(%err, "session accept stream fail");
    }
    conn.close(VarInt::from_u32(0), b"");
    // each worker sees the close on its next read or write
    while streams.join_next().await.is_some() {}
    debug!("session workers finished");
}
