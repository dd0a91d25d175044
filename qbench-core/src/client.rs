//! # Client
//!
//! One session to one server, `par` streams on it, each driven by its own
//! worker until the run time is up. Streams are opened one after another and
//! a failure to open any of them is fatal to the run.
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use quinn::{Connection, Endpoint, VarInt};
use tokio::{
    task::JoinSet,
    time::{self, Instant},
};
use tracing::{Instrument, debug, error, info};

use crate::{
    config::cli::{Config, Workload},
    error::{Error, Result},
    metrics::{ACTIVE_SESSIONS, GaugeGuard, SESSIONS},
    stats::Stats,
    transport::{self, VerifyPolicy},
    worker::{Job, StreamWorker},
};

/// how long to wait for the server to acknowledge our close
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How a client run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// wall time from the end of stream setup to close
    pub elapsed: Duration,
    /// streams opened on the session
    pub streams_opened: usize,
    /// workers that ended on something other than an orderly close
    pub streams_failed: usize,
    /// the run was cut short by shutdown
    pub interrupted: bool,
}

/// the stream job a client runs for `config`'s workload
pub fn job(config: &Config) -> Job {
    match config.workload {
        Workload::Bench => Job::Bench { body: config.body },
        Workload::Echo => Job::Ping { msg: config.msg },
    }
}

/// A dialed session and the workers running on it
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
    conn: Connection,
    workers: JoinSet<Result<()>>,
    opened: usize,
    _active: GaugeGuard,
}

impl Client {
    /// Dial `addr`, giving up after `connect_timeout`
    pub async fn dial(
        addr: SocketAddr,
        server_name: &str,
        policy: &VerifyPolicy,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = transport::client_endpoint(addr)?;
        let config = transport::client_config(policy)?;
        let connecting = endpoint
            .connect_with(config, addr, server_name)
            .map_err(|err| Error::Dial {
                addr,
                reason: err.to_string(),
            })?;

        let conn = match time::timeout(connect_timeout, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                return Err(Error::Dial {
                    addr,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                endpoint.close(VarInt::from_u32(0), b"");
                return Err(Error::DialTimeout {
                    addr,
                    timeout: connect_timeout,
                });
            }
        };

        SESSIONS.inc();
        info!(remote = %addr, id = conn.stable_id(), "session established");
        Ok(Self {
            endpoint,
            conn,
            workers: JoinSet::new(),
            opened: 0,
            _active: GaugeGuard::new(&ACTIVE_SESSIONS),
        })
    }

    /// Open `par` streams in order and start a worker on each. Stops at the
    /// first stream that can't be opened.
    pub async fn open_streams(&mut self, par: usize, job: Job, stats: &Arc<Stats>) -> Result<()> {
        for index in 0..par {
            let (send, recv) = self
                .conn
                .open_bi()
                .await
                .map_err(|source| Error::OpenStream { index, source })?;
            let id = send.id().index();
            debug!(stream = id, index, "new stream success");
            let worker = StreamWorker::new(id, recv, send, Arc::clone(stats));
            self.workers.spawn(worker.run(job).in_current_span());
            self.opened += 1;
        }
        Ok(())
    }

    /// streams opened so far
    pub fn opened(&self) -> usize {
        self.opened
    }

    /// the underlying session
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Let the workers run for `duration` or until `shutdown` resolves, then
    /// close the session and wait for every worker to exit. Workers that end
    /// early don't shorten the run.
    pub async fn run_for<F>(mut self, duration: Duration, shutdown: F) -> RunOutcome
    where
        F: Future<Output = ()>,
    {
        let start = Instant::now();
        let interrupted = tokio::select! {
            _ = time::sleep(duration) => false,
            _ = shutdown => {
                info!("caught shutdown signal, ending run early");
                true
            }
        };
        let elapsed = start.elapsed();

        self.conn.close(VarInt::from_u32(0), b"run complete");
        let mut failed = 0;
        reap(&mut self.workers, &mut failed).await;
        if time::timeout(CLOSE_GRACE, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("server did not acknowledge close in time");
        }

        RunOutcome {
            elapsed,
            streams_opened: self.opened,
            streams_failed: failed,
            interrupted,
        }
    }
}

/// join every worker in `workers`, counting the ones that failed
async fn reap(workers: &mut JoinSet<Result<()>>, failed: &mut usize) {
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_clean_close() => {}
            Ok(Err(_)) => *failed += 1,
            Err(err) => {
                error!(?err, "stream worker panicked");
                *failed += 1;
            }
        }
    }
}
