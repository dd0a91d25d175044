#![allow(clippy::cognitive_complexity)]
use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result, anyhow};

use external_api::{ExternalApi, ExternalApiGuard, Health};
use qbench_core::{
    Client, Server, Stats,
    config::{
        cli::{self, Mode, Parser},
        trace,
    },
    credential,
    report::{RunReport, spawn_reporter},
    server::ServerOptions,
    tokio::{self, runtime::Builder, signal, sync::mpsc},
    tracing::*,
    transport::{self, VerifyPolicy},
};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// exit code for a rejected configuration
const EXIT_CONFIG: u8 = 2;

fn main() -> ExitCode {
    // `.env` entries have to be in the environment before clap reads it
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    if let Err(err) = config.validate() {
        eprintln!("configuration error: {err:#}");
        return ExitCode::from(EXIT_CONFIG);
    }
    let trace_config = match trace::Config::parse(&config.qbench_log) {
        Ok(trace_config) => trace_config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    match dotenv {
        Ok(path) => debug!(path = %path.display(), "loaded .env file"),
        Err(err) => debug!(?err, ".env file not loaded"),
    }
    debug!(?config, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    rt.block_on(async move {
        match tokio::spawn(start(config)).await {
            Err(err) => {
                error!(?err, "failed to start");
                ExitCode::FAILURE
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                ExitCode::FAILURE
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                ExitCode::SUCCESS
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    let stats = Arc::new(Stats::new());
    let token = CancellationToken::new();

    // start external api for healthchecks
    let api = config
        .external_api
        .map(|addr| ExternalApi::new(addr, Arc::clone(&stats)));
    let api_sender = api.as_ref().map(ExternalApi::sender);
    let _api_guard: Option<ExternalApiGuard> = api.map(|api| api.serve(token.clone()));

    let reporter = config
        .report_interval()
        .map(|interval| spawn_reporter(Arc::clone(&stats), interval, token.clone()));

    let sender = api_sender.as_ref();
    let res = match config.mode {
        Mode::Server => run_server(&config, Arc::clone(&stats), token.clone(), sender).await,
        Mode::Client => run_client(&config, Arc::clone(&stats), token.clone(), sender).await,
    };
    if res.is_err() {
        set_health(sender, Health::Bad).await;
    }

    token.cancel();
    if let Some(reporter) = reporter {
        if let Err(err) = reporter.await {
            error!(?err, "error waiting for stats reporter");
        }
    }
    res
}

async fn run_server(
    config: &cli::Config,
    stats: Arc<Stats>,
    token: CancellationToken,
    api_sender: Option<&mpsc::Sender<Health>>,
) -> Result<()> {
    let addr = transport::resolve(&config.addr).await?;
    debug!("generating self-signed credential");
    let cred = credential::generate().context("failed to generate server credential")?;
    let server = Server::bind(addr, &cred, stats, ServerOptions::from(config))?;
    info!(addr = %server.local_addr()?, "listening for QUIC sessions");

    debug!("changing health to good after bind");
    set_health(api_sender, Health::Good).await;

    server.listen(shutdown_signal(token)).await
}

async fn run_client(
    config: &cli::Config,
    stats: Arc<Stats>,
    token: CancellationToken,
    api_sender: Option<&mpsc::Sender<Health>>,
) -> Result<()> {
    let addr = transport::resolve(&config.addr).await?;
    let mut client = Client::dial(
        addr,
        &config.server_name,
        &VerifyPolicy::Insecure,
        config.connect_timeout(),
    )
    .await?;
    client
        .open_streams(config.par, qbench_core::client::job(config), &stats)
        .await?;
    info!(
        par = config.par,
        workload = ?config.workload,
        secs = config.time,
        "streams open, running"
    );
    set_health(api_sender, Health::Good).await;

    let ctrl_c = tokio::spawn(shutdown_signal(token.clone()));
    let outcome = client
        .run_for(config.run_time(), token.cancelled())
        .await;
    ctrl_c.abort();

    let report = RunReport::new(config, &outcome, stats.snapshot());
    if config.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        );
    } else {
        println!("{}", report.human_summary());
    }
    Ok(())
}

async fn set_health(sender: Option<&mpsc::Sender<Health>>, health: Health) {
    if let Some(sender) = sender {
        if let Err(err) = sender.send(health).await {
            warn!(?err, "error occurred in changing health status");
        }
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
