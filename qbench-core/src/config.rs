//! qbench configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default listen/dial address
    pub static DEFAULT_ADDR: &str = "localhost:6666";
    /// Default number of streams a client opens
    pub const DEFAULT_PAR: usize = 1;
    /// Default payload length for the bench workload (64KiB)
    pub const DEFAULT_BODY: usize = 64 * 1024;
    /// Default message length for the echo workload
    pub const DEFAULT_MSG: usize = 1024;
    /// Default client run time (seconds)
    pub const DEFAULT_TIME: u64 = 3600;
    /// Default read buffer for server side echo streams
    pub const DEFAULT_READ_BUF: usize = 64 * 1024;
    /// Default per-session stream limit on the server
    pub const DEFAULT_MAX_STREAMS: u32 = 1024;
    /// Default server name sent in the TLS handshake
    pub static DEFAULT_SERVER_NAME: &str = "localhost";
    /// Default dial timeout (seconds)
    pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;
    /// Default stats reporting interval (seconds)
    pub const DEFAULT_REPORT_INTERVAL: u64 = 1;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "qbench-worker";
    /// default log level. Can use this argument or QBENCH_LOG env var
    pub const DEFAULT_QBENCH_LOG: &str = "info";

    use std::{net::SocketAddr, time::Duration};

    use anyhow::{Result, bail};
    pub use clap::Parser;
    use clap::ValueEnum;
    use serde::{Deserialize, Serialize};

    /// which side of the benchmark to run
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
    #[serde(rename_all = "lowercase")]
    pub enum Mode {
        /// accept sessions and echo every stream
        Server,
        /// dial a server and drive streams for a fixed time
        Client,
    }

    /// what each client stream does
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
    #[serde(rename_all = "lowercase")]
    pub enum Workload {
        /// fixed size payload, exact length round trips
        Bench,
        /// small messages, best-effort single read per cycle
        Echo,
    }

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "qbench", bin_name = "qbench", about, long_about = None)]
    /// parses from cli & environment var. The binary loads `.env` from the working directory (or a parent) first
    pub struct Config {
        /// address to listen on (server) or dial (client), host:port
        #[clap(long, env = "QBENCH_ADDR", default_value = DEFAULT_ADDR)]
        pub addr: String,
        /// run as server or client
        #[clap(long, env = "QBENCH_MODE", value_enum, default_value_t = Mode::Server)]
        pub mode: Mode,
        /// client stream workload
        #[clap(long, env = "QBENCH_WORKLOAD", value_enum, default_value_t = Workload::Bench)]
        pub workload: Workload,
        /// number of streams the client opens
        #[clap(long, env = "QBENCH_PAR", default_value_t = DEFAULT_PAR)]
        pub par: usize,
        /// payload length in bytes for the bench workload
        #[clap(long, env = "QBENCH_BODY", default_value_t = DEFAULT_BODY)]
        pub body: usize,
        /// message length in bytes for the echo workload
        #[clap(long, env = "QBENCH_MSG", default_value_t = DEFAULT_MSG)]
        pub msg: usize,
        /// how long a client run lasts (seconds)
        #[clap(long, env = "QBENCH_TIME", default_value_t = DEFAULT_TIME)]
        pub time: u64,
        /// read buffer size for server echo streams
        #[clap(long, env = "QBENCH_READ_BUF", default_value_t = DEFAULT_READ_BUF)]
        pub read_buf: usize,
        /// how many streams one client session may have open on the server
        #[clap(long, env = "QBENCH_MAX_STREAMS", default_value_t = DEFAULT_MAX_STREAMS)]
        pub max_streams: u32,
        /// server name to use in the TLS handshake when dialing
        #[clap(long, env = "QBENCH_SERVER_NAME", default_value = DEFAULT_SERVER_NAME)]
        pub server_name: String,
        /// give up dialing after this many seconds
        #[clap(long, env = "QBENCH_CONNECT_TIMEOUT", default_value_t = DEFAULT_CONNECT_TIMEOUT)]
        pub connect_timeout: u64,
        /// log throughput every N seconds, 0 to disable
        #[clap(long, env = "QBENCH_REPORT_INTERVAL", default_value_t = DEFAULT_REPORT_INTERVAL)]
        pub report_interval: u64,
        /// optional address to serve /health, /metrics and /stats on
        #[clap(long, env = "QBENCH_EXTERNAL_API")]
        pub external_api: Option<SocketAddr>,
        /// print the client run report as JSON
        #[clap(long)]
        pub json: bool,
        /// number of tokio worker threads, defaults to logical CPUs
        #[clap(long, env = "QBENCH_THREADS")]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env = "QBENCH_THREAD_NAME", default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env = "QBENCH_LOG", default_value = DEFAULT_QBENCH_LOG)]
        pub qbench_log: String,
    }

    impl Config {
        /// reject values that can't drive a run
        pub fn validate(&self) -> Result<()> {
            if self.par == 0 {
                bail!("--par must be greater than 0");
            }
            if self.body == 0 {
                bail!("--body must be greater than 0");
            }
            if self.msg == 0 {
                bail!("--msg must be greater than 0");
            }
            if self.time == 0 {
                bail!("--time must be greater than 0");
            }
            if self.max_streams == 0 {
                bail!("--max-streams must be greater than 0");
            }
            if self.read_buf == 0 {
                bail!("--read-buf must be greater than 0");
            }
            if self.connect_timeout == 0 {
                bail!("--connect-timeout must be greater than 0");
            }
            if self.threads == Some(0) {
                bail!("--threads must be greater than 0");
            }
            Ok(())
        }

        /// client run length as `Duration`
        pub fn run_time(&self) -> Duration {
            Duration::from_secs(self.time)
        }

        /// dial timeout as `Duration`
        pub fn connect_timeout(&self) -> Duration {
            Duration::from_secs(self.connect_timeout)
        }

        /// reporting interval, `None` when reporting is off
        pub fn report_interval(&self) -> Option<Duration> {
            (self.report_interval > 0).then(|| Duration::from_secs(self.report_interval))
        }
    }

}

pub mod trace {
    //! tracing configuration, logs go to stderr so stdout only carries the run report
    use std::io;

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

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Logging configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber, filtered by `qbench_log`
        pub fn parse(qbench_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            // quinn_proto logs every packet at debug
            let filter = EnvFilter::try_new(qbench_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("quinn_proto=warn".parse()?)
                .add_directive("hyper=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(io::stderr))
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .with_writer(io::stderr)
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
                        .with(fmt::layer().with_writer(io::stderr))
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
