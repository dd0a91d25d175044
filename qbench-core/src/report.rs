//! # Reporting
//!
//! Periodic throughput logging while a role runs, and the summary a client
//! prints when its run ends.
use std::{fmt::Write, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    client::RunOutcome,
    config::cli::{Config, Workload},
    metrics::{START_TIME, UPTIME},
    stats::{Snapshot, Stats},
};

const MIB: f64 = 1024.0 * 1024.0;

/// bytes and messages per second over some window
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    /// bytes per second
    pub bytes_per_sec: f64,
    /// messages per second
    pub messages_per_sec: f64,
}

impl Rate {
    /// rate of `delta` spread over `elapsed`, zero for an empty window
    pub fn over(delta: Snapshot, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self::default();
        }
        Self {
            bytes_per_sec: delta.bytes as f64 / secs,
            messages_per_sec: delta.messages as f64 / secs,
        }
    }

    /// throughput in MiB/s
    pub fn mib_per_sec(&self) -> f64 {
        self.bytes_per_sec / MIB
    }
}

/// Log the rate of change of `stats` every `interval` until `token` is
/// cancelled. Also keeps the uptime gauge current.
pub fn spawn_reporter(
    stats: Arc<Stats>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        let mut last = stats.snapshot();
        let mut last_at = Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("stats reporter stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let now = stats.snapshot();
                    let now_at = Instant::now();
                    let rate = Rate::over(now.delta(&last), now_at - last_at);
                    UPTIME.set(START_TIME.elapsed().as_secs() as i64);
                    info!(
                        bytes = now.bytes,
                        messages = now.messages,
                        bytes_per_sec = rate.bytes_per_sec as u64,
                        mib_per_sec = %format!("{:.2}", rate.mib_per_sec()),
                        messages_per_sec = rate.messages_per_sec as u64,
                        "throughput"
                    );
                    last = now;
                    last_at = now_at;
                }
            }
        }
    })
}

/// Summary of a finished client run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// server the client dialed
    pub addr: String,
    /// workload each stream ran
    pub workload: Workload,
    /// streams requested
    pub par: usize,
    /// payload (bench) or message (echo) length
    pub message_size: usize,
    /// run time asked for
    pub configured_secs: u64,
    /// run time measured
    pub duration_ms: u64,
    /// ended early on shutdown
    pub interrupted: bool,
    /// streams actually opened
    pub streams_opened: usize,
    /// workers that ended abnormally
    pub streams_failed: usize,
    /// totals at the end of the run
    pub totals: Snapshot,
    /// totals over the measured run time
    pub rate: Rate,
}

impl RunReport {
    /// build a report from the run's config, outcome and final totals
    pub fn new(config: &Config, outcome: &RunOutcome, totals: Snapshot) -> Self {
        let message_size = match config.workload {
            Workload::Bench => config.body,
            Workload::Echo => config.msg,
        };
        Self {
            addr: config.addr.clone(),
            workload: config.workload,
            par: config.par,
            message_size,
            configured_secs: config.time,
            duration_ms: outcome.elapsed.as_millis() as u64,
            interrupted: outcome.interrupted,
            streams_opened: outcome.streams_opened,
            streams_failed: outcome.streams_failed,
            totals,
            rate: Rate::over(totals, outcome.elapsed),
        }
    }

    /// run passed if every requested stream was opened and none failed
    pub fn passed(&self) -> bool {
        self.streams_opened == self.par && self.streams_failed == 0
    }

    /// multi-line plain text summary
    pub fn human_summary(&self) -> String {
        let mut output = String::new();
        output.push_str("QUIC benchmark report\n");
        let _ = writeln!(
            output,
            "status: {}{}",
            if self.passed() { "PASS" } else { "FAIL" },
            if self.interrupted { " (interrupted)" } else { "" }
        );
        let _ = writeln!(
            output,
            "mode: workload={:?}, addr={}, size={}B",
            self.workload, self.addr, self.message_size
        );
        let _ = writeln!(
            output,
            "streams: requested={}, opened={}, failed={}",
            self.par, self.streams_opened, self.streams_failed
        );
        let _ = writeln!(
            output,
            "totals: bytes={}, messages={}",
            self.totals.bytes, self.totals.messages
        );
        let _ = writeln!(
            output,
            "timing: duration={}ms (configured {}s) throughput={:.2}MiB/s messages={:.2}/s",
            self.duration_ms,
            self.configured_secs,
            self.rate.mib_per_sec(),
            self.rate.messages_per_sec
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn outcome(elapsed: Duration, opened: usize, failed: usize) -> RunOutcome {
        RunOutcome {
            elapsed,
            streams_opened: opened,
            streams_failed: failed,
            interrupted: false,
        }
    }

    #[test]
    fn rate_over_window() {
        let rate = Rate::over(
            Snapshot {
                bytes: 4 * 1024 * 1024,
                messages: 10,
            },
            Duration::from_secs(2),
        );
        assert_eq!(rate.bytes_per_sec, 2.0 * MIB);
        assert_eq!(rate.mib_per_sec(), 2.0);
        assert_eq!(rate.messages_per_sec, 5.0);
        assert_eq!(
            Rate::over(Snapshot::default(), Duration::ZERO),
            Rate::default()
        );
    }

    #[test]
    fn report_summarizes_run() {
        let config = Config::try_parse_from([
            "qbench", "--mode", "client", "--par", "4", "--body", "1024", "--time", "2",
        ])
        .unwrap();
        let totals = Snapshot {
            bytes: 2 * 1024 * 1024,
            messages: 2048,
        };
        let report = RunReport::new(&config, &outcome(Duration::from_secs(2), 4, 0), totals);

        assert!(report.passed());
        assert_eq!(report.message_size, 1024);
        assert_eq!(report.duration_ms, 2000);
        assert_eq!(report.rate.mib_per_sec(), 1.0);

        let summary = report.human_summary();
        assert!(summary.contains("status: PASS"), "{summary}");
        assert!(summary.contains("opened=4"), "{summary}");
        assert!(summary.contains("1.00MiB/s"), "{summary}");
    }

    #[test]
    fn short_stream_count_fails() {
        let config =
            Config::try_parse_from(["qbench", "--mode", "client", "--par", "4"]).unwrap();
        let report = RunReport::new(
            &config,
            &outcome(Duration::from_secs(1), 3, 0),
            Snapshot::default(),
        );
        assert!(!report.passed());
        assert!(report.human_summary().contains("status: FAIL"));
    }

    #[test]
    fn report_serializes_as_json() {
        let config = Config::try_parse_from(["qbench", "--workload", "echo"]).unwrap();
        let report = RunReport::new(
            &config,
            &outcome(Duration::from_millis(1500), 1, 0),
            Snapshot {
                bytes: 10,
                messages: 1,
            },
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["workload"], "echo");
        assert_eq!(json["message_size"], 1024);
        assert_eq!(json["totals"]["bytes"], 10);
        assert_eq!(json["duration_ms"], 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_stops_on_cancel() {
        let stats = Arc::new(Stats::new());
        let token = CancellationToken::new();
        let handle = spawn_reporter(Arc::clone(&stats), Duration::from_secs(1), token.clone());

        stats.add(100, 1);
        time::sleep(Duration::from_millis(2500)).await;
        token.cancel();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter exits after cancel")
            .unwrap();
    }
}
