//! # metrics
//!
//! prometheus counters for the benchmark, exposed by the external api
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();

    /// bytes recorded by stream workers
    pub static ref BYTES: IntCounter = register_int_counter!("qbench_bytes_total", "bytes recorded by stream workers").unwrap();
    /// messages (reads or round trips) recorded by stream workers
    pub static ref MESSAGES: IntCounter = register_int_counter!("qbench_messages_total", "messages recorded by stream workers").unwrap();

    /// sessions accepted or dialed
    pub static ref SESSIONS: IntCounter = register_int_counter!("qbench_sessions_total", "sessions established").unwrap();
    /// sessions currently open
    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!("qbench_active_sessions", "count of currently open sessions").unwrap();

    /// streams accepted or opened
    pub static ref STREAMS: IntCounter = register_int_counter!("qbench_streams_total", "streams started").unwrap();
    /// streams with a running worker
    pub static ref ACTIVE_STREAMS: IntGauge = register_int_gauge!("qbench_active_streams", "count of running stream workers").unwrap();

    /// errors handled, by scope
    pub static ref ERRORS: IntCounterVec = register_int_counter_vec!(
        "qbench_errors",
        "errors handled, labelled by the scope they ended",
        &["scope"]
    )
    .unwrap();

    /// process uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("qbench_uptime", "process uptime (seconds)").unwrap();
}

/// Decrements a gauge when dropped, so an exiting task always gives its slot back
#[derive(Debug)]
pub struct GaugeGuard(&'static IntGauge);

impl GaugeGuard {
    /// increment `gauge` now and decrement it on drop
    pub fn new(gauge: &'static IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::*;

    #[test]
    fn registered_and_exposed() {
        BYTES.inc_by(0);
        ERRORS.with_label_values(&["stream"]).inc_by(0);
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);

        let names = gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        assert!(names.contains("qbench_bytes_total"), "{names:?}");
        assert!(names.contains("qbench_errors"), "{names:?}");
        assert!(names.contains("qbench_uptime"), "{names:?}");
    }

    #[test]
    fn gauge_guard_releases() {
        let gauge: &'static IntGauge = Box::leak(Box::new(IntGauge::new("t", "t").unwrap()));
        {
            let _a = GaugeGuard::new(gauge);
            let _b = GaugeGuard::new(gauge);
            assert_eq!(gauge.get(), 2);
        }
        assert_eq!(gauge.get(), 0);
    }
}
