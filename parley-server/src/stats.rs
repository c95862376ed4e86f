//! Named time statistics, dumped periodically to the log.
//!
//! The core reports request and job handling latency here; nothing depends
//! on it for correctness.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Default, Clone)]
struct TimeStat {
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

#[derive(Default)]
pub struct Statistics {
    times: Mutex<HashMap<String, TimeStat>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one timed occurrence of the named statistic.
    pub fn update_time_statistic(&self, name: &str, ms: u64) {
        let mut times = self.times.lock();
        let stat = times.entry(name.to_string()).or_default();
        stat.count += 1;
        stat.total_ms += ms;
        stat.max_ms = stat.max_ms.max(ms);
    }

    /// Log and reset all statistics. Called by a periodic task.
    pub fn dump(&self) {
        let snapshot: Vec<(String, TimeStat)> = {
            let mut times = self.times.lock();
            times.drain().collect()
        };
        for (name, stat) in snapshot {
            let mean = stat.total_ms as f64 / stat.count as f64;
            tracing::info!(
                statistic = %name,
                count = stat.count,
                mean_ms = format_args!("{mean:.1}"),
                max_ms = stat.max_ms,
                "time statistic"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_resets() {
        let stats = Statistics::new();
        stats.update_time_statistic("request", 10);
        stats.update_time_statistic("request", 30);
        {
            let times = stats.times.lock();
            let stat = &times["request"];
            assert_eq!(stat.count, 2);
            assert_eq!(stat.total_ms, 40);
            assert_eq!(stat.max_ms, 30);
        }
        stats.dump();
        assert!(stats.times.lock().is_empty());
    }
}
