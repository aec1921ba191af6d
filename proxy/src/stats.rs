/// Proxy statistics
///
/// The share loop appends one FoundShare per accepted-for-relay share; the
/// stats task prunes the rolling window, derives the average hashrate from
/// the summed share difficulty, and keeps a small ring of samples for the
/// dashboard chart.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::HASHRATE_AVG_MINUTES;
use crate::stratum::server::StratumServer;
use crate::upstream::Registry;

/// Dashboard chart depth: at the default 5-minute tick this is one day.
const CHART_SAMPLES: usize = 288;

#[derive(Debug, Clone, Copy)]
pub struct FoundShare {
    pub time: Instant,
    pub diff: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HrSample {
    pub time: i64,
    pub hr: f64,
    pub miners: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub hashrate: f64,
    pub miners: usize,
    pub upstreams: usize,
}

#[derive(Clone, Default)]
pub struct Stats {
    shares: Arc<Mutex<Vec<FoundShare>>>,
    chart: Arc<Mutex<VecDeque<HrSample>>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_share(&self, diff: u64) {
        self.shares.lock().push(FoundShare { time: Instant::now(), diff });
    }

    /// Drop shares older than the averaging window and estimate the
    /// hashrate from what remains.
    pub fn average_hashrate(&self) -> f64 {
        let total = self.prune_and_sum(Duration::from_secs(HASHRATE_AVG_MINUTES * 60));
        total / (HASHRATE_AVG_MINUTES * 60) as f64
    }

    fn prune_and_sum(&self, window: Duration) -> f64 {
        let mut shares = self.shares.lock();
        shares.retain(|share| share.time.elapsed() <= window);
        shares.iter().map(|share| share.diff as f64).sum()
    }

    pub async fn snapshot(&self, server: &StratumServer, registry: &Registry) -> Snapshot {
        Snapshot {
            hashrate: self.average_hashrate(),
            miners: server.count().await,
            upstreams: registry.count().await,
        }
    }

    pub fn push_sample(&self, snapshot: &Snapshot) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let mut chart = self.chart.lock();
        chart.push_back(HrSample { time: now, hr: snapshot.hashrate, miners: snapshot.miners });
        while chart.len() > CHART_SAMPLES {
            chart.pop_front();
        }
    }

    pub fn chart(&self) -> Vec<HrSample> {
        self.chart.lock().iter().copied().collect()
    }

}

pub fn format_hashrate(hashrate: f64) -> String {
    if hashrate > 1000.0 * 1000.0 {
        format!("{:.1} M", hashrate / 1000.0 / 1000.0)
    } else if hashrate > 1000.0 {
        format!("{:.1} k", hashrate / 1000.0)
    } else {
        format!("{:.0} ", hashrate)
    }
}

/// Periodic stats line, one per print interval.
pub async fn run(
    stats: Stats,
    server: Arc<StratumServer>,
    registry: Arc<Registry>,
    print_interval: Duration,
) {
    loop {
        let snapshot = stats.snapshot(&server, &registry).await;
        stats.push_sample(&snapshot);

        info!(
            "{}H/s avg, miners: {}, upstreams: {}",
            format_hashrate(snapshot.hashrate),
            snapshot.miners,
            snapshot.upstreams,
        );

        tokio::time::sleep(print_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashrate_sums_share_difficulty_over_the_window() {
        let stats = Stats::new();
        stats.record_share(300);
        stats.record_share(300);

        // 600 difficulty over a 600-second window: 1 H/s.
        let hashrate = stats.average_hashrate();
        assert!((hashrate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn hashrate_prunes_expired_shares() {
        let stats = Stats::new();
        stats.record_share(1_000_000);
        std::thread::sleep(Duration::from_millis(10));

        // A zero-width window expires everything recorded so far.
        assert_eq!(stats.prune_and_sum(Duration::ZERO), 0.0);
        // The expired share is gone, not just skipped.
        stats.record_share(600);
        assert!((stats.average_hashrate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn chart_ring_is_bounded() {
        let stats = Stats::new();
        let snapshot = Snapshot { hashrate: 1.0, miners: 1, upstreams: 1 };
        for _ in 0..CHART_SAMPLES + 10 {
            stats.push_sample(&snapshot);
        }
        assert_eq!(stats.chart().len(), CHART_SAMPLES);
    }

    #[test]
    fn hashrate_formatting() {
        assert_eq!(format_hashrate(0.0), "0 ");
        assert_eq!(format_hashrate(512.0), "512 ");
        assert_eq!(format_hashrate(2_500.0), "2.5 k");
        assert_eq!(format_hashrate(3_400_000.0), "3.4 M");
    }
}
