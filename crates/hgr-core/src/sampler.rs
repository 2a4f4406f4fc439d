use std::time::Duration;

use chrono::Utc;
use hgr_db::{MetricsStore, SampleRepository};
use hgr_types::LoadSample;
use sysinfo::System;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Periodic host load sampling into a run's metrics store.
pub struct LoadSampler {
    interval: Duration,
    system: System,
}

impl LoadSampler {
    /// Sampling period; zero is raised to one millisecond.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            system: System::new(),
        }
    }

    /// Take one sample now.
    pub fn sample(&mut self) -> LoadSample {
        self.system.refresh_memory();
        let load = System::load_average();
        LoadSample {
            timestamp: Utc::now(),
            load_one: load.one,
            load_five: load.five,
            load_fifteen: load.fifteen,
            mem_used: self.system.used_memory(),
            mem_total: self.system.total_memory(),
        }
    }

    /// Record a sample every interval until `stop` is cancelled. Write
    /// failures are logged and sampling continues. Returns the number of
    /// samples stored.
    pub async fn run(mut self, store: &MetricsStore, stop: CancellationToken) -> u64 {
        let repo = SampleRepository::new(store);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stored = 0;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = self.sample();
                    match repo.record(&sample).await {
                        Ok(()) => stored += 1,
                        Err(e) => warn!(error = %e, "Failed to record load sample"),
                    }
                }
            }
        }

        debug!(samples = stored, "Load sampling stopped");
        stored
    }
}
