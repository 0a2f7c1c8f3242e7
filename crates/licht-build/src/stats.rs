//! Build statistics: per-worker counters folded into a build-wide report
//! after every worker has joined.

use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct WorkerStats {
    pub worker: usize,
    /// Wall time the worker thread was alive.
    pub execution: Duration,
    /// Time spent sleeping because no primary or helper work was available.
    pub idle: Duration,
    /// Time spent inside bounded task requests.
    pub request: Duration,
    /// Time an owner spent helping drain its own sub-task groups.
    pub blocked_on_help: Duration,
    pub mappings: usize,
    pub visibility_buckets: usize,
    pub volumetric_cells: usize,
    pub shadow_maps: usize,
    pub cache_tasks: usize,
    pub interpolate_tasks: usize,
    pub brick_tasks: usize,
    pub volume_sample_tasks: usize,
    pub distance_field_layers: usize,
    pub rejected: usize,
}

impl WorkerStats {
    pub fn for_worker(worker: usize) -> Self {
        Self {
            worker,
            ..Self::default()
        }
    }

    pub fn primary_tasks(&self) -> usize {
        self.mappings + self.visibility_buckets + self.volumetric_cells + self.shadow_maps
    }

    pub fn helper_tasks(&self) -> usize {
        self.cache_tasks
            + self.interpolate_tasks
            + self.brick_tasks
            + self.volume_sample_tasks
            + self.distance_field_layers
    }
}

#[derive(Clone, Debug, Default)]
pub struct BuildStats {
    pub workers: Vec<WorkerStats>,
}

impl BuildStats {
    pub fn total_primary(&self) -> usize {
        self.workers.iter().map(WorkerStats::primary_tasks).sum()
    }

    pub fn total_helper(&self) -> usize {
        self.workers.iter().map(WorkerStats::helper_tasks).sum()
    }

    pub fn total_rejected(&self) -> usize {
        self.workers.iter().map(|w| w.rejected).sum()
    }

    pub fn log_table(&self) {
        for w in &self.workers {
            log::info!(
                target: "licht::stats",
                "worker {}: {} primary ({} mappings, {} visibility, {} cells, {} shadow) \
                 {} helper ({} cache, {} interp, {} brick, {} samples, {} layers) \
                 rejected {} exec {:.1?} idle {:.1?} request {:.1?} blocked {:.1?}",
                w.worker,
                w.primary_tasks(),
                w.mappings,
                w.visibility_buckets,
                w.volumetric_cells,
                w.shadow_maps,
                w.helper_tasks(),
                w.cache_tasks,
                w.interpolate_tasks,
                w.brick_tasks,
                w.volume_sample_tasks,
                w.distance_field_layers,
                w.rejected,
                w.execution,
                w.idle,
                w.request,
                w.blocked_on_help,
            );
        }
        log::info!(
            target: "licht::stats",
            "totals: {} primary, {} helper, {} rejected across {} workers",
            self.total_primary(),
            self.total_helper(),
            self.total_rejected(),
            self.workers.len(),
        );
    }
}

/// Collects joined workers' stats; the lock is only taken at join time.
#[derive(Default)]
pub struct StatsAggregator {
    inner: Mutex<Vec<WorkerStats>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&self, stats: WorkerStats) {
        self.inner.lock().expect("stats lock").push(stats);
    }

    pub fn snapshot(&self) -> BuildStats {
        let mut workers = self.inner.lock().expect("stats lock").clone();
        workers.sort_by_key(|w| w.worker);
        BuildStats { workers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sorts_by_worker_index() {
        let agg = StatsAggregator::new();
        let mut b = WorkerStats::for_worker(1);
        b.mappings = 3;
        b.cache_tasks = 5;
        agg.add_worker(b);
        let mut a = WorkerStats::for_worker(0);
        a.shadow_maps = 2;
        a.rejected = 1;
        agg.add_worker(a);

        let stats = agg.snapshot();
        assert_eq!(stats.workers[0].worker, 0);
        assert_eq!(stats.workers[1].worker, 1);
        assert_eq!(stats.total_primary(), 5);
        assert_eq!(stats.total_helper(), 5);
        assert_eq!(stats.total_rejected(), 1);
    }
}
