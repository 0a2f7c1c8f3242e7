//! Per-build shared context. One `Arc<BuildContext>` is handed to every
//! worker and to the orchestrator's drain pump; nothing lives in globals.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use licht_export::{
    MappingLightData, ShadowDepthMapData, VisibilityData, VolumeSample, VolumetricCellData,
};
use licht_farm::TaskSource;
use licht_geom::Aabb;
use licht_scene::{BuildSettings, Scene};
use uuid::Uuid;

use crate::kernels::CacheEntry;
use crate::queues::{GroupTicket, IndexedTasks, OneShotFlag, SharedQueue};
use crate::results::ResultList;
use crate::scratch::ScratchPool;
use crate::shared::SharedBuildState;
use crate::stats::StatsAggregator;

/// Cache-stage sub-task: indirect irradiance records for one texel range of
/// the owning mapping.
pub struct CacheTask {
    pub mapping: usize,
    pub start: usize,
    pub len: usize,
    pub ticket: GroupTicket<Vec<CacheEntry>>,
}

/// Interpolation-stage sub-task, carrying the owner's assembled cache.
pub struct InterpolateTask {
    pub mapping: usize,
    pub start: usize,
    pub len: usize,
    pub entries: Arc<Vec<CacheEntry>>,
    pub ticket: GroupTicket<Vec<f32>>,
}

/// One brick of a volumetric-lightmap cell.
pub struct BrickTask {
    pub cell_bounds: Aabb,
    pub brick: usize,
    pub brick_count: usize,
    pub ticket: GroupTicket<Vec<[f32; 3]>>,
}

/// Volume-sample board entry; the kernel derives sample positions from the
/// task index, so the descriptor is just the index.
#[derive(Clone, Copy, Debug)]
pub struct VolumeSampleTask {
    pub index: usize,
}

/// Distance-field board entry: one horizontal layer.
#[derive(Clone, Copy, Debug)]
pub struct LayerTask {
    pub layer: usize,
}

pub struct BuildContext {
    pub scene: Arc<Scene>,
    pub settings: BuildSettings,
    pub shared: Arc<SharedBuildState>,
    pub source: Arc<dyn TaskSource>,

    pub cache_tasks: SharedQueue<CacheTask>,
    pub interpolate_tasks: SharedQueue<InterpolateTask>,
    pub brick_tasks: SharedQueue<BrickTask>,
    pub volume_samples: IndexedTasks<VolumeSampleTask, Vec<VolumeSample>>,
    pub distance_field: IndexedTasks<LayerTask, Vec<f32>>,
    pub mesh_area_ready: OneShotFlag,

    pub mapping_results: ResultList<MappingLightData>,
    pub visibility_results: ResultList<VisibilityData>,
    pub volumetric_results: ResultList<VolumetricCellData>,
    /// Written by workers under the lock, swapped out whole by the drain.
    pub shadow_maps: Mutex<HashMap<Uuid, ShadowDepthMapData>>,

    pub scratch: ScratchPool,
    pub stats: StatsAggregator,

    tasks_needing_help: AtomicUsize,
    cancel: AtomicBool,
}

impl BuildContext {
    pub fn new(
        scene: Arc<Scene>,
        settings: BuildSettings,
        shared: Arc<SharedBuildState>,
        source: Arc<dyn TaskSource>,
    ) -> Arc<Self> {
        let workers = settings.effective_workers();
        Arc::new(Self {
            scene,
            settings,
            shared,
            source,
            cache_tasks: SharedQueue::new(),
            interpolate_tasks: SharedQueue::new(),
            brick_tasks: SharedQueue::new(),
            volume_samples: IndexedTasks::new(),
            distance_field: IndexedTasks::new(),
            mesh_area_ready: OneShotFlag::new(),
            mapping_results: ResultList::new(),
            visibility_results: ResultList::new(),
            volumetric_results: ResultList::new(),
            shadow_maps: Mutex::new(HashMap::new()),
            scratch: ScratchPool::with_capacity_from_workers(workers),
            stats: StatsAggregator::new(),
            tasks_needing_help: AtomicUsize::new(0),
            cancel: AtomicBool::new(false),
        })
    }

    /// Held by owners for the lifetime of a task whose sub-tasks land on the
    /// shared queues. Idle workers must not exit while any scope is open.
    pub fn help_scope(&self) -> HelpScope<'_> {
        self.tasks_needing_help.fetch_add(1, Ordering::AcqRel);
        HelpScope {
            counter: &self.tasks_needing_help,
        }
    }

    pub fn help_owed(&self) -> bool {
        self.tasks_needing_help.load(Ordering::Acquire) > 0
    }

    /// Local stop signal; workers stop fetching primary tasks once set.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// True once no further primary task will ever be fetched: the tier ran
    /// dry, a quit arrived, or the orchestrator cancelled locally.
    pub fn primary_exhausted(&self) -> bool {
        self.cancel_requested()
            || self.source.received_quit_request()
            || self.source.is_done()
    }

    /// Salt for per-task RNG streams.
    pub fn task_seed(&self, salt: u64) -> u64 {
        self.settings
            .seed
            .wrapping_add(salt.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

pub struct HelpScope<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for HelpScope<'_> {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "help counter underflow");
    }
}
