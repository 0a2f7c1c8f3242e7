//! Build orchestration. The orchestrator runs the barriered setup phases,
//! spawns the worker pool, and then does exactly two things until the last
//! worker is joined: pump completed results out through the exporter in
//! ascending id order, and watch for faulted workers. It never processes
//! tasks itself, so a stall in the pump can not deadlock the build.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use licht_export::{
    DistanceFieldData, Exporter, Keyed, MeshAreaLightData, ShadowDepthMapData, VolumeSample,
    VolumeSampleData,
};
use licht_farm::{FarmMessage, TaskSource};
use licht_scene::{BuildSettings, Scene, ids};
use rayon::ThreadPoolBuilder;
use uuid::Uuid;

use crate::BuildError;
use crate::context::BuildContext;
use crate::kernels;
use crate::results::ResultList;
use crate::shared::SharedBuildState;
use crate::stats::BuildStats;
use crate::worker::{WorkerRecord, spawn_worker};

/// What left through the exporter, by payload kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportCounts {
    pub mappings: usize,
    pub visibility_buckets: usize,
    pub volumetric_cells: usize,
    pub shadow_maps: usize,
    pub volume_sample_sets: usize,
    pub mesh_area_light_sets: usize,
    pub distance_fields: usize,
}

impl ExportCounts {
    pub fn total(&self) -> usize {
        self.mappings
            + self.visibility_buckets
            + self.volumetric_cells
            + self.shadow_maps
            + self.volume_sample_sets
            + self.mesh_area_light_sets
            + self.distance_fields
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PhaseTimings {
    pub setup: Duration,
    pub parallel: Duration,
    pub total: Duration,
}

/// Summary of a finished (or wound-down) build.
#[derive(Debug)]
pub struct BuildReport {
    pub workers: usize,
    /// A quit request or local cancel stopped the build early.
    pub cancelled: bool,
    /// Every seeded task completed.
    pub completed: bool,
    pub exported: ExportCounts,
    pub timings: PhaseTimings,
    pub stats: BuildStats,
}

/// Runs a full lighting build against `source` and `exporter`. Blocks until
/// every worker has been joined; a worker fault cancels the remaining work
/// and surfaces as an error only after the wind-down finishes.
pub fn run_build(
    scene: Arc<Scene>,
    mut settings: BuildSettings,
    source: Arc<dyn TaskSource>,
    exporter: Arc<dyn Exporter>,
) -> Result<BuildReport, BuildError> {
    let build_started = Instant::now();
    settings.validate();
    let workers = settings.effective_workers();

    log::info!(
        target: "licht::build",
        "building {:?}: {} mappings ({} texels), {} lights, {} workers",
        scene.name,
        scene.mappings.len(),
        scene.total_texels(),
        scene.lights.len(),
        workers,
    );

    let setup_started = Instant::now();
    let (shared, setup_timings) = {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("licht-phase-{i}"))
            .build()
            .expect("phase pool");
        SharedBuildState::build(&scene, &settings, &pool)
    };
    let setup = setup_started.elapsed();
    log::debug!(
        target: "licht::build",
        "setup {:.1?} (samples {:.1?}, photons {:.1?}, radiosity {:.1?}, finalize {:.1?})",
        setup,
        setup_timings.samples,
        setup_timings.photons,
        setup_timings.radiosity,
        setup_timings.finalize,
    );
    source.send_message(FarmMessage::Timing {
        label: "setup".to_string(),
        ms: setup.as_secs_f64() * 1000.0,
    });

    let ctx = BuildContext::new(scene, settings, Arc::new(shared), Arc::clone(&source));

    let parallel_started = Instant::now();
    let mut records: Vec<WorkerRecord> = (0..workers)
        .map(|index| spawn_worker(Arc::clone(&ctx), index))
        .collect();

    let sleep = Duration::from_millis(ctx.settings.orchestrator_sleep_ms);
    let mut counts = ExportCounts::default();
    let mut fault: Option<(usize, String)> = None;

    while !records.is_empty() {
        let mut progressed = drain_pass(&ctx, exporter.as_ref(), &mut counts);

        let mut i = 0;
        while i < records.len() {
            if records[i].is_complete.load(Ordering::Acquire) {
                let mut record = records.swap_remove(i);
                join_worker(&ctx, &mut record, &mut fault);
                progressed = true;
            } else {
                i += 1;
            }
        }
        if !progressed && !records.is_empty() {
            thread::sleep(sleep);
        }
    }
    let parallel = parallel_started.elapsed();
    source.send_message(FarmMessage::Timing {
        label: "parallel".to_string(),
        ms: parallel.as_secs_f64() * 1000.0,
    });

    // Results pushed between the last pump pass and the final join.
    while drain_pass(&ctx, exporter.as_ref(), &mut counts) {}

    let stats = ctx.stats.snapshot();
    stats.log_table();

    if let Some((worker, message)) = fault {
        return Err(BuildError::WorkerFault { worker, message });
    }

    let report = BuildReport {
        workers,
        cancelled: ctx.cancel_requested() || source.received_quit_request(),
        completed: source.is_done(),
        exported: counts,
        timings: PhaseTimings {
            setup,
            parallel,
            total: build_started.elapsed(),
        },
        stats,
    };
    log::info!(
        target: "licht::build",
        "build {} in {:.1?}: {} exports",
        if report.completed { "complete" } else { "stopped" },
        report.timings.total,
        report.exported.total(),
    );
    Ok(report)
}

fn join_worker(
    ctx: &BuildContext,
    record: &mut WorkerRecord,
    fault: &mut Option<(usize, String)>,
) {
    let Some(handle) = record.handle.take() else {
        return;
    };
    match handle.join() {
        Ok(stats) => {
            ctx.stats.add_worker(stats);
            if record.faulted.load(Ordering::Acquire) {
                let message = record
                    .fault_message
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| "unspecified fault".to_string());
                register_fault(ctx, fault, record.index, message);
            }
        }
        // The loop's panic boundary makes this unreachable in practice, but
        // a lost worker must still cancel the build.
        Err(_) => register_fault(
            ctx,
            fault,
            record.index,
            "worker exited outside its panic boundary".to_string(),
        ),
    }
}

/// First fault becomes the build error; the rest are only logged. Either way
/// the claimed task was lost, so the tier can never drain and the remaining
/// workers are told to stop.
fn register_fault(
    ctx: &BuildContext,
    fault: &mut Option<(usize, String)>,
    worker: usize,
    message: String,
) {
    ctx.request_cancel();
    if fault.is_none() {
        *fault = Some((worker, message));
    } else {
        log::error!(target: "licht::build", "worker {worker} also faulted: {message}");
    }
}

/// One pump pass: drain every result list and ready board into the exporter.
/// Returns whether anything moved.
fn drain_pass(ctx: &BuildContext, exporter: &dyn Exporter, counts: &mut ExportCounts) -> bool {
    let mut progressed = false;

    progressed |= drain_list(
        ctx,
        &ctx.mapping_results,
        exporter,
        &mut counts.mappings,
        |e, data, shared| e.export_mapping(data, shared),
    );
    progressed |= drain_list(
        ctx,
        &ctx.visibility_results,
        exporter,
        &mut counts.visibility_buckets,
        |e, data, shared| e.export_visibility(data, shared),
    );
    progressed |= drain_list(
        ctx,
        &ctx.volumetric_results,
        exporter,
        &mut counts.volumetric_cells,
        |e, data, shared| e.export_volumetric_cell(data, shared),
    );

    let pending_shadow_maps: HashMap<Uuid, ShadowDepthMapData> =
        std::mem::take(&mut *ctx.shadow_maps.lock().unwrap());
    if !pending_shadow_maps.is_empty() {
        let mut batch: Vec<ShadowDepthMapData> = pending_shadow_maps.into_values().collect();
        batch.sort_by_key(|d| d.light_id);
        let light_ids: Vec<Uuid> = batch.iter().map(|d| d.light_id).collect();
        let shared = exporter.begin_batch(light_ids[0], batch.len());
        for data in batch {
            exporter.export_shadow_depth_map(data, shared);
        }
        exporter.end_batch();
        counts.shadow_maps += light_ids.len();
        for id in light_ids {
            ctx.source.task_completed(id);
        }
        progressed = true;
    }

    if ctx.volume_samples.take_ready() {
        let samples: Vec<VolumeSample> = ctx
            .volume_samples
            .collect_sorted()
            .into_iter()
            .flat_map(|(_, samples)| samples)
            .collect();
        let data = VolumeSampleData {
            id: ids::VOLUME_SAMPLES,
            samples,
        };
        let shared = exporter.begin_batch(data.id, 1);
        exporter.export_volume_samples(data, shared);
        exporter.end_batch();
        ctx.source.task_completed(ids::VOLUME_SAMPLES);
        counts.volume_sample_sets += 1;
        progressed = true;
    }

    if ctx.mesh_area_ready.take() {
        let data = MeshAreaLightData {
            id: ids::MESH_AREA_LIGHT_DATA,
            patches: ctx.shared.mesh_area_lights.clone(),
        };
        let shared = exporter.begin_batch(data.id, 1);
        exporter.export_mesh_area_lights(data, shared);
        exporter.end_batch();
        ctx.source.task_completed(ids::MESH_AREA_LIGHT_DATA);
        counts.mesh_area_light_sets += 1;
        progressed = true;
    }

    if ctx.distance_field.take_ready() {
        let layers = ctx.scene.distance_field_layer_count;
        let dim = kernels::DISTANCE_FIELD_DIM;
        let mut values = vec![0.0f32; layers * dim * dim];
        // Dropped claims leave zero slabs rather than shifting later layers.
        for (layer, slab) in ctx.distance_field.collect_sorted() {
            let at = layer * dim * dim;
            values[at..at + slab.len()].copy_from_slice(&slab);
        }
        let data = DistanceFieldData {
            id: ids::VOLUME_DISTANCE_FIELD,
            layer_count: layers,
            width: dim,
            height: dim,
            values,
        };
        let shared = exporter.begin_batch(data.id, 1);
        exporter.export_distance_field(data, shared);
        exporter.end_batch();
        ctx.source.task_completed(ids::VOLUME_DISTANCE_FIELD);
        counts.distance_fields += 1;
        progressed = true;
    }

    progressed
}

/// Snapshot one result list, export it as a single ascending-id batch, then
/// report the completions. Completion strictly follows export so a crash
/// never acknowledges a result that did not reach the exporter.
fn drain_list<T: Keyed>(
    ctx: &BuildContext,
    list: &ResultList<T>,
    exporter: &dyn Exporter,
    count: &mut usize,
    export_one: impl Fn(&dyn Exporter, T, bool),
) -> bool {
    let batch = list.drain_sorted();
    if batch.is_empty() {
        return false;
    }
    let task_ids: Vec<Uuid> = batch.iter().map(|r| r.payload.sort_key()).collect();
    let shared = exporter.begin_batch(task_ids[0], batch.len());
    for record in batch {
        export_one(exporter, record.payload, shared);
    }
    exporter.end_batch();
    *count += task_ids.len();
    for id in task_ids {
        ctx.source.task_completed(id);
    }
    true
}
