//! Worker threads. Each one runs the same pull loop: poke the distance
//! field board, request a primary task from the distribution tier, and fall
//! back through the helper queues when the tier has nothing to hand out.
//! A panic anywhere in the loop is contained to the one thread; its claimed
//! work is simply never completed and the orchestrator winds the build down.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use licht_export::VolumeSample;
use licht_scene::TaskKind;
use uuid::Uuid;

use crate::context::{BuildContext, LayerTask, VolumeSampleTask};
use crate::kernels;
use crate::mapping;
use crate::queues::IndexedClaim;
use crate::stats::WorkerStats;

/// Orchestrator-side handle for one spawned worker.
pub struct WorkerRecord {
    pub index: usize,
    pub is_complete: Arc<AtomicBool>,
    pub faulted: Arc<AtomicBool>,
    pub fault_message: Arc<Mutex<Option<String>>>,
    pub handle: Option<JoinHandle<WorkerStats>>,
}

pub fn spawn_worker(ctx: Arc<BuildContext>, index: usize) -> WorkerRecord {
    let is_complete = Arc::new(AtomicBool::new(false));
    let faulted = Arc::new(AtomicBool::new(false));
    let fault_message = Arc::new(Mutex::new(None));

    let handle = {
        let is_complete = Arc::clone(&is_complete);
        let faulted = Arc::clone(&faulted);
        let fault_message = Arc::clone(&fault_message);
        thread::spawn(move || worker_main(ctx, index, &is_complete, &faulted, &fault_message))
    };

    WorkerRecord {
        index,
        is_complete,
        faulted,
        fault_message,
        handle: Some(handle),
    }
}

/// Thread body: the loop wrapped in a panic boundary. `is_complete` rises on
/// every exit path so the orchestrator can join without guessing.
fn worker_main(
    ctx: Arc<BuildContext>,
    index: usize,
    is_complete: &AtomicBool,
    faulted: &AtomicBool,
    fault_message: &Mutex<Option<String>>,
) -> WorkerStats {
    let mut stats = WorkerStats::for_worker(index);
    let current_task = Mutex::new(None::<String>);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        worker_loop(&ctx, &current_task, &mut stats);
    }));
    if let Err(payload) = outcome {
        let reason = panic_text(payload.as_ref());
        let message = match current_task.lock().unwrap().take() {
            Some(label) => format!("while processing {label}: {reason}"),
            None => reason,
        };
        log::error!(target: "licht::build", "worker {index} faulted: {message}");
        *fault_message.lock().unwrap() = Some(message);
        faulted.store(true, Ordering::Release);
    }
    is_complete.store(true, Ordering::Release);
    stats
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

enum Fetch {
    Got { id: Uuid, kind: TaskKind },
    TimedOut,
    Exhausted,
}

fn worker_loop(ctx: &BuildContext, current_task: &Mutex<Option<String>>, stats: &mut WorkerStats) {
    let wait = Duration::from_millis(ctx.settings.request_wait_ms);
    let idle = Duration::from_millis(ctx.settings.worker_idle_sleep_ms);

    loop {
        let mut processed = false;

        // Distance field layers come first every pass: the board does not go
        // through the distribution tier and any worker can chip one in before
        // its next primary fetch.
        if let Some((_, task, claim)) = ctx.distance_field.try_claim() {
            let layer = task.layer;
            let started = Instant::now();
            run_layer_task(ctx, layer, claim, stats);
            stats.execution += started.elapsed();
            processed = true;
        }

        let fetch = fetch_primary(ctx, stats, wait);
        if let Fetch::Got { id, kind } = fetch {
            dispatch(ctx, id, kind, current_task, stats);
            continue;
        }

        // Helper tier, in pipeline order. One unit per pass so primary
        // requests stay responsive.
        if let Some(task) = ctx.cache_tasks.try_pop() {
            let started = Instant::now();
            mapping::run_cache_task(ctx, task, stats);
            stats.execution += started.elapsed();
            processed = true;
        } else if let Some(task) = ctx.interpolate_tasks.try_pop() {
            let started = Instant::now();
            mapping::run_interpolate_task(task, stats);
            stats.execution += started.elapsed();
            processed = true;
        } else if let Some(task) = ctx.brick_tasks.try_pop() {
            let started = Instant::now();
            mapping::run_brick_task(ctx, task, stats);
            stats.execution += started.elapsed();
            processed = true;
        } else if let Some((_, task, claim)) = ctx.volume_samples.try_claim() {
            let index = task.index;
            let started = Instant::now();
            run_volume_sample_task(ctx, index, claim, stats);
            stats.execution += started.elapsed();
            processed = true;
        }

        if processed {
            continue;
        }
        // Exit only when no new primary can ever arrive AND nothing in-flight
        // could still push helper work: every help scope closed and both task
        // boards fully drained.
        if matches!(fetch, Fetch::Exhausted)
            && !ctx.help_owed()
            && ctx.volume_samples.outstanding() == 0
            && ctx.distance_field.outstanding() == 0
        {
            return;
        }
        let slept = Instant::now();
        thread::sleep(idle);
        stats.idle += slept.elapsed();
    }
}

/// One bounded request against the distribution tier, including the local
/// claim race for mapping ids.
fn fetch_primary(ctx: &BuildContext, stats: &mut WorkerStats, wait: Duration) -> Fetch {
    if ctx.primary_exhausted() {
        return Fetch::Exhausted;
    }
    let started = Instant::now();
    let id = ctx.source.request_task(wait);
    stats.request += started.elapsed();
    let Some(id) = id else {
        return Fetch::TimedOut;
    };
    match ctx.scene.classify(id) {
        Some(kind @ TaskKind::Mapping(index)) => {
            // Redundant hand-outs mean two workers can hold the same id; the
            // swap picks exactly one owner and the loser returns it.
            if ctx.scene.mappings[index].try_claim() {
                ctx.source.accept_task(id);
                Fetch::Got { id, kind }
            } else {
                ctx.source.reject_task(id);
                stats.rejected += 1;
                Fetch::TimedOut
            }
        }
        Some(kind) => {
            ctx.source.accept_task(id);
            Fetch::Got { id, kind }
        }
        None => {
            log::warn!(target: "licht::farm", "rejecting task {id}: not in this scene");
            ctx.source.reject_task(id);
            stats.rejected += 1;
            Fetch::TimedOut
        }
    }
}

fn dispatch(
    ctx: &BuildContext,
    id: Uuid,
    kind: TaskKind,
    current_task: &Mutex<Option<String>>,
    stats: &mut WorkerStats,
) {
    *current_task.lock().unwrap() = Some(format!("{} task {id}", kind.label()));
    let started = Instant::now();
    match kind {
        TaskKind::Mapping(index) => {
            let data = mapping::process_mapping(ctx, index, stats);
            ctx.mapping_results.push(data, stats.worker);
            stats.mappings += 1;
        }
        TaskKind::PrecomputedVisibility(bucket) => {
            let data = kernels::visibility_bucket_data(
                ctx.scene.importance_volume,
                id,
                bucket,
                ctx.scene.visibility_bucket_ids.len(),
            );
            ctx.visibility_results.push(data, stats.worker);
            stats.visibility_buckets += 1;
        }
        TaskKind::VolumetricLightmapCell(cell) => {
            let data = mapping::process_volumetric_cell(ctx, cell, stats);
            ctx.volumetric_results.push(data, stats.worker);
            stats.volumetric_cells += 1;
        }
        TaskKind::ShadowDepthMap(light_id) => {
            // classify() only returns this kind for a known shadow caster.
            if let Some(light) = ctx.scene.lights.iter().find(|l| l.id == light_id) {
                let data = kernels::shadow_depth_map(
                    ctx.scene.bounds,
                    light,
                    ctx.settings.shadow_map_size,
                );
                ctx.shadow_maps.lock().unwrap().insert(light_id, data);
                stats.shadow_maps += 1;
            }
        }
        TaskKind::VolumeSamples => {
            let tasks = (0..ctx.scene.volume_sample_task_count)
                .map(|index| VolumeSampleTask { index })
                .collect();
            if ctx.volume_samples.publish(tasks) == 0 {
                // Empty board never raises its ready flag, so the sentinel
                // has to be closed out here.
                ctx.source.task_completed(id);
            }
        }
        TaskKind::VolumeDistanceField => {
            let tasks = (0..ctx.scene.distance_field_layer_count)
                .map(|layer| LayerTask { layer })
                .collect();
            if ctx.distance_field.publish(tasks) == 0 {
                ctx.source.task_completed(id);
            }
        }
        TaskKind::MeshAreaLightData => {
            // Patches were extracted during setup; the task just marks them
            // ready for export.
            ctx.mesh_area_ready.raise();
        }
    }
    stats.execution += started.elapsed();
    *current_task.lock().unwrap() = None;
}

fn run_volume_sample_task(
    ctx: &BuildContext,
    index: usize,
    claim: IndexedClaim<'_, VolumeSampleTask, Vec<VolumeSample>>,
    stats: &mut WorkerStats,
) {
    let mut scratch = ctx.scratch.acquire();
    // Stream keyed by task index, not by worker, so placement is immaterial.
    scratch.reseed(ctx.task_seed(index as u64));
    let positions = kernels::volume_sample_positions(
        ctx.scene.importance_volume,
        ctx.settings.volume_samples_per_task,
        &mut scratch.rng,
    );
    let samples = positions
        .into_iter()
        .map(|position| VolumeSample {
            position,
            irradiance: kernels::sample_irradiance(
                &ctx.shared.photon_map,
                &ctx.scene.lights,
                &ctx.shared.hemisphere,
                position,
            ),
        })
        .collect();
    claim.complete(samples);
    stats.volume_sample_tasks += 1;
}

fn run_layer_task(
    ctx: &BuildContext,
    layer: usize,
    claim: IndexedClaim<'_, LayerTask, Vec<f32>>,
    stats: &mut WorkerStats,
) {
    let values = kernels::distance_field_layer(
        ctx.scene.importance_volume,
        &ctx.scene.mappings,
        layer,
        ctx.scene.distance_field_layer_count,
    );
    claim.complete(values);
    stats.distance_field_layers += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use licht_farm::FarmAgent;
    use licht_scene::{BuildSettings, Scene};
    use crate::shared::SharedBuildState;

    fn quiet_settings() -> BuildSettings {
        BuildSettings {
            worker_threads: 1,
            photon_mapping: false,
            radiosity: false,
            volume_sample_tasks: 0,
            visibility_buckets: 0,
            volumetric_cells: 0,
            distance_field_layers: 0,
            mesh_area_lights: false,
            request_wait_ms: 2,
            ..BuildSettings::default()
        }
    }

    fn context_for(scene: Scene, settings: BuildSettings) -> (Arc<BuildContext>, FarmAgent) {
        let scene = Arc::new(scene);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let (shared, _) = SharedBuildState::build(&scene, &settings, &pool);
        let agent = FarmAgent::seed(&scene.task_ids());
        let ctx = BuildContext::new(scene, settings, Arc::new(shared), Arc::new(agent.client()));
        (ctx, agent)
    }

    #[test]
    fn worker_exits_cleanly_with_nothing_seeded() {
        let settings = quiet_settings();
        let scene = Scene::from_toml_str("name = \"empty\"", &settings).unwrap();
        let (ctx, agent) = context_for(scene, settings);
        let record = spawn_worker(Arc::clone(&ctx), 0);
        let stats = record.handle.unwrap().join().unwrap();
        assert!(agent.is_done());
        assert!(record.is_complete.load(Ordering::Acquire));
        assert!(!record.faulted.load(Ordering::Acquire));
        assert_eq!(stats.primary_tasks(), 0);
    }

    #[test]
    fn injected_panic_becomes_fault_message() {
        let mut settings = quiet_settings();
        let scene = Scene::synthetic(1, 3, &settings);
        settings.debug.fail_mapping = Some(scene.mappings[0].id);
        let (ctx, _agent) = context_for(scene, settings);
        let record = spawn_worker(Arc::clone(&ctx), 0);
        let stats = record.handle.unwrap().join().unwrap();
        assert!(record.faulted.load(Ordering::Acquire));
        assert!(record.is_complete.load(Ordering::Acquire));
        let message = record.fault_message.lock().unwrap().clone().unwrap();
        assert!(message.contains("while processing mapping task"));
        assert!(message.contains("debug fault injected"));
        assert_eq!(stats.mappings, 0);
        // Claim landed before the panic; nothing may redeliver the mapping.
        assert!(ctx.scene.mappings[0].is_claimed());
    }

    #[test]
    fn quit_lets_worker_exit_mid_build() {
        let settings = quiet_settings();
        let scene = Scene::synthetic(64, 5, &settings);
        let (ctx, agent) = context_for(scene, settings);
        agent.request_quit();
        let record = spawn_worker(Arc::clone(&ctx), 0);
        let stats = record.handle.unwrap().join().unwrap();
        assert!(!record.faulted.load(Ordering::Acquire));
        assert!(!agent.is_done());
        assert_eq!(stats.primary_tasks() + stats.helper_tasks(), 0);
    }
}
