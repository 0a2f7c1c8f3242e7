//! Owner-side processing for the two task kinds that fan sub-tasks out onto
//! the shared help queues: texture mappings and volumetric lightmap cells.
//! The owner pushes its sub-tasks, then drains the same queue alongside every
//! idle worker until its own group is complete.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use licht_export::{MappingLightData, VolumetricCellData};
use licht_scene::ids;

use crate::context::{BrickTask, BuildContext, CacheTask, InterpolateTask};
use crate::kernels::{self, BRICK_DIM, CacheEntry};
use crate::queues::HelpGroup;
use crate::stats::WorkerStats;

/// Cuts `total` texels into `(start, len)` chunks of at most `chunk`.
pub fn split_ranges(total: usize, chunk: usize) -> Vec<(usize, usize)> {
    let chunk = chunk.max(1);
    let mut out = Vec::with_capacity(total.div_ceil(chunk));
    let mut start = 0;
    while start < total {
        let len = chunk.min(total - start);
        out.push((start, len));
        start += len;
    }
    out
}

/// Full lighting pipeline for one mapping: direct pass, distributed
/// irradiance cache, distributed interpolation, final texel assembly.
/// Blocks until every sub-task it published has been completed or dropped;
/// dropped sub-tasks leave zeroed texels instead of stalling the owner.
pub fn process_mapping(
    ctx: &BuildContext,
    index: usize,
    stats: &mut WorkerStats,
) -> MappingLightData {
    let mapping = &ctx.scene.mappings[index];
    if ctx.settings.debug.fail_mapping == Some(mapping.id) {
        panic!("debug fault injected");
    }

    let _scope = ctx.help_scope();
    let mut scratch = ctx.scratch.acquire();
    let texels = mapping.texel_count();
    let width = mapping.width as usize;
    let normal = mapping.normal();

    scratch.direct.resize(texels, 0.0);
    for t in 0..texels {
        let x = (t % width) as u32;
        let y = (t / width) as u32;
        let p = mapping.texel_position(x, y);
        scratch.direct[t] = kernels::direct_irradiance(&ctx.scene.lights, p, normal);
    }

    let ranges = split_ranges(texels, ctx.settings.cache_task_texels);

    // Cache stage. Records land back indexed by range, so the flattened list
    // is ascending by texel regardless of who ran which range.
    let cache_group = HelpGroup::new();
    for (i, &(start, len)) in ranges.iter().enumerate() {
        ctx.cache_tasks.push(CacheTask {
            mapping: index,
            start,
            len,
            ticket: cache_group.ticket(i),
        });
    }
    help_until_complete(&cache_group, stats, |stats| {
        match ctx.cache_tasks.try_pop() {
            Some(task) => {
                run_cache_task(ctx, task, stats);
                true
            }
            None => false,
        }
    });
    let entries: Arc<Vec<CacheEntry>> = Arc::new(
        cache_group
            .into_results()
            .into_iter()
            .flat_map(|(_, chunk)| chunk)
            .collect(),
    );

    // Interpolation stage over the assembled cache.
    scratch.indirect.resize(texels, 0.0);
    let interp_group = HelpGroup::new();
    for (i, &(start, len)) in ranges.iter().enumerate() {
        ctx.interpolate_tasks.push(InterpolateTask {
            mapping: index,
            start,
            len,
            entries: Arc::clone(&entries),
            ticket: interp_group.ticket(i),
        });
    }
    help_until_complete(&interp_group, stats, |stats| {
        match ctx.interpolate_tasks.try_pop() {
            Some(task) => {
                run_interpolate_task(task, stats);
                true
            }
            None => false,
        }
    });
    for (i, values) in interp_group.into_results() {
        let (start, len) = ranges[i];
        scratch.indirect[start..start + len].copy_from_slice(&values);
    }

    let texels = (0..texels)
        .map(|t| {
            let v = scratch.direct[t] + scratch.indirect[t] + mapping.emissive;
            [v, v, v]
        })
        .collect();
    MappingLightData {
        id: mapping.id,
        width: mapping.width,
        height: mapping.height,
        texels,
    }
}

/// One volumetric lightmap cell: bricks are farmed out on the shared queue
/// and stitched back in brick order.
pub fn process_volumetric_cell(
    ctx: &BuildContext,
    cell: usize,
    stats: &mut WorkerStats,
) -> VolumetricCellData {
    let _scope = ctx.help_scope();
    let bounds = kernels::volumetric_cell_bounds(
        ctx.scene.importance_volume,
        cell,
        ctx.scene.volumetric_cell_count,
    );
    let brick_count = ctx.settings.volumetric_bricks_per_cell;

    let group = HelpGroup::new();
    for brick in 0..brick_count {
        ctx.brick_tasks.push(BrickTask {
            cell_bounds: bounds,
            brick,
            brick_count,
            ticket: group.ticket(brick),
        });
    }
    help_until_complete(&group, stats, |stats| {
        match ctx.brick_tasks.try_pop() {
            Some(task) => {
                run_brick_task(ctx, task, stats);
                true
            }
            None => false,
        }
    });

    let brick_len = BRICK_DIM * BRICK_DIM * BRICK_DIM;
    let mut values = vec![[0.0f32; 3]; brick_count * brick_len];
    for (i, brick) in group.into_results() {
        values[i * brick_len..i * brick_len + brick.len()].copy_from_slice(&brick);
    }
    VolumetricCellData {
        id: ids::volumetric_cell(cell),
        cell,
        brick_count,
        values,
    }
}

pub(crate) fn run_cache_task(ctx: &BuildContext, task: CacheTask, stats: &mut WorkerStats) {
    let mapping = &ctx.scene.mappings[task.mapping];
    let cache = &ctx.shared.surface_caches[task.mapping];
    let entries = kernels::cache_entries(
        &ctx.shared.photon_map,
        cache,
        &ctx.shared.hemisphere,
        mapping,
        task.start,
        task.len,
    );
    stats.cache_tasks += 1;
    task.ticket.complete(entries);
}

pub(crate) fn run_interpolate_task(task: InterpolateTask, stats: &mut WorkerStats) {
    let values = kernels::interpolate_range(&task.entries, task.start, task.len);
    stats.interpolate_tasks += 1;
    task.ticket.complete(values);
}

pub(crate) fn run_brick_task(ctx: &BuildContext, task: BrickTask, stats: &mut WorkerStats) {
    let values = kernels::brick_values(
        &ctx.shared.photon_map,
        &ctx.scene.lights,
        task.cell_bounds,
        task.brick,
        task.brick_count,
    );
    stats.brick_tasks += 1;
    task.ticket.complete(values);
}

/// Drains one help queue until `group` has no outstanding sub-tasks. Time
/// spent finding the queue empty is billed to `blocked_on_help`.
fn help_until_complete<R>(
    group: &HelpGroup<R>,
    stats: &mut WorkerStats,
    mut run_one: impl FnMut(&mut WorkerStats) -> bool,
) {
    while !group.is_complete() {
        if !run_one(stats) {
            let wait = Instant::now();
            thread::yield_now();
            stats.blocked_on_help += wait.elapsed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use licht_farm::FarmAgent;
    use licht_scene::{BuildSettings, Scene};
    use std::sync::Arc;

    fn test_context(mapping_count: usize, seed: u64) -> Arc<BuildContext> {
        let settings = BuildSettings {
            worker_threads: 1,
            photon_mapping: false,
            radiosity: false,
            cache_task_texels: 16,
            ..BuildSettings::default()
        };
        let scene = Arc::new(Scene::synthetic(mapping_count, seed, &settings));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let (shared, _) = crate::shared::SharedBuildState::build(&scene, &settings, &pool);
        let agent = FarmAgent::seed(&scene.task_ids());
        BuildContext::new(scene, settings, Arc::new(shared), Arc::new(agent.client()))
    }

    #[test]
    fn ranges_cover_exactly_once() {
        let ranges = split_ranges(100, 16);
        let mut covered = vec![0u8; 100];
        for (start, len) in ranges {
            for t in start..start + len {
                covered[t] += 1;
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
        assert!(split_ranges(0, 16).is_empty());
        assert_eq!(split_ranges(5, 100), vec![(0, 5)]);
    }

    #[test]
    fn mapping_pipeline_fills_every_texel() {
        let ctx = test_context(3, 11);
        let mut stats = WorkerStats::for_worker(0);
        let data = process_mapping(&ctx, 0, &mut stats);
        let m = &ctx.scene.mappings[0];
        assert_eq!(data.id, m.id);
        assert_eq!(data.texels.len(), m.texel_count());
        assert!(stats.cache_tasks > 0);
        assert_eq!(stats.cache_tasks, stats.interpolate_tasks);
        // Texels are grayscale and carry at least the emissive floor.
        for t in &data.texels {
            assert_eq!(t[0], t[1]);
            assert_eq!(t[1], t[2]);
            assert!(t[0] >= m.emissive);
        }
        assert!(!ctx.help_owed());
        assert!(ctx.cache_tasks.is_empty());
        assert!(ctx.interpolate_tasks.is_empty());
    }

    #[test]
    fn mapping_output_is_repeatable() {
        let ctx = test_context(2, 5);
        let mut stats = WorkerStats::for_worker(0);
        let a = process_mapping(&ctx, 1, &mut stats);
        let b = process_mapping(&ctx, 1, &mut stats);
        assert_eq!(a.texels, b.texels);
    }

    #[test]
    fn volumetric_cell_assembles_all_bricks() {
        let ctx = test_context(2, 7);
        let mut stats = WorkerStats::for_worker(0);
        let data = process_volumetric_cell(&ctx, 1, &mut stats);
        assert_eq!(data.cell, 1);
        assert_eq!(data.id, ids::volumetric_cell(1));
        assert_eq!(
            data.values.len(),
            ctx.settings.volumetric_bricks_per_cell * BRICK_DIM * BRICK_DIM * BRICK_DIM
        );
        assert_eq!(stats.brick_tasks, ctx.settings.volumetric_bricks_per_cell);
        assert!(ctx.brick_tasks.is_empty());
    }

    #[test]
    #[should_panic(expected = "debug fault injected")]
    fn fail_mapping_setting_trips_the_worker() {
        let mut ctx = test_context(1, 3);
        let id = ctx.scene.mappings[0].id;
        Arc::get_mut(&mut ctx).unwrap().settings.debug.fail_mapping = Some(id);
        let mut stats = WorkerStats::for_worker(0);
        let _ = process_mapping(&ctx, 0, &mut stats);
    }
}
