use std::sync::Arc;

use licht_build::{kernels, run_build};
use licht_export::CollectingExporter;
use licht_farm::FarmAgent;
use licht_scene::{BuildSettings, Scene};
use uuid::Uuid;

fn build_settings(workers: usize, seed: u64) -> BuildSettings {
    BuildSettings {
        worker_threads: workers,
        seed,
        quality: 0.5,
        direct_photons: 256,
        indirect_photons: 256,
        radiosity_bounces: 1,
        volume_sample_tasks: 2,
        volume_samples_per_task: 4,
        visibility_buckets: 2,
        volumetric_cells: 3,
        volumetric_bricks_per_cell: 2,
        distance_field_layers: 3,
        cache_task_texels: 32,
        shadow_map_size: 4,
        request_wait_ms: 5,
        ..BuildSettings::default()
    }
}

#[test]
fn full_build_exports_everything() {
    let settings = build_settings(2, 9);
    let scene = Arc::new(Scene::synthetic(24, 9, &settings));
    let mut shadow_casters: Vec<Uuid> = scene
        .lights
        .iter()
        .filter(|l| l.casts_static_shadow)
        .map(|l| l.id)
        .collect();
    let agent = FarmAgent::seed(&scene.task_ids());
    let exporter = Arc::new(CollectingExporter::new());

    let report = run_build(
        Arc::clone(&scene),
        settings,
        Arc::new(agent.client()),
        exporter.clone(),
    )
    .unwrap();

    assert!(report.completed);
    assert!(!report.cancelled);
    assert_eq!(report.workers, 2);
    assert_eq!(report.exported.mappings, 24);
    assert_eq!(report.exported.visibility_buckets, 2);
    assert_eq!(report.exported.volumetric_cells, 3);
    assert_eq!(report.exported.shadow_maps, shadow_casters.len());
    assert_eq!(report.exported.volume_sample_sets, 1);
    assert_eq!(report.exported.mesh_area_light_sets, 1);
    assert_eq!(report.exported.distance_fields, 1);

    let mut expected_mappings: Vec<Uuid> = scene.mappings.iter().map(|m| m.id).collect();
    expected_mappings.sort();
    let mut exported_mappings = exporter.mapping_ids();
    exported_mappings.sort();
    assert_eq!(exported_mappings, expected_mappings);

    shadow_casters.sort();
    let mut exported_shadows = exporter.shadow_map_light_ids();
    exported_shadows.sort();
    assert_eq!(exported_shadows, shadow_casters);

    assert_eq!(exporter.volume_sample_count(), 8);

    let fields = exporter.distance_fields();
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].layer_count, 3);
    assert_eq!(
        fields[0].values.len(),
        3 * kernels::DISTANCE_FIELD_DIM * kernels::DISTANCE_FIELD_DIM
    );

    assert_eq!(exporter.open_batches(), 0);
    assert!(agent.is_done());
    assert_eq!(agent.completed_count(), agent.unique_total());
}

fn run_once(
    workers: usize,
) -> (
    Vec<(Uuid, Vec<[f32; 3]>)>,
    Vec<f32>,
    Vec<([f32; 3], [f32; 3])>,
) {
    let settings = build_settings(workers, 41);
    let scene = Arc::new(Scene::synthetic(12, 7, &settings));
    let agent = FarmAgent::seed(&scene.task_ids());
    let exporter = Arc::new(CollectingExporter::new());

    let report = run_build(scene, settings, Arc::new(agent.client()), exporter.clone()).unwrap();
    assert!(report.completed);

    let mut mappings: Vec<(Uuid, Vec<[f32; 3]>)> = exporter
        .mappings()
        .into_iter()
        .map(|m| (m.id, m.texels))
        .collect();
    mappings.sort_by_key(|(id, _)| *id);

    let fields = exporter.distance_fields();
    assert_eq!(fields.len(), 1);

    // Samples are assembled in task-index order, already deterministic.
    let samples: Vec<([f32; 3], [f32; 3])> = exporter
        .volume_samples()
        .into_iter()
        .flat_map(|set| set.samples)
        .map(|s| ([s.position.x, s.position.y, s.position.z], s.irradiance))
        .collect();

    (mappings, fields[0].values.clone(), samples)
}

// The whole point of per-task seeding: worker count changes who computes
// what, never what comes out.
#[test]
fn output_is_identical_across_worker_counts() {
    let (map_a, field_a, samples_a) = run_once(1);
    let (map_b, field_b, samples_b) = run_once(4);

    assert_eq!(map_a, map_b);
    assert_eq!(field_a, field_b);
    assert_eq!(samples_a, samples_b);
}

#[test]
fn empty_scene_completes_instantly() {
    let settings = BuildSettings {
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
    };
    let scene = Arc::new(Scene::from_toml_str("name = \"empty\"", &settings).unwrap());
    let agent = FarmAgent::seed(&scene.task_ids());
    let exporter = Arc::new(CollectingExporter::new());

    let report = run_build(scene, settings, Arc::new(agent.client()), exporter.clone()).unwrap();

    assert!(report.completed);
    assert!(!report.cancelled);
    assert_eq!(report.exported.total(), 0);
    assert_eq!(exporter.total_exports(), 0);
    assert!(agent.is_done());
}
