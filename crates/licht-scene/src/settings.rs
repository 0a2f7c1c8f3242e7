//! Build settings consumed once during setup, never during the parallel phase.

use std::path::Path;

use serde::Deserialize;
use uuid::Uuid;

use crate::SceneError;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Worker thread count; 0 derives it from the detected core count.
    pub worker_threads: usize,
    /// Global sample-count multiplier applied to the kernels.
    pub quality: f32,
    pub seed: u64,
    /// Bounded wait passed to each primary task request.
    pub request_wait_ms: u64,
    /// Worker sleep when neither primary nor helper work was found.
    pub worker_idle_sleep_ms: u64,
    /// Orchestrator sleep when a drain pass made no progress.
    pub orchestrator_sleep_ms: u64,

    pub photon_mapping: bool,
    pub direct_photons: usize,
    pub indirect_photons: usize,
    pub photon_search_radius: f32,

    pub radiosity: bool,
    pub radiosity_bounces: usize,

    pub volume_sample_tasks: usize,
    pub volume_samples_per_task: usize,
    pub visibility_buckets: usize,
    pub volumetric_cells: usize,
    pub volumetric_bricks_per_cell: usize,
    pub distance_field_layers: usize,
    pub mesh_area_lights: bool,

    /// Texels handed to one indirect-cache (and one interpolation) sub-task.
    pub cache_task_texels: usize,
    pub shadow_map_size: usize,

    pub debug: DebugSettings,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    /// Panic while processing this mapping; exercises the worker fault path.
    pub fail_mapping: Option<Uuid>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            quality: 1.0,
            seed: 0,
            request_wait_ms: 10,
            worker_idle_sleep_ms: 1,
            orchestrator_sleep_ms: 10,
            photon_mapping: true,
            direct_photons: 2048,
            indirect_photons: 4096,
            photon_search_radius: 4.0,
            radiosity: true,
            radiosity_bounces: 2,
            volume_sample_tasks: 4,
            volume_samples_per_task: 16,
            visibility_buckets: 4,
            volumetric_cells: 8,
            volumetric_bricks_per_cell: 4,
            distance_field_layers: 8,
            mesh_area_lights: true,
            cache_task_texels: 64,
            shadow_map_size: 16,
            debug: DebugSettings::default(),
        }
    }
}

impl BuildSettings {
    pub fn load(path: &Path) -> Result<Self, SceneError> {
        let text = std::fs::read_to_string(path).map_err(|source| SceneError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: BuildSettings =
            toml::from_str(&text).map_err(|source| SceneError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate();
        Ok(settings)
    }

    /// Clamp out-of-range values instead of failing the build over them.
    pub fn validate(&mut self) {
        let quality = self.quality.clamp(0.25, 4.0);
        if quality != self.quality {
            log::warn!(
                target: "licht::scene",
                "quality {} out of range, clamped to {}",
                self.quality,
                quality
            );
            self.quality = quality;
        }
        if self.radiosity_bounces > 8 {
            log::warn!(
                target: "licht::scene",
                "radiosity_bounces {} too high, clamped to 8",
                self.radiosity_bounces
            );
            self.radiosity_bounces = 8;
        }
        self.request_wait_ms = self.request_wait_ms.max(1);
        self.cache_task_texels = self.cache_task_texels.max(1);
        self.volume_samples_per_task = self.volume_samples_per_task.max(1);
        self.volumetric_bricks_per_cell = self.volumetric_bricks_per_cell.max(1);
        self.shadow_map_size = self.shadow_map_size.clamp(2, 512);
        self.photon_search_radius = self.photon_search_radius.max(0.1);
    }

    /// Effective worker count respecting the override.
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_validate() {
        let mut s = BuildSettings::default();
        let before = format!("{s:?}");
        s.validate();
        assert_eq!(before, format!("{s:?}"));
    }

    #[test]
    fn out_of_range_values_clamp() {
        let mut s = BuildSettings {
            quality: 100.0,
            radiosity_bounces: 40,
            request_wait_ms: 0,
            cache_task_texels: 0,
            shadow_map_size: 100_000,
            ..BuildSettings::default()
        };
        s.validate();
        assert_eq!(s.quality, 4.0);
        assert_eq!(s.radiosity_bounces, 8);
        assert_eq!(s.request_wait_ms, 1);
        assert_eq!(s.cache_task_texels, 1);
        assert_eq!(s.shadow_map_size, 512);
    }

    #[test]
    fn parses_partial_toml() {
        let s: BuildSettings = toml::from_str(
            r#"
            worker_threads = 3
            radiosity = false

            [debug]
            fail_mapping = "2c9a3f5e-8d41-4b76-a1c0-57e29b68d3f4"
            "#,
        )
        .unwrap();
        assert_eq!(s.worker_threads, 3);
        assert!(!s.radiosity);
        assert!(s.photon_mapping);
        assert!(s.debug.fail_mapping.is_some());
    }
}
