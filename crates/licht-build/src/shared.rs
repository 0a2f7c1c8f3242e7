//! Read-only state shared by every worker, produced by the barriered setup
//! phases. Each phase runs to completion on the pool before the next starts;
//! mutation only ever happens on the orchestrator thread between phases.

use std::time::{Duration, Instant};

use licht_export::EmissivePatch;
use licht_geom::Vec3;
use licht_scene::{BuildSettings, Scene};
use rayon::ThreadPool;
use rayon::prelude::*;

use crate::kernels::{self, Photon, PhotonMap, SurfaceCache};

pub struct SharedBuildState {
    pub hemisphere: Vec<Vec3>,
    pub photon_map: PhotonMap,
    pub surface_caches: Vec<SurfaceCache>,
    pub mesh_area_lights: Vec<EmissivePatch>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SetupTimings {
    pub samples: Duration,
    pub photons: Duration,
    pub radiosity: Duration,
    pub finalize: Duration,
}

impl SharedBuildState {
    pub fn build(
        scene: &Scene,
        settings: &BuildSettings,
        pool: &ThreadPool,
    ) -> (Self, SetupTimings) {
        let mut timings = SetupTimings::default();

        let start = Instant::now();
        let sample_count = (64.0 * settings.quality) as usize;
        let hemisphere = kernels::hemisphere_samples(sample_count, settings.seed);
        let mesh_area_lights = kernels::emissive_patches(&scene.mappings);
        timings.samples = start.elapsed();

        let start = Instant::now();
        let photon_map = Self::emit_photons(scene, settings, pool);
        timings.photons = start.elapsed();
        log::debug!(
            target: "licht::build",
            "photon phase: {} photons in {:?}",
            photon_map.len(),
            timings.photons
        );

        let dims: Vec<(usize, usize)> = scene
            .mappings
            .iter()
            .map(kernels::surface_cache_dims)
            .collect();

        let start = Instant::now();
        let radiosity_acc = if settings.radiosity && !scene.mappings.is_empty() {
            Some(Self::run_radiosity(scene, settings, pool, &photon_map, &dims))
        } else {
            None
        };
        timings.radiosity = start.elapsed();

        let start = Instant::now();
        let surface_caches: Vec<SurfaceCache> = pool.install(|| {
            (0..scene.mappings.len())
                .into_par_iter()
                .map(|i| {
                    let (cw, ch) = dims[i];
                    let values = match &radiosity_acc {
                        Some(acc) => acc[i].clone(),
                        None => kernels::radiosity_seed(&scene.lights, &scene.mappings[i], cw, ch),
                    };
                    SurfaceCache {
                        width: cw,
                        height: ch,
                        values,
                    }
                })
                .collect()
        });
        timings.finalize = start.elapsed();

        (
            Self {
                hemisphere,
                photon_map,
                surface_caches,
                mesh_area_lights,
            },
            timings,
        )
    }

    /// Photon phase: fixed-size ranges emitted in parallel and flattened in
    /// range order, so the map contents never depend on pool scheduling.
    fn emit_photons(scene: &Scene, settings: &BuildSettings, pool: &ThreadPool) -> PhotonMap {
        if !settings.photon_mapping {
            return PhotonMap::build(Vec::new(), settings.photon_search_radius);
        }
        let total = ((settings.direct_photons + settings.indirect_photons) as f32
            * settings.quality) as usize;
        let ranges = total.div_ceil(kernels::PHOTONS_PER_RANGE.max(1));
        let per_range: Vec<Vec<Photon>> = pool.install(|| {
            (0..ranges)
                .into_par_iter()
                .map(|range| {
                    let emitted = range * kernels::PHOTONS_PER_RANGE;
                    let count = kernels::PHOTONS_PER_RANGE.min(total - emitted);
                    kernels::emit_photon_range(scene, settings.seed, range, count)
                })
                .collect()
        });
        let photons: Vec<Photon> = per_range.into_iter().flatten().collect();
        PhotonMap::build(photons, settings.photon_search_radius)
    }

    /// Radiosity: one barriered pass per bounce, double-buffered so every
    /// mapping reads only the previous generation. Returns the summed
    /// generations per mapping.
    fn run_radiosity(
        scene: &Scene,
        settings: &BuildSettings,
        pool: &ThreadPool,
        photon_map: &PhotonMap,
        dims: &[(usize, usize)],
    ) -> Vec<Vec<f32>> {
        let n = scene.mappings.len();
        let photon_terms: Vec<Vec<f32>> = pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|i| {
                    kernels::photon_terms(photon_map, &scene.mappings[i], dims[i].0, dims[i].1)
                })
                .collect()
        });
        let mut prev: Vec<Vec<f32>> = pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|i| {
                    kernels::radiosity_seed(&scene.lights, &scene.mappings[i], dims[i].0, dims[i].1)
                })
                .collect()
        });
        let mut acc = prev.clone();
        for bounce in 0..settings.radiosity_bounces {
            let next: Vec<Vec<f32>> = pool.install(|| {
                (0..n)
                    .into_par_iter()
                    .map(|i| {
                        kernels::radiosity_bounce(&prev[i], dims[i].0, dims[i].1, &photon_terms[i])
                    })
                    .collect()
            });
            for (sum, generation) in acc.iter_mut().zip(&next) {
                for (s, g) in sum.iter_mut().zip(generation) {
                    *s += *g;
                }
            }
            prev = next;
            log::trace!(target: "licht::build", "radiosity bounce {bounce} done");
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap()
    }

    fn settings() -> BuildSettings {
        BuildSettings {
            direct_photons: 256,
            indirect_photons: 256,
            ..BuildSettings::default()
        }
    }

    #[test]
    fn build_is_deterministic() {
        let s = settings();
        let scene = Scene::synthetic(6, 21, &s);
        let pool = pool();
        let (a, _) = SharedBuildState::build(&scene, &s, &pool);
        let (b, _) = SharedBuildState::build(&scene, &s, &pool);
        assert_eq!(a.photon_map.len(), b.photon_map.len());
        assert_eq!(a.surface_caches.len(), b.surface_caches.len());
        for (ca, cb) in a.surface_caches.iter().zip(&b.surface_caches) {
            assert_eq!(ca.values, cb.values);
        }
    }

    #[test]
    fn photon_phase_respects_toggle() {
        let mut s = settings();
        s.photon_mapping = false;
        let scene = Scene::synthetic(2, 3, &s);
        let (state, _) = SharedBuildState::build(&scene, &s, &pool());
        assert!(state.photon_map.is_empty());
    }

    #[test]
    fn radiosity_off_leaves_seed_caches() {
        let mut s = settings();
        s.radiosity = false;
        s.photon_mapping = false;
        let scene = Scene::synthetic(3, 5, &s);
        let (state, _) = SharedBuildState::build(&scene, &s, &pool());
        for (i, cache) in state.surface_caches.iter().enumerate() {
            let m = &scene.mappings[i];
            let (cw, ch) = kernels::surface_cache_dims(m);
            assert_eq!((cache.width, cache.height), (cw, ch));
            let seed = kernels::radiosity_seed(&scene.lights, m, cw, ch);
            assert_eq!(cache.values, seed);
        }
    }

    #[test]
    fn radiosity_accumulates_above_seed() {
        let s = settings();
        let scene = Scene::synthetic(3, 5, &s);
        let (with, _) = SharedBuildState::build(&scene, &s, &pool());
        let mut off = s.clone();
        off.radiosity = false;
        let (without, _) = SharedBuildState::build(&scene, &off, &pool());
        let sum = |caches: &[SurfaceCache]| -> f32 {
            caches.iter().flat_map(|c| c.values.iter()).sum()
        };
        assert!(sum(&with.surface_caches) >= sum(&without.surface_caches));
    }
}
