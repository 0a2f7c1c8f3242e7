//! Deterministic lighting kernels. Every function here is a pure function of
//! its inputs (plus an explicitly seeded RNG), so build output is identical
//! regardless of worker count or task completion order.

use std::f32::consts::{PI, TAU};

use hashbrown::HashMap;
use licht_export::{EmissivePatch, ShadowDepthMapData, VisibilityData};
use licht_geom::{Aabb, Vec3};
use licht_scene::{Light, LightKind, Mapping, Scene};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

/// Photons emitted by one parallel range during the photon phase.
pub const PHOTONS_PER_RANGE: usize = 512;
/// Texel-to-cache-cell reduction for the per-mapping surface cache.
pub const SURFACE_CACHE_DOWNSAMPLE: u32 = 4;
/// Texel spacing between irradiance-cache records inside one cache sub-task.
pub const CACHE_ENTRY_STRIDE: usize = 4;
/// XZ resolution of one volume distance field layer.
pub const DISTANCE_FIELD_DIM: usize = 16;
/// Cells covered by one precomputed-visibility bucket (4x4 slab grid).
pub const VISIBILITY_CELLS_PER_BUCKET: usize = 16;
/// Volumetric lightmap bricks are BRICK_DIM^3 value grids.
pub const BRICK_DIM: usize = 4;
/// Offset along the normal used when probing the photon map off a surface.
pub const PROBE_STEP: f32 = 0.5;

/// Cosine-weighted directions around +Y, shared read-only by all workers.
pub fn hemisphere_samples(count: usize, seed: u64) -> Vec<Vec3> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count.max(1))
        .map(|_| {
            let u1: f32 = rng.random();
            let u2: f32 = rng.random();
            let r = u1.sqrt();
            let theta = TAU * u2;
            Vec3::new(r * theta.cos(), (1.0 - u1).sqrt(), r * theta.sin())
        })
        .collect()
}

/// Rotate a +Y hemisphere direction into the frame of `normal`.
pub fn orient_to_normal(dir: Vec3, normal: Vec3) -> Vec3 {
    let n = normal.normalized();
    let helper = if n.y.abs() < 0.99 {
        Vec3::UP
    } else {
        Vec3::new(1.0, 0.0, 0.0)
    };
    let tangent = helper.cross(n).normalized();
    let bitangent = n.cross(tangent);
    tangent * dir.x + n * dir.y + bitangent * dir.z
}

/// Scalar irradiance one light deposits at a surface point.
pub fn light_contribution(light: &Light, point: Vec3, normal: Vec3) -> f32 {
    match light.kind {
        LightKind::Directional => {
            let cos = normal.dot(light.direction * -1.0).max(0.0);
            light.intensity * cos
        }
        LightKind::Point => {
            let to_light = light.position - point;
            let dist_sq = to_light.length_squared();
            if light.radius > 0.0 && dist_sq > light.radius * light.radius {
                return 0.0;
            }
            let cos = normal.dot(to_light.normalized()).max(0.0);
            light.intensity * cos / (1.0 + dist_sq)
        }
        LightKind::Spot { cos_cone } => {
            let to_point = (point - light.position).normalized();
            if to_point.dot(light.direction) < cos_cone {
                return 0.0;
            }
            let to_light = light.position - point;
            let dist_sq = to_light.length_squared();
            if light.radius > 0.0 && dist_sq > light.radius * light.radius {
                return 0.0;
            }
            let cos = normal.dot(to_light.normalized()).max(0.0);
            light.intensity * cos / (1.0 + dist_sq)
        }
    }
}

pub fn direct_irradiance(lights: &[Light], point: Vec3, normal: Vec3) -> f32 {
    lights
        .iter()
        .map(|l| light_contribution(l, point, normal))
        .sum()
}

#[derive(Clone, Copy, Debug)]
pub struct Photon {
    pub position: Vec3,
    pub power: f32,
}

/// One photon-emission range. Each range seeds its own stream so the flattened
/// photon list does not depend on which pool thread ran which range.
pub fn emit_photon_range(scene: &Scene, seed: u64, range: usize, count: usize) -> Vec<Photon> {
    if scene.lights.is_empty() {
        return Vec::new();
    }
    let mut rng =
        ChaCha8Rng::seed_from_u64(seed ^ (range as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let volume = scene.importance_volume;
    (0..count)
        .map(|_| {
            let light = &scene.lights[rng.random_range(0..scene.lights.len())];
            let position = volume.at_fraction(rng.random(), rng.random(), rng.random());
            Photon {
                position,
                power: light.intensity,
            }
        })
        .collect()
}

/// Uniform-grid photon index. Queries walk the overlapping cells in a fixed
/// axis order and the per-cell lists keep emission order, so the float sums
/// are reproducible run to run.
pub struct PhotonMap {
    photons: Vec<Photon>,
    cells: HashMap<(i32, i32, i32), Vec<u32>>,
    radius: f32,
    power_scale: f32,
}

impl PhotonMap {
    pub fn build(photons: Vec<Photon>, search_radius: f32) -> Self {
        let radius = search_radius.max(0.1);
        let power_scale = if photons.is_empty() {
            0.0
        } else {
            1.0 / photons.len() as f32
        };
        let mut cells: HashMap<(i32, i32, i32), Vec<u32>> = HashMap::new();
        for (i, p) in photons.iter().enumerate() {
            cells
                .entry(Self::key(p.position, radius))
                .or_default()
                .push(i as u32);
        }
        Self {
            photons,
            cells,
            radius,
            power_scale,
        }
    }

    fn key(p: Vec3, cell: f32) -> (i32, i32, i32) {
        (
            (p.x / cell).floor() as i32,
            (p.y / cell).floor() as i32,
            (p.z / cell).floor() as i32,
        )
    }

    /// Power density within the search radius of `p`.
    pub fn density(&self, p: Vec3) -> f32 {
        if self.photons.is_empty() {
            return 0.0;
        }
        let r2 = self.radius * self.radius;
        let lo = Self::key(p - Vec3::splat(self.radius), self.radius);
        let hi = Self::key(p + Vec3::splat(self.radius), self.radius);
        let mut sum = 0.0;
        for kx in lo.0..=hi.0 {
            for ky in lo.1..=hi.1 {
                for kz in lo.2..=hi.2 {
                    let Some(list) = self.cells.get(&(kx, ky, kz)) else {
                        continue;
                    };
                    for &i in list {
                        let ph = &self.photons[i as usize];
                        if (ph.position - p).length_squared() <= r2 {
                            sum += ph.power;
                        }
                    }
                }
            }
        }
        sum * self.power_scale / (PI * r2)
    }

    pub fn len(&self) -> usize {
        self.photons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photons.is_empty()
    }
}

/// Coarse per-mapping irradiance grid produced by the radiosity phase.
#[derive(Clone, Debug)]
pub struct SurfaceCache {
    pub width: usize,
    pub height: usize,
    pub values: Vec<f32>,
}

impl SurfaceCache {
    /// Nearest cache cell for a texel of the owning mapping.
    pub fn value_at_texel(&self, m: &Mapping, x: u32, y: u32) -> f32 {
        let cx = (x as usize * self.width / m.width as usize).min(self.width - 1);
        let cy = (y as usize * self.height / m.height as usize).min(self.height - 1);
        self.values[cy * self.width + cx]
    }
}

pub fn surface_cache_dims(m: &Mapping) -> (usize, usize) {
    let cw = m.width.div_ceil(SURFACE_CACHE_DOWNSAMPLE).max(2) as usize;
    let ch = m.height.div_ceil(SURFACE_CACHE_DOWNSAMPLE).max(2) as usize;
    (cw, ch)
}

pub fn cache_cell_center(m: &Mapping, cw: usize, ch: usize, cx: usize, cy: usize) -> Vec3 {
    let fx = (cx as f32 + 0.5) / cw as f32;
    let fy = (cy as f32 + 0.5) / ch as f32;
    m.origin + m.basis_u * fx + m.basis_v * fy
}

/// Zeroth radiosity generation: direct light reflected off the patch.
pub fn radiosity_seed(lights: &[Light], m: &Mapping, cw: usize, ch: usize) -> Vec<f32> {
    let normal = m.normal();
    let mut out = Vec::with_capacity(cw * ch);
    for cy in 0..ch {
        for cx in 0..cw {
            let p = cache_cell_center(m, cw, ch, cx, cy);
            out.push(direct_irradiance(lights, p, normal) * m.albedo);
        }
    }
    out
}

/// Scattered-light term gathered from the photon map at each cache cell.
pub fn photon_terms(map: &PhotonMap, m: &Mapping, cw: usize, ch: usize) -> Vec<f32> {
    let normal = m.normal();
    let mut out = Vec::with_capacity(cw * ch);
    for cy in 0..ch {
        for cx in 0..cw {
            let p = cache_cell_center(m, cw, ch, cx, cy);
            out.push(map.density(p + normal * PROBE_STEP) * m.albedo);
        }
    }
    out
}

/// One bounce: relax against the 4-neighborhood of the previous generation.
pub fn radiosity_bounce(prev: &[f32], cw: usize, ch: usize, photon_term: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(prev.len());
    for cy in 0..ch {
        for cx in 0..cw {
            let c = cy * cw + cx;
            let mut acc = 0.0;
            let mut n = 0.0;
            if cx > 0 {
                acc += prev[c - 1];
                n += 1.0;
            }
            if cx + 1 < cw {
                acc += prev[c + 1];
                n += 1.0;
            }
            if cy > 0 {
                acc += prev[c - cw];
                n += 1.0;
            }
            if cy + 1 < ch {
                acc += prev[c + cw];
                n += 1.0;
            }
            let spread = if n > 0.0 { acc / n } else { 0.0 };
            out.push(prev[c] * 0.5 + spread * 0.3 + photon_term[c] * 0.2);
        }
    }
    out
}

/// Sparse irradiance record produced by the cache stage of one mapping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CacheEntry {
    pub texel: usize,
    pub value: f32,
}

/// Cache stage for one texel range: indirect irradiance at every
/// `CACHE_ENTRY_STRIDE`-th texel.
pub fn cache_entries(
    map: &PhotonMap,
    cache: &SurfaceCache,
    hemisphere: &[Vec3],
    m: &Mapping,
    start: usize,
    len: usize,
) -> Vec<CacheEntry> {
    let normal = m.normal();
    let w = m.width as usize;
    let end = (start + len).min(m.texel_count());
    let mut out = Vec::with_capacity(len / CACHE_ENTRY_STRIDE + 1);
    let mut t = start;
    while t < end {
        let x = (t % w) as u32;
        let y = (t / w) as u32;
        let p = m.texel_position(x, y);
        let bounce = cache.value_at_texel(m, x, y) * m.albedo;
        let scatter = hemisphere_gather(map, hemisphere, p, normal) * m.albedo;
        out.push(CacheEntry {
            texel: t,
            value: bounce + scatter,
        });
        t += CACHE_ENTRY_STRIDE;
    }
    out
}

/// Cosine-weighted photon gather over a hemisphere oriented to `normal`.
pub fn hemisphere_gather(map: &PhotonMap, hemisphere: &[Vec3], p: Vec3, normal: Vec3) -> f32 {
    if hemisphere.is_empty() {
        return map.density(p + normal * PROBE_STEP);
    }
    let mut sum = 0.0;
    for dir in hemisphere {
        let oriented = orient_to_normal(*dir, normal);
        sum += map.density(p + oriented * PROBE_STEP) * dir.y.max(0.0);
    }
    sum / hemisphere.len() as f32
}

/// Interpolation stage: fill a texel range from the assembled cache records
/// by inverse-distance blending of the two nearest entries.
pub fn interpolate_range(entries: &[CacheEntry], start: usize, len: usize) -> Vec<f32> {
    (start..start + len)
        .map(|t| interpolate_at(entries, t))
        .collect()
}

fn interpolate_at(entries: &[CacheEntry], t: usize) -> f32 {
    if entries.is_empty() {
        return 0.0;
    }
    let after = entries.partition_point(|e| e.texel < t);
    if after < entries.len() && entries[after].texel == t {
        return entries[after].value;
    }
    let below = after.checked_sub(1).map(|i| &entries[i]);
    let above = entries.get(after);
    match (below, above) {
        (Some(a), Some(b)) => {
            let wa = 1.0 / (t - a.texel) as f32;
            let wb = 1.0 / (b.texel - t) as f32;
            (a.value * wa + b.value * wb) / (wa + wb)
        }
        (Some(a), None) => a.value,
        (None, Some(b)) => b.value,
        (None, None) => 0.0,
    }
}

/// Static shadow depth grid over the scene floor for one light.
pub fn shadow_depth_map(bounds: Aabb, light: &Light, size: usize) -> ShadowDepthMapData {
    let size = size.max(2);
    let origin = match light.kind {
        // Virtual source pushed back along the light direction.
        LightKind::Directional => bounds.center() - light.direction * bounds.extent().length(),
        _ => light.position,
    };
    let mut depths = Vec::with_capacity(size * size);
    for gy in 0..size {
        for gx in 0..size {
            let fx = gx as f32 / (size - 1) as f32;
            let fz = gy as f32 / (size - 1) as f32;
            depths.push(origin.distance(bounds.at_fraction(fx, 0.0, fz)));
        }
    }
    ShadowDepthMapData {
        light_id: light.id,
        width: size,
        height: size,
        depths,
    }
}

/// Cell-to-cell visibility bitmask for one bucket's slab of the volume.
pub fn visibility_bucket_data(
    volume: Aabb,
    id: Uuid,
    bucket: usize,
    bucket_count: usize,
) -> VisibilityData {
    let cells = VISIBILITY_CELLS_PER_BUCKET;
    let buckets = bucket_count.max(1) as f32;
    let mut centers = Vec::with_capacity(cells);
    for i in 0..cells {
        let fx = (bucket as f32 + ((i % 4) as f32 + 0.5) / 4.0) / buckets;
        let fz = ((i / 4) as f32 + 0.5) / 4.0;
        centers.push(volume.at_fraction(fx, 0.5, fz));
    }
    let reach = volume.extent().length() * 0.5;
    let mut bits = vec![0u8; (cells * cells).div_ceil(8)];
    for i in 0..cells {
        for j in 0..cells {
            if centers[i].distance(centers[j]) <= reach {
                let pair = i * cells + j;
                bits[pair / 8] |= 1 << (pair % 8);
            }
        }
    }
    VisibilityData {
        id,
        bucket,
        cell_count: cells,
        bits,
    }
}

/// Slab of the importance volume covered by one volumetric-lightmap cell,
/// sliced along the longest axis. Also used to split a cell into bricks.
pub fn volumetric_cell_bounds(volume: Aabb, cell: usize, cell_count: usize) -> Aabb {
    let count = cell_count.max(1) as f32;
    let lo = cell as f32 / count;
    let hi = (cell as f32 + 1.0) / count;
    let e = volume.extent();
    if e.x >= e.y && e.x >= e.z {
        Aabb::new(
            volume.at_fraction(lo, 0.0, 0.0),
            volume.at_fraction(hi, 1.0, 1.0),
        )
    } else if e.y >= e.z {
        Aabb::new(
            volume.at_fraction(0.0, lo, 0.0),
            volume.at_fraction(1.0, hi, 1.0),
        )
    } else {
        Aabb::new(
            volume.at_fraction(0.0, 0.0, lo),
            volume.at_fraction(1.0, 1.0, hi),
        )
    }
}

/// One brick of a volumetric-lightmap cell: BRICK_DIM^3 irradiance probes.
pub fn brick_values(
    map: &PhotonMap,
    lights: &[Light],
    cell: Aabb,
    brick: usize,
    brick_count: usize,
) -> Vec<[f32; 3]> {
    let slab = volumetric_cell_bounds(cell, brick, brick_count);
    let n = BRICK_DIM;
    let mut out = Vec::with_capacity(n * n * n);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let p = slab.at_fraction(
                    (x as f32 + 0.5) / n as f32,
                    (y as f32 + 0.5) / n as f32,
                    (z as f32 + 0.5) / n as f32,
                );
                let v = direct_irradiance(lights, p, Vec3::UP) + map.density(p);
                out.push([v, v, v]);
            }
        }
    }
    out
}

/// Sample placement for one volume-sample task.
pub fn volume_sample_positions(volume: Aabb, count: usize, rng: &mut ChaCha8Rng) -> Vec<Vec3> {
    (0..count)
        .map(|_| volume.at_fraction(rng.random(), rng.random(), rng.random()))
        .collect()
}

/// Irradiance at a free-space point: direct light plus a hemisphere gather
/// over the photon map.
pub fn sample_irradiance(
    map: &PhotonMap,
    lights: &[Light],
    hemisphere: &[Vec3],
    p: Vec3,
) -> [f32; 3] {
    let mut v = direct_irradiance(lights, p, Vec3::UP);
    if !hemisphere.is_empty() {
        let mut gathered = 0.0;
        for dir in hemisphere {
            gathered += map.density(p + *dir * PROBE_STEP) * dir.y.max(0.0);
        }
        v += gathered / hemisphere.len() as f32;
    }
    [v, v, v]
}

/// Unsigned distance from a point to a mapping's patch rectangle.
pub fn point_patch_distance(m: &Mapping, p: Vec3) -> f32 {
    let rel = p - m.origin;
    let uu = m.basis_u.length_squared().max(1e-8);
    let vv = m.basis_v.length_squared().max(1e-8);
    let s = (rel.dot(m.basis_u) / uu).clamp(0.0, 1.0);
    let t = (rel.dot(m.basis_v) / vv).clamp(0.0, 1.0);
    let closest = m.origin + m.basis_u * s + m.basis_v * t;
    p.distance(closest)
}

/// One horizontal layer of the volume distance field: min distance from each
/// grid point to any mapping patch.
pub fn distance_field_layer(
    volume: Aabb,
    mappings: &[Mapping],
    layer: usize,
    layer_count: usize,
) -> Vec<f32> {
    let dim = DISTANCE_FIELD_DIM;
    let fy = (layer as f32 + 0.5) / layer_count.max(1) as f32;
    let far = volume.extent().length();
    let mut out = Vec::with_capacity(dim * dim);
    for gz in 0..dim {
        for gx in 0..dim {
            let p = volume.at_fraction(
                (gx as f32 + 0.5) / dim as f32,
                fy,
                (gz as f32 + 0.5) / dim as f32,
            );
            let mut d = far;
            for m in mappings {
                d = d.min(point_patch_distance(m, p));
            }
            out.push(d);
        }
    }
    out
}

/// Emissive mapping patches promoted to area lights during setup.
pub fn emissive_patches(mappings: &[Mapping]) -> Vec<EmissivePatch> {
    mappings
        .iter()
        .filter(|m| m.emissive > 0.0)
        .map(|m| EmissivePatch {
            position: m.origin + (m.basis_u + m.basis_v) * 0.5,
            normal: m.normal(),
            power: m.emissive * m.basis_u.cross(m.basis_v).length(),
        })
        .collect()
}
