//! Scene model for the static-lighting build: lights, texture mappings,
//! task-identifier tables, and the settings that size the parallel phases.
#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::{HashMap, HashSet};
use licht_geom::{Aabb, Vec3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use uuid::Uuid;

pub mod ids;
mod settings;

pub use settings::{BuildSettings, DebugSettings};

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid scene: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LightKind {
    Point,
    Spot { cos_cone: f32 },
    Directional,
}

#[derive(Clone, Debug)]
pub struct Light {
    pub id: Uuid,
    pub kind: LightKind,
    pub position: Vec3,
    pub direction: Vec3,
    pub intensity: f32,
    pub radius: f32,
    pub casts_static_shadow: bool,
}

/// One lightmap-texture work unit. The claim flag gives exactly one worker
/// ownership; everyone else must reject the task id back to the farm.
#[derive(Debug)]
pub struct Mapping {
    pub id: Uuid,
    pub width: u32,
    pub height: u32,
    pub origin: Vec3,
    pub basis_u: Vec3,
    pub basis_v: Vec3,
    pub albedo: f32,
    pub emissive: f32,
    claimed: AtomicBool,
}

impl Mapping {
    /// Wins only for the first caller; all later calls observe the claim.
    #[inline]
    pub fn try_claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// World position of the texel center.
    #[inline]
    pub fn texel_position(&self, x: u32, y: u32) -> Vec3 {
        let fx = (x as f32 + 0.5) / self.width as f32;
        let fy = (y as f32 + 0.5) / self.height as f32;
        self.origin + self.basis_u * fx + self.basis_v * fy
    }

    #[inline]
    pub fn normal(&self) -> Vec3 {
        self.basis_u.cross(self.basis_v).normalized()
    }

    fn corners(&self) -> [Vec3; 4] {
        [
            self.origin,
            self.origin + self.basis_u,
            self.origin + self.basis_v,
            self.origin + self.basis_u + self.basis_v,
        ]
    }
}

/// Kind of work an accepted task id maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Mapping(usize),
    VolumeSamples,
    PrecomputedVisibility(usize),
    VolumetricLightmapCell(usize),
    ShadowDepthMap(Uuid),
    MeshAreaLightData,
    VolumeDistanceField,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Mapping(_) => "mapping",
            TaskKind::VolumeSamples => "volume samples",
            TaskKind::PrecomputedVisibility(_) => "visibility bucket",
            TaskKind::VolumetricLightmapCell(_) => "volumetric cell",
            TaskKind::ShadowDepthMap(_) => "shadow depth map",
            TaskKind::MeshAreaLightData => "mesh area light data",
            TaskKind::VolumeDistanceField => "volume distance field",
        }
    }
}

pub struct Scene {
    pub name: String,
    pub bounds: Aabb,
    pub importance_volume: Aabb,
    pub lights: Vec<Light>,
    pub mappings: Vec<Mapping>,
    mapping_lookup: HashMap<Uuid, usize>,
    pub visibility_bucket_ids: Vec<Uuid>,
    volumetric_cell_lookup: HashMap<Uuid, usize>,
    pub volumetric_cell_count: usize,
    pub volume_sample_task_count: usize,
    pub distance_field_layer_count: usize,
    pub mesh_area_light_task: bool,
}

impl Scene {
    /// Load a scene description from TOML and size its task tables from the
    /// settings.
    pub fn load(path: &Path, settings: &BuildSettings) -> Result<Scene, SceneError> {
        let text = std::fs::read_to_string(path).map_err(|source| SceneError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SceneFile = toml::from_str(&text).map_err(|source| SceneError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Scene::assemble(file, settings)
    }

    /// Parse a scene description from TOML text already in memory.
    pub fn from_toml_str(text: &str, settings: &BuildSettings) -> Result<Scene, SceneError> {
        let file: SceneFile = toml::from_str(text).map_err(|source| SceneError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Scene::assemble(file, settings)
    }

    /// Deterministic generated scene: a grid of patches lit by one
    /// directional light plus a handful of point lights.
    pub fn synthetic(mapping_count: usize, seed: u64, settings: &BuildSettings) -> Scene {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let side = (mapping_count as f32).sqrt().ceil() as usize;

        let mut mappings = Vec::with_capacity(mapping_count);
        for i in 0..mapping_count {
            let gx = (i % side.max(1)) as f32;
            let gz = (i / side.max(1)) as f32;
            mappings.push(MappingDef {
                id: Some(Uuid::from_u128(rng.random::<u128>())),
                width: rng.random_range(4..=16),
                height: rng.random_range(4..=16),
                origin: [gx * 8.0, 0.0, gz * 8.0],
                u: [8.0, 0.0, 0.0],
                v: [0.0, 0.0, 8.0],
                albedo: rng.random_range(0.2..0.8),
                emissive: if rng.random_bool(0.1) { 1.0 } else { 0.0 },
            });
        }

        let mut lights = vec![LightDef {
            id: Some(Uuid::from_u128(rng.random::<u128>())),
            kind: "directional".into(),
            position: [0.0, 64.0, 0.0],
            direction: [-0.3, -1.0, -0.2],
            intensity: 1.0,
            radius: 0.0,
            cone_degrees: 45.0,
            static_shadow: true,
        }];
        let point_lights = (mapping_count / 8).max(1);
        for _ in 0..point_lights {
            lights.push(LightDef {
                id: Some(Uuid::from_u128(rng.random::<u128>())),
                kind: "point".into(),
                position: [
                    rng.random_range(0.0..side as f32 * 8.0),
                    rng.random_range(4.0..12.0),
                    rng.random_range(0.0..side as f32 * 8.0),
                ],
                direction: [0.0, -1.0, 0.0],
                intensity: rng.random_range(1.0..4.0),
                radius: rng.random_range(8.0..24.0),
                cone_degrees: 45.0,
                static_shadow: rng.random_bool(0.75),
            });
        }

        let file = SceneFile {
            name: Some(format!("synthetic-{mapping_count}")),
            importance_min: None,
            importance_max: None,
            lights,
            mappings,
        };
        match Scene::assemble(file, settings) {
            Ok(scene) => scene,
            // The generator only emits valid definitions.
            Err(err) => unreachable!("synthetic scene must assemble: {err}"),
        }
    }

    fn assemble(file: SceneFile, settings: &BuildSettings) -> Result<Scene, SceneError> {
        let mut lights = Vec::with_capacity(file.lights.len());
        let mut light_ids = HashSet::with_capacity(file.lights.len());
        for def in file.lights {
            let kind = match def.kind.as_str() {
                "point" => LightKind::Point,
                "directional" => LightKind::Directional,
                "spot" => LightKind::Spot {
                    cos_cone: def.cone_degrees.to_radians().cos(),
                },
                other => {
                    return Err(SceneError::Invalid(format!("unknown light kind {other:?}")));
                }
            };
            let id = def.id.unwrap_or_else(Uuid::new_v4);
            // Each shadow-casting light seeds one task id; a duplicate would
            // be handed out twice.
            if !light_ids.insert(id) {
                return Err(SceneError::Invalid(format!("duplicate light id {id}")));
            }
            lights.push(Light {
                id,
                kind,
                position: def.position.into(),
                direction: Vec3::from(def.direction).normalized(),
                intensity: def.intensity,
                radius: def.radius,
                casts_static_shadow: def.static_shadow,
            });
        }

        let mut mappings = Vec::with_capacity(file.mappings.len());
        let mut mapping_lookup = HashMap::with_capacity(file.mappings.len());
        for def in file.mappings {
            if def.width == 0 || def.height == 0 {
                return Err(SceneError::Invalid(format!(
                    "mapping {:?} has a zero-sized texel grid",
                    def.id
                )));
            }
            let mapping = Mapping {
                id: def.id.unwrap_or_else(Uuid::new_v4),
                width: def.width,
                height: def.height,
                origin: def.origin.into(),
                basis_u: def.u.into(),
                basis_v: def.v.into(),
                albedo: def.albedo,
                emissive: def.emissive,
                claimed: AtomicBool::new(false),
            };
            if light_ids.contains(&mapping.id) {
                return Err(SceneError::Invalid(format!(
                    "mapping id {} already names a light",
                    mapping.id
                )));
            }
            if mapping_lookup
                .insert(mapping.id, mappings.len())
                .is_some()
            {
                return Err(SceneError::Invalid(format!(
                    "duplicate mapping id {}",
                    mapping.id
                )));
            }
            mappings.push(mapping);
        }

        let mut bounds = Aabb::empty();
        for m in &mappings {
            for c in m.corners() {
                bounds = bounds.union_point(c);
            }
        }
        for l in &lights {
            if l.kind != LightKind::Directional {
                bounds = bounds.union_point(l.position);
            }
        }
        if mappings.is_empty() && lights.is_empty() {
            bounds = Aabb::new(Vec3::ZERO, Vec3::ZERO);
        }
        let importance_volume = match (file.importance_min, file.importance_max) {
            (Some(min), Some(max)) => Aabb::new(min.into(), max.into()),
            _ => bounds.expanded(4.0),
        };

        let visibility_bucket_ids = (0..settings.visibility_buckets)
            .map(ids::visibility_bucket)
            .collect();
        let volumetric_cell_lookup = (0..settings.volumetric_cells)
            .map(|i| (ids::volumetric_cell(i), i))
            .collect();

        Ok(Scene {
            name: file.name.unwrap_or_else(|| "scene".to_string()),
            bounds,
            importance_volume,
            lights,
            mappings,
            mapping_lookup,
            visibility_bucket_ids,
            volumetric_cell_lookup,
            volumetric_cell_count: settings.volumetric_cells,
            volume_sample_task_count: settings.volume_sample_tasks,
            distance_field_layer_count: settings.distance_field_layers,
            mesh_area_light_task: settings.mesh_area_lights,
        })
    }

    #[inline]
    pub fn mapping_index(&self, id: Uuid) -> Option<usize> {
        self.mapping_lookup.get(&id).copied()
    }

    /// Classify an accepted task id into its work kind. Sentinels first, then
    /// per-light shadow maps, visibility buckets, volumetric cells, and
    /// finally the mapping table.
    pub fn classify(&self, id: Uuid) -> Option<TaskKind> {
        if id == ids::VOLUME_SAMPLES {
            return Some(TaskKind::VolumeSamples);
        }
        if id == ids::MESH_AREA_LIGHT_DATA {
            return Some(TaskKind::MeshAreaLightData);
        }
        if id == ids::VOLUME_DISTANCE_FIELD {
            return Some(TaskKind::VolumeDistanceField);
        }
        if self
            .lights
            .iter()
            .any(|l| l.id == id && l.casts_static_shadow)
        {
            return Some(TaskKind::ShadowDepthMap(id));
        }
        if let Some(bucket) = self.visibility_bucket_ids.iter().position(|b| *b == id) {
            return Some(TaskKind::PrecomputedVisibility(bucket));
        }
        if let Some(&cell) = self.volumetric_cell_lookup.get(&id) {
            return Some(TaskKind::VolumetricLightmapCell(cell));
        }
        self.mapping_index(id).map(TaskKind::Mapping)
    }

    /// Every task id this scene expects the distribution tier to hand out.
    pub fn task_ids(&self) -> Vec<Uuid> {
        let mut out = Vec::new();
        if self.volume_sample_task_count > 0 {
            out.push(ids::VOLUME_SAMPLES);
        }
        if self.mesh_area_light_task {
            out.push(ids::MESH_AREA_LIGHT_DATA);
        }
        if self.distance_field_layer_count > 0 {
            out.push(ids::VOLUME_DISTANCE_FIELD);
        }
        out.extend(
            self.lights
                .iter()
                .filter(|l| l.casts_static_shadow)
                .map(|l| l.id),
        );
        out.extend(self.visibility_bucket_ids.iter().copied());
        out.extend((0..self.volumetric_cell_count).map(ids::volumetric_cell));
        out.extend(self.mappings.iter().map(|m| m.id));
        out
    }

    pub fn total_texels(&self) -> usize {
        self.mappings.iter().map(|m| m.texel_count()).sum()
    }
}

#[derive(Deserialize)]
struct SceneFile {
    name: Option<String>,
    importance_min: Option<[f32; 3]>,
    importance_max: Option<[f32; 3]>,
    #[serde(default)]
    lights: Vec<LightDef>,
    #[serde(default)]
    mappings: Vec<MappingDef>,
}

#[derive(Deserialize)]
#[serde(default)]
struct LightDef {
    id: Option<Uuid>,
    kind: String,
    position: [f32; 3],
    direction: [f32; 3],
    intensity: f32,
    radius: f32,
    cone_degrees: f32,
    static_shadow: bool,
}

impl Default for LightDef {
    fn default() -> Self {
        Self {
            id: None,
            kind: "point".to_string(),
            position: [0.0; 3],
            direction: [0.0, -1.0, 0.0],
            intensity: 1.0,
            radius: 16.0,
            cone_degrees: 45.0,
            static_shadow: true,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct MappingDef {
    id: Option<Uuid>,
    width: u32,
    height: u32,
    origin: [f32; 3],
    u: [f32; 3],
    v: [f32; 3],
    albedo: f32,
    emissive: f32,
}

impl Default for MappingDef {
    fn default() -> Self {
        Self {
            id: None,
            width: 8,
            height: 8,
            origin: [0.0; 3],
            u: [8.0, 0.0, 0.0],
            v: [0.0, 0.0, 8.0],
            albedo: 0.5,
            emissive: 0.0,
        }
    }
}
