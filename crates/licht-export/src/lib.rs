//! Result payloads produced by the build and the exporter seam they leave
//! through. Payload layout here is in-memory only; serialization to engine
//! formats happens on the other side of the [`Exporter`] trait.
#![forbid(unsafe_code)]

use std::sync::Mutex;

use licht_geom::Vec3;
use uuid::Uuid;

/// Sort key used to restore deterministic export order. Completion order
/// across workers is arbitrary; ascending id order is not.
pub trait Keyed {
    fn sort_key(&self) -> Uuid;
}

/// Baked lightmap for one texture mapping.
#[derive(Clone, Debug)]
pub struct MappingLightData {
    pub id: Uuid,
    pub width: u32,
    pub height: u32,
    pub texels: Vec<[f32; 3]>,
}

/// Lighting samples placed for dynamic objects inside the importance volume.
#[derive(Clone, Debug)]
pub struct VolumeSampleData {
    pub id: Uuid,
    pub samples: Vec<VolumeSample>,
}

#[derive(Clone, Copy, Debug)]
pub struct VolumeSample {
    pub position: Vec3,
    pub irradiance: [f32; 3],
}

/// One precomputed-visibility bucket's cell-to-cell bitmask.
#[derive(Clone, Debug)]
pub struct VisibilityData {
    pub id: Uuid,
    pub bucket: usize,
    pub cell_count: usize,
    pub bits: Vec<u8>,
}

/// One volumetric-lightmap cell, flattened brick values.
#[derive(Clone, Debug)]
pub struct VolumetricCellData {
    pub id: Uuid,
    pub cell: usize,
    pub brick_count: usize,
    pub values: Vec<[f32; 3]>,
}

/// Per-light static shadow depth grid.
#[derive(Clone, Debug)]
pub struct ShadowDepthMapData {
    pub light_id: Uuid,
    pub width: usize,
    pub height: usize,
    pub depths: Vec<f32>,
}

/// Emissive-surface lights derived from mapping patches.
#[derive(Clone, Debug)]
pub struct MeshAreaLightData {
    pub id: Uuid,
    pub patches: Vec<EmissivePatch>,
}

#[derive(Clone, Copy, Debug)]
pub struct EmissivePatch {
    pub position: Vec3,
    pub normal: Vec3,
    pub power: f32,
}

/// Signed distance field volume, one slab of values per layer.
#[derive(Clone, Debug)]
pub struct DistanceFieldData {
    pub id: Uuid,
    pub layer_count: usize,
    pub width: usize,
    pub height: usize,
    pub values: Vec<f32>,
}

impl Keyed for MappingLightData {
    fn sort_key(&self) -> Uuid {
        self.id
    }
}

impl Keyed for VisibilityData {
    fn sort_key(&self) -> Uuid {
        self.id
    }
}

impl Keyed for VolumetricCellData {
    fn sort_key(&self) -> Uuid {
        self.id
    }
}

impl Keyed for ShadowDepthMapData {
    fn sort_key(&self) -> Uuid {
        self.light_id
    }
}

/// Receiving side of a drain. Calls arrive from one thread at a time, in
/// ascending sort-key order within each batch.
pub trait Exporter: Send + Sync {
    /// Opens a batch of `count` results starting at id `first`. The return
    /// value reports whether the batch shares one output channel.
    fn begin_batch(&self, first: Uuid, count: usize) -> bool;
    fn export_mapping(&self, data: MappingLightData, shared_channel: bool);
    fn export_volume_samples(&self, data: VolumeSampleData, shared_channel: bool);
    fn export_visibility(&self, data: VisibilityData, shared_channel: bool);
    fn export_volumetric_cell(&self, data: VolumetricCellData, shared_channel: bool);
    fn export_shadow_depth_map(&self, data: ShadowDepthMapData, shared_channel: bool);
    fn export_mesh_area_lights(&self, data: MeshAreaLightData, shared_channel: bool);
    fn export_distance_field(&self, data: DistanceFieldData, shared_channel: bool);
    fn end_batch(&self);
}

/// Memory sink used by tests and the demo binary.
#[derive(Default)]
pub struct CollectingExporter {
    inner: Mutex<Collected>,
}

#[derive(Default)]
struct Collected {
    mappings: Vec<MappingLightData>,
    volume_samples: Vec<VolumeSampleData>,
    visibility: Vec<VisibilityData>,
    volumetric_cells: Vec<VolumetricCellData>,
    shadow_maps: Vec<ShadowDepthMapData>,
    mesh_area_lights: Vec<MeshAreaLightData>,
    distance_fields: Vec<DistanceFieldData>,
    open_batches: isize,
    batches: Vec<(Uuid, usize)>,
}

impl CollectingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping ids in the order they were exported.
    pub fn mapping_ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .mappings
            .iter()
            .map(|m| m.id)
            .collect()
    }

    pub fn mappings(&self) -> Vec<MappingLightData> {
        self.inner.lock().unwrap().mappings.clone()
    }

    pub fn visibility_ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .visibility
            .iter()
            .map(|v| v.id)
            .collect()
    }

    pub fn volumetric_cell_ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .volumetric_cells
            .iter()
            .map(|v| v.id)
            .collect()
    }

    pub fn shadow_map_light_ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .unwrap()
            .shadow_maps
            .iter()
            .map(|s| s.light_id)
            .collect()
    }

    pub fn volume_sample_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .volume_samples
            .iter()
            .map(|v| v.samples.len())
            .sum()
    }

    pub fn volume_sample_exports(&self) -> usize {
        self.inner.lock().unwrap().volume_samples.len()
    }

    pub fn volume_samples(&self) -> Vec<VolumeSampleData> {
        self.inner.lock().unwrap().volume_samples.clone()
    }

    pub fn mesh_area_light_exports(&self) -> usize {
        self.inner.lock().unwrap().mesh_area_lights.len()
    }

    pub fn distance_field_exports(&self) -> usize {
        self.inner.lock().unwrap().distance_fields.len()
    }

    pub fn distance_fields(&self) -> Vec<DistanceFieldData> {
        self.inner.lock().unwrap().distance_fields.clone()
    }

    /// Batch begin/end pairing; zero when every batch was closed.
    pub fn open_batches(&self) -> isize {
        self.inner.lock().unwrap().open_batches
    }

    pub fn batch_log(&self) -> Vec<(Uuid, usize)> {
        self.inner.lock().unwrap().batches.clone()
    }

    pub fn total_exports(&self) -> usize {
        let c = self.inner.lock().unwrap();
        c.mappings.len()
            + c.volume_samples.len()
            + c.visibility.len()
            + c.volumetric_cells.len()
            + c.shadow_maps.len()
            + c.mesh_area_lights.len()
            + c.distance_fields.len()
    }
}

impl Exporter for CollectingExporter {
    fn begin_batch(&self, first: Uuid, count: usize) -> bool {
        let mut c = self.inner.lock().unwrap();
        c.open_batches += 1;
        c.batches.push((first, count));
        count > 1
    }

    fn export_mapping(&self, data: MappingLightData, _shared_channel: bool) {
        self.inner.lock().unwrap().mappings.push(data);
    }

    fn export_volume_samples(&self, data: VolumeSampleData, _shared_channel: bool) {
        self.inner.lock().unwrap().volume_samples.push(data);
    }

    fn export_visibility(&self, data: VisibilityData, _shared_channel: bool) {
        self.inner.lock().unwrap().visibility.push(data);
    }

    fn export_volumetric_cell(&self, data: VolumetricCellData, _shared_channel: bool) {
        self.inner.lock().unwrap().volumetric_cells.push(data);
    }

    fn export_shadow_depth_map(&self, data: ShadowDepthMapData, _shared_channel: bool) {
        self.inner.lock().unwrap().shadow_maps.push(data);
    }

    fn export_mesh_area_lights(&self, data: MeshAreaLightData, _shared_channel: bool) {
        self.inner.lock().unwrap().mesh_area_lights.push(data);
    }

    fn export_distance_field(&self, data: DistanceFieldData, _shared_channel: bool) {
        self.inner.lock().unwrap().distance_fields.push(data);
    }

    fn end_batch(&self) {
        self.inner.lock().unwrap().open_batches -= 1;
    }
}
