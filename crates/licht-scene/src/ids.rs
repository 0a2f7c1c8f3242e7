//! Well-known task identifiers shared by both ends of the distribution protocol.
//!
//! Sentinel ids mark the single-instance non-mapping tasks; per-bucket and
//! per-cell ids are derived from a base constant plus the index so the agent
//! and the scheduler agree on them without exchanging tables.

use uuid::Uuid;

/// Volume lighting samples for dynamic objects.
pub const VOLUME_SAMPLES: Uuid = Uuid::from_u128(0x2c9a3f5e_8d41_4b76_a1c0_57e29b68d3f4);

/// Emissive mesh area light data.
pub const MESH_AREA_LIGHT_DATA: Uuid = Uuid::from_u128(0x61e84d02_77b9_4aa3_9f15_0cd6b21a748e);

/// Signed distance field volume.
pub const VOLUME_DISTANCE_FIELD: Uuid = Uuid::from_u128(0x9b37c150_2e6f_48d8_b4a2_e80f5d93611c);

const VISIBILITY_BUCKET_BASE: u128 = 0x45f01a88_c32d_4e09_9d67_3b8204c5e000;
const VOLUMETRIC_CELL_BASE: u128 = 0xd7225e4b_06ac_4f31_82d9_a41c69f80000;

/// Identifier of precomputed-visibility bucket `index`.
#[inline]
pub fn visibility_bucket(index: usize) -> Uuid {
    Uuid::from_u128(VISIBILITY_BUCKET_BASE + index as u128)
}

/// Identifier of volumetric-lightmap cell `index`.
#[inline]
pub fn volumetric_cell(index: usize) -> Uuid {
    Uuid::from_u128(VOLUMETRIC_CELL_BASE + index as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        seen.insert(VOLUME_SAMPLES);
        seen.insert(MESH_AREA_LIGHT_DATA);
        seen.insert(VOLUME_DISTANCE_FIELD);
        for i in 0..4096 {
            assert!(seen.insert(visibility_bucket(i)), "bucket {i}");
            assert!(seen.insert(volumetric_cell(i)), "cell {i}");
        }
    }

    #[test]
    fn derivation_is_stable() {
        assert_eq!(visibility_bucket(7), visibility_bucket(7));
        assert_ne!(visibility_bucket(7), volumetric_cell(7));
    }
}
