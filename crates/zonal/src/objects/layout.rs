//! Object Class Configuration
//!
//! The class table drives every slab decision: slot size (multiplier),
//! region size, slot count, head offset and the exact divider for the
//! reverse offset → index mapping. Classes are generated once, lazily:
//!
//! - multiples of 8 bytes up to 256 (fine-grained small classes), then
//! - four classes per power-of-two octave (`{5,6,7,8} << k`) up to the
//!   512 KiB slab ceiling.
//!
//! Size lookup is O(1) through three range tables (small / medium /
//! large bands), each mapping a rounded request size to the smallest
//! class that fits.

use crate::space::{SEGMENTATION_MIN, UNIT_SIZE_L2};
use crate::util::{bits::ceil_log2, ExactDivider};
use lazy_static::lazy_static;

/// Fixed head of every object region, before slot 0
pub const REGION_HEAD_SIZE: usize = 64;

/// The object header word preceding every payload
pub const OBJECT_HEADER_SIZE: usize = 8;

/// Largest slot size served by the slab layer (512 KiB)
pub const SLAB_SIZE_MAX: usize = 512 * 1024;

/// Number of object classes
pub const LAYOUT_COUNT: usize = 76;

/// Maximum slots per region, bounded by the 64-bit used bitmap
pub const MAX_OBJECTS_PER_REGION: u32 = 64;

/// Configuration of one object class
#[derive(Debug, Clone)]
pub struct ObjectLayoutInfos {
    /// Slot size in bytes
    pub multiplier: u32,
    /// log2 of the region size holding this class
    pub region_size_l2: u8,
    /// Committed-pages policy for the region
    pub region_sizing_id: u8,
    /// Slots per region (≤ 64)
    pub object_count: u8,
    /// Offset of slot 0 from the region base
    pub head_offset: u32,
    /// Exact divider for offset → slot index
    pub divider: ExactDivider,
}

struct LayoutTable {
    infos: Vec<ObjectLayoutInfos>,
    // Band tables: rounded size index → class id.
    small: [u8; 513],  // sizes 0..=4096, indexed by ceil(size / 8)
    medium: [u8; 513], // sizes ..=65536, indexed by ceil(size / 128)
    large: [u8; 513],  // sizes ..=524288, indexed by ceil(size / 1024)
}

const SMALL_SIZE_LIMIT: usize = 4096;
const MEDIUM_SIZE_LIMIT: usize = 65536;

lazy_static! {
    static ref TABLE: LayoutTable = LayoutTable::build();
}

impl LayoutTable {
    fn build() -> Self {
        let mut sizes: Vec<u32> = Vec::with_capacity(LAYOUT_COUNT);

        // Fine-grained small classes: every multiple of 8 up to 256.
        for size in (8..=256u32).step_by(8) {
            sizes.push(size);
        }
        // Four classes per octave up to the slab ceiling.
        let mut shift = 6u32;
        while (5u32 << shift) as usize <= SLAB_SIZE_MAX {
            for packing in 5..=8u32 {
                let size = packing << shift;
                if size as usize <= SLAB_SIZE_MAX {
                    sizes.push(size);
                }
            }
            shift += 1;
        }
        debug_assert_eq!(sizes.len(), LAYOUT_COUNT);

        let infos: Vec<ObjectLayoutInfos> = sizes.iter().map(|&size| class_infos(size)).collect();

        let mut table = Self {
            infos,
            small: [0; 513],
            medium: [0; 513],
            large: [0; 513],
        };
        table.fill_band(0, 8);
        table.fill_band(1, 128);
        table.fill_band(2, 1024);
        table
    }

    fn fill_band(&mut self, band: usize, granularity: usize) {
        for index in 0..=512usize {
            let size = index * granularity;
            let class = self
                .infos
                .iter()
                .position(|infos| infos.multiplier as usize >= size)
                .unwrap_or(LAYOUT_COUNT - 1) as u8;
            match band {
                0 => self.small[index] = class,
                1 => self.medium[index] = class,
                _ => self.large[index] = class,
            }
        }
    }
}

fn class_infos(multiplier: u32) -> ObjectLayoutInfos {
    let full = REGION_HEAD_SIZE + MAX_OBJECTS_PER_REGION as usize * multiplier as usize;
    let region_size_l2 = ceil_log2(full)
        .clamp(SEGMENTATION_MIN as u32, UNIT_SIZE_L2) as u8;
    let region_size = 1usize << region_size_l2;
    let object_count = ((region_size - REGION_HEAD_SIZE) / multiplier as usize)
        .min(MAX_OBJECTS_PER_REGION as usize) as u8;
    debug_assert!(object_count > 0);

    ObjectLayoutInfos {
        multiplier,
        region_size_l2,
        region_sizing_id: 0,
        object_count,
        head_offset: REGION_HEAD_SIZE as u32,
        divider: ExactDivider::new(multiplier),
    }
}

/// Configuration of class `layout_id`.
#[inline]
pub fn layout_infos(layout_id: u8) -> &'static ObjectLayoutInfos {
    &TABLE.infos[layout_id as usize]
}

/// Smallest class whose slot fits `size` bytes, or None for the
/// large-object path.
#[inline]
pub fn class_for_size(size: usize) -> Option<u8> {
    if size <= SMALL_SIZE_LIMIT {
        Some(TABLE.small[(size + 7) / 8])
    } else if size <= MEDIUM_SIZE_LIMIT {
        Some(TABLE.medium[(size + 127) / 128])
    } else if size <= SLAB_SIZE_MAX {
        Some(TABLE.large[(size + 1023) / 1024])
    } else {
        None
    }
}

/// Slot index of a region offset, or None when the offset points into
/// the region head.
#[inline]
pub fn slot_index_of(infos: &ObjectLayoutInfos, offset_in_region: u32) -> Option<u32> {
    if offset_in_region < infos.head_offset {
        return None;
    }
    let index = infos.divider.divide(offset_in_region - infos.head_offset);
    if index < infos.object_count as u32 {
        Some(index)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_count() {
        assert_eq!(TABLE.infos.len(), LAYOUT_COUNT);
        // Sizes are strictly increasing.
        for pair in TABLE.infos.windows(2) {
            assert!(pair[0].multiplier < pair[1].multiplier);
        }
        assert_eq!(TABLE.infos[0].multiplier, 8);
        assert_eq!(
            TABLE.infos[LAYOUT_COUNT - 1].multiplier as usize,
            SLAB_SIZE_MAX
        );
    }

    #[test]
    fn test_every_size_routes_to_fitting_class() {
        for size in 1..=SLAB_SIZE_MAX {
            let class = class_for_size(size).expect("slab size must have a class");
            let infos = layout_infos(class);
            assert!(
                infos.multiplier as usize >= size,
                "size {} routed to class {} of {} bytes",
                size,
                class,
                infos.multiplier
            );
            // The class below (if any) must not fit, or this is not the
            // smallest fitting class.
            if class > 0 {
                let below = layout_infos(class - 1);
                assert!(
                    (below.multiplier as usize) < size,
                    "size {} skipped class {} of {} bytes",
                    size,
                    class - 1,
                    below.multiplier
                );
            }
        }
    }

    #[test]
    fn test_sizes_above_ceiling_have_no_class() {
        assert!(class_for_size(SLAB_SIZE_MAX + 1).is_none());
        assert!(class_for_size(4 << 20).is_none());
    }

    #[test]
    fn test_regions_hold_their_slots() {
        for (id, infos) in TABLE.infos.iter().enumerate() {
            let region_size = 1usize << infos.region_size_l2;
            let span = infos.head_offset as usize
                + infos.object_count as usize * infos.multiplier as usize;
            assert!(span <= region_size, "class {} overflows its region", id);
            assert!(infos.object_count >= 1 && infos.object_count <= 64);
            assert!(infos.region_size_l2 >= SEGMENTATION_MIN);
        }
    }

    #[test]
    fn test_slot_index_round_trip() {
        for infos in TABLE.infos.iter() {
            for index in [0u32, 1, infos.object_count as u32 - 1] {
                let offset = infos.head_offset + index * infos.multiplier;
                assert_eq!(slot_index_of(infos, offset), Some(index));
                // Interior pointers resolve to the same slot.
                assert_eq!(slot_index_of(infos, offset + infos.multiplier - 1), Some(index));
            }
            // Pointers into the head resolve to no slot.
            assert_eq!(slot_index_of(infos, 0), None);
            assert_eq!(slot_index_of(infos, infos.head_offset - 1), None);
        }
    }

    #[test]
    fn test_small_classes_pack_one_page() {
        // Classes up to ~1 KiB slots keep 64 slots in a single page.
        let class = class_for_size(64).unwrap();
        let infos = layout_infos(class);
        assert_eq!(infos.region_size_l2, SEGMENTATION_MIN);
        assert_eq!(infos.object_count, 64);
    }
}
