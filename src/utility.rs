/*
lptools, to make, dump and unpack Android logical partition images: utility module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::format::{Geometry, METADATA_GEOMETRY_SIZE, PARTITION_RESERVED_BYTES};

/// Round `base` up to a multiple of `alignment`, 0 alignment leaves it as is.
/// `None` when the result does not fit in a u64.
pub fn align_to(base: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(base)
    }
    base.div_ceil(alignment).checked_mul(alignment)
}

/// Smallest value not below `base` that sits `offset` past an `alignment`
/// boundary
pub fn align_to_offset(base: u64, alignment: u64, offset: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(base)
    }
    let aligned = align_to(base, alignment)?.checked_add(offset)?;
    if aligned >= alignment && aligned - alignment >= base {
        Some(aligned - alignment)
    } else {
        Some(aligned)
    }
}

/// Anything other than a/b maps to the first slot
pub fn slot_number_for_slot_suffix(suffix: &str) -> u32 {
    match suffix.strip_prefix('_').unwrap_or(suffix) {
        "b" => 1,
        _ => 0,
    }
}

/// Space taken at the start of the super device by the reserved area, both
/// geometry copies and every primary and backup metadata slot. Saturates
/// at `u64::MAX`.
pub fn total_metadata_size(metadata_max_size: u32, metadata_slot_count: u32) -> u64 {
    (metadata_max_size as u64 * metadata_slot_count as u64)
        .saturating_add(METADATA_GEOMETRY_SIZE)
        .saturating_mul(2)
        .saturating_add(PARTITION_RESERVED_BYTES)
}

pub fn primary_metadata_offset(geometry: &Geometry, slot: u32) -> u64 {
    PARTITION_RESERVED_BYTES + METADATA_GEOMETRY_SIZE * 2 +
        geometry.metadata_max_size as u64 * slot as u64
}

pub fn backup_metadata_offset(geometry: &Geometry, slot: u32) -> u64 {
    PARTITION_RESERVED_BYTES + METADATA_GEOMETRY_SIZE * 2 +
        geometry.metadata_max_size as u64 * geometry.metadata_slot_count as u64 +
        geometry.metadata_max_size as u64 * slot as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_suffixes() {
        assert_eq!(slot_number_for_slot_suffix(""), 0);
        assert_eq!(slot_number_for_slot_suffix("a"), 0);
        assert_eq!(slot_number_for_slot_suffix("_a"), 0);
        assert_eq!(slot_number_for_slot_suffix("b"), 1);
        assert_eq!(slot_number_for_slot_suffix("_b"), 1);
        assert_eq!(slot_number_for_slot_suffix("_c"), 0);
    }

    #[test]
    fn metadata_offsets() {
        let geometry = Geometry {
            metadata_max_size: 16384,
            metadata_slot_count: 4,
            logical_block_size: 4096,
        };
        let start = PARTITION_RESERVED_BYTES;
        assert_eq!(primary_metadata_offset(&geometry, 0), start + 8192);
        assert_eq!(primary_metadata_offset(&geometry, 3), start + 8192 + 16384 * 3);
        let backup_start = start + 8192 + 16384 * 4;
        assert_eq!(backup_metadata_offset(&geometry, 0), backup_start);
        assert_eq!(backup_metadata_offset(&geometry, 2), backup_start + 16384 * 2);
        assert_eq!(total_metadata_size(16384, 4), backup_start + 16384 * 4);
        assert_eq!(total_metadata_size(u32::MAX, u32::MAX), u64::MAX);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_to(37, 0), Some(37));
        assert_eq!(align_to(1024, 1024), Some(1024));
        assert_eq!(align_to(555, 1024), Some(1024));
        assert_eq!(align_to(555, 1000), Some(1000));
        assert_eq!(align_to(0, 1024), Some(0));
        assert_eq!(align_to_offset(54, 32, 30), Some(62));
        assert_eq!(align_to_offset(32, 32, 30), Some(62));
        assert_eq!(align_to_offset(17, 32, 30), Some(30));
        assert_eq!(align_to_offset(0, 32, 30), Some(30));
    }

    #[test]
    fn alignment_overflow() {
        assert_eq!(align_to(u64::MAX - 1, 4096), None);
        assert_eq!(align_to(u64::MAX, 1), Some(u64::MAX));
        assert_eq!(align_to(u64::MAX - 4095, 4096), Some(u64::MAX - 4095));
        assert_eq!(align_to_offset(u64::MAX - 4095, 4096, 8192), None);
        assert_eq!(align_to_offset(u64::MAX - 1, 4096, 0), None);
    }
}
