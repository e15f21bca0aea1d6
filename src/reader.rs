/*
lptools, to make, dump and unpack Android logical partition images: metadata reader module
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

use std::{fs::File, io::{Read, Seek, SeekFrom}, path::Path};

use tracing::{debug, warn};

use crate::{
    format::{
        FormatError, Geometry, Metadata, METADATA_GEOMETRY_MAGIC,
        METADATA_GEOMETRY_SIZE, PARTITION_RESERVED_BYTES,
    },
    utility::{backup_metadata_offset, primary_metadata_offset},
    Result,
};

fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, length: usize) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut buffer = vec![0; length];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

fn read_geometry_at<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<Geometry> {
    Geometry::decode(&read_at(reader, offset, METADATA_GEOMETRY_SIZE as usize)?)
}

/// Primary geometry, or the backup right after it when the primary is bad
pub fn read_geometry<R: Read + Seek>(reader: &mut R) -> Result<Geometry> {
    match read_geometry_at(reader, PARTITION_RESERVED_BYTES) {
        Ok(geometry) => Ok(geometry),
        Err(e) => {
            warn!("Primary geometry unusable ({}), trying backup", e);
            read_geometry_at(reader, PARTITION_RESERVED_BYTES + METADATA_GEOMETRY_SIZE)
        }
    }
}

fn read_metadata_at<R: Read + Seek>(reader: &mut R, geometry: &Geometry, offset: u64)
    -> Result<Metadata>
{
    Metadata::decode(geometry,
        &read_at(reader, offset, geometry.metadata_max_size as usize)?)
}

/// Read one slot from a device or full image, falling back to the backup
/// copy exactly once
pub fn try_read_metadata<R: Read + Seek>(reader: &mut R, slot: u32) -> Result<Metadata> {
    let geometry = read_geometry(reader)?;
    if slot >= geometry.metadata_slot_count {
        return Err(FormatError::SlotOutOfRange {
            slot, count: geometry.metadata_slot_count }.into())
    }
    match read_metadata_at(reader, &geometry, primary_metadata_offset(&geometry, slot)) {
        Ok(metadata) => Ok(metadata),
        Err(e) => {
            warn!("Primary metadata of slot {} unusable ({}), trying backup", slot, e);
            read_metadata_at(reader, &geometry, backup_metadata_offset(&geometry, slot))
        }
    }
}

/// Like [`try_read_metadata`] on a path, but a missing or corrupt table is
/// just "nothing there"
pub fn read_metadata<P: AsRef<Path>>(path: P, slot: u32) -> Option<Metadata> {
    let path = path.as_ref();
    let result = File::open(path).map_err(Into::into)
        .and_then(|mut file|try_read_metadata(&mut file, slot));
    match result {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            debug!("No metadata in slot {} of '{}': {}", slot, path.display(), e);
            None
        }
    }
}

/// Whether the file starts with a geometry block, as `super_empty.img` does
pub fn is_empty_super_image<P: AsRef<Path>>(path: P) -> Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0; 4];
    match file.read_exact(&mut magic) {
        Ok(_) => Ok(u32::from_le_bytes(magic) == METADATA_GEOMETRY_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read the single metadata copy of an empty image
pub fn read_from_image_file<P: AsRef<Path>>(path: P) -> Result<Metadata> {
    let mut file = File::open(path)?;
    let geometry = read_geometry_at(&mut file, 0)?;
    let mut raw = Vec::new();
    file.take(geometry.metadata_max_size as u64).read_to_end(&mut raw)?;
    Metadata::decode(&geometry, &raw)
}

/// Metadata of either an empty image or a full image / device
pub fn read_image_metadata<P: AsRef<Path>>(path: P, slot: u32) -> Result<Metadata> {
    let path = path.as_ref();
    if is_empty_super_image(path)? {
        debug!("'{}' is an empty super image", path.display());
        read_from_image_file(path)
    } else {
        try_read_metadata(&mut File::open(path)?, slot)
    }
}
