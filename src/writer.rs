/*
lptools, to make, dump and unpack Android logical partition images: image writer module
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

//! Full, sparse, split and empty super images.
//!
//! Every output is first described as a sorted list of segments per block
//! device; flat and sparse writers then only differ in how they lay those
//! segments down.

use std::{
    collections::BTreeMap,
    fs::{create_dir_all, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use indicatif::ProgressBar;
use tracing::{debug, error};

use crate::{
    format::{
        Metadata, MetadataExtent, TargetType, METADATA_GEOMETRY_SIZE,
        PARTITION_RESERVED_BYTES, SECTOR_SIZE,
    },
    progress::bytes_progress_bar,
    sparse::{is_sparse_image, ChunkData, SparseImage, SparseWriter},
    utility::{align_to, backup_metadata_offset, primary_metadata_offset, total_metadata_size},
    Result,
};

const SIZE_BUFFER: u64 = 0x100000;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("block size {size} is not a positive multiple of the sector size")]
    InvalidBlockSize {
        size: u32
    },
    #[error("block device '{name}' size {size} is not a multiple of the block size {block_size}")]
    UnalignedDevice {
        name: String,
        size: u64,
        block_size: u32,
    },
    #[error("an extent of partition '{name}' is not aligned to the block size {block_size}")]
    UnalignedExtent {
        name: String,
        block_size: u32,
    },
    #[error("image '{path}' is for partition '{name}', which does not exist")]
    UnknownPartition {
        name: String,
        path: String,
    },
    #[error("image '{path}' of {size} bytes does not fit partition '{name}' of {partition_size} bytes")]
    ImageTooLarge {
        name: String,
        path: String,
        size: u64,
        partition_size: u64,
    },
    #[error("metadata spans {count} block devices, a single image file cannot hold them")]
    MultipleBlockDevices {
        count: usize
    },
    #[error("there is no block device {index}")]
    NoSuchBlockDevice {
        index: usize
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    /// Offset into the serialized metadata region
    Metadata(u64),
    /// Offset into one of the partition input files, reads past its end
    /// give zeros
    Image {
        index: usize,
        offset: u64,
    },
    Fill(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    offset: u64,
    length: u64,
    source: Source,
}

#[derive(Debug)]
struct DevicePlan {
    name: String,
    size: u64,
    segments: Vec<Segment>,
}

/// Reserved zeros, both geometry copies, then every primary and every backup
/// slot, each slot padded to the maximum metadata size
pub fn serialize_metadata_region(metadata: &Metadata) -> Vec<u8> {
    let geometry = &metadata.geometry;
    let mut region = vec![0; total_metadata_size(
        geometry.metadata_max_size, geometry.metadata_slot_count) as usize];
    let encoded_geometry = geometry.encode();
    let geometry_start = PARTITION_RESERVED_BYTES as usize;
    for copy in 0..2 {
        let start = geometry_start + copy * METADATA_GEOMETRY_SIZE as usize;
        region[start..start + encoded_geometry.len()].copy_from_slice(&encoded_geometry);
    }
    let encoded = metadata.encode();
    for slot in 0..geometry.metadata_slot_count {
        for offset in [primary_metadata_offset(geometry, slot),
            backup_metadata_offset(geometry, slot)]
        {
            let start = offset as usize;
            region[start..start + encoded.len()].copy_from_slice(&encoded);
        }
    }
    region
}

/// Call `emit(device, device_offset, length, delta)` for every linear piece
/// of the partition range `[logical, logical + length)`, `delta` being the
/// distance of the piece from `logical`
fn map_through_extents<F>(extents: &[MetadataExtent], logical: u64, length: u64, mut emit: F)
where
    F: FnMut(u32, u64, u64, u64)
{
    let mut extent_start = 0;
    for extent in extents.iter() {
        let extent_end = extent_start + extent.num_sectors * SECTOR_SIZE;
        let begin = logical.max(extent_start);
        let end = (logical + length).min(extent_end);
        if begin < end && extent.target_type == TargetType::Linear {
            emit(extent.target_source,
                extent.target_data * SECTOR_SIZE + begin - extent_start,
                end - begin, begin - logical)
        }
        extent_start = extent_end;
    }
}

/// Fill `buffer` from the reader, zeroing whatever lies past its end
fn read_padded<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(size) => filled += size,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e.into()),
        }
    }
    buffer[filled..].fill(0);
    Ok(())
}

/// Where everything goes, before any byte is written
#[derive(Debug)]
pub struct ImagePlan {
    block_size: u32,
    metadata_region: Vec<u8>,
    images: Vec<PathBuf>,
    devices: Vec<DevicePlan>,
}

impl ImagePlan {
    pub fn new(metadata: &Metadata, block_size: u32, images: &BTreeMap<String, PathBuf>)
        -> Result<Self>
    {
        if block_size == 0 || block_size as u64 % SECTOR_SIZE != 0 {
            return Err(ImageError::InvalidBlockSize { size: block_size }.into())
        }
        metadata.validate()?;
        let block = block_size as u64;
        let mut devices = Vec::with_capacity(metadata.block_devices.len());
        for device in metadata.block_devices.iter() {
            if device.size % block != 0 {
                return Err(ImageError::UnalignedDevice {
                    name: device.partition_name.clone(),
                    size: device.size,
                    block_size
                }.into())
            }
            devices.push(DevicePlan {
                name: device.partition_name.clone(),
                size: device.size,
                segments: Vec::new(),
            })
        }
        for partition in metadata.partitions.iter() {
            let unaligned = metadata.extents_of(partition).iter().any(|extent|
                extent.target_type == TargetType::Linear &&
                ((extent.target_data * SECTOR_SIZE) % block != 0 ||
                    (extent.num_sectors * SECTOR_SIZE) % block != 0));
            if unaligned {
                error!("Partition '{}' has extents not aligned to {} bytes",
                    partition.name, block_size);
                return Err(ImageError::UnalignedExtent {
                    name: partition.name.clone(), block_size }.into())
            }
        }
        let mut metadata_region = serialize_metadata_region(metadata);
        match align_to(metadata_region.len() as u64, block) {
            Some(size) => metadata_region.resize(size as usize, 0),
            None => return Err(ImageError::InvalidBlockSize { size: block_size }.into()),
        }
        if let Some(device) = devices.first_mut() {
            device.segments.push(Segment {
                offset: 0,
                length: metadata_region.len() as u64,
                source: Source::Metadata(0),
            })
        }
        let mut plan = Self {
            block_size,
            metadata_region,
            images: Vec::with_capacity(images.len()),
            devices,
        };
        for (name, path) in images.iter() {
            plan.add_partition_image(metadata, name, path)?
        }
        for device in plan.devices.iter_mut() {
            device.segments.sort_by_key(|segment|segment.offset)
        }
        Ok(plan)
    }

    fn add_partition_image(&mut self, metadata: &Metadata, name: &str, path: &Path)
        -> Result<()>
    {
        let partition = match metadata.find_partition(name) {
            Some(partition) => partition,
            None => {
                error!("Image '{}' given for unknown partition '{}'", path.display(), name);
                return Err(ImageError::UnknownPartition {
                    name: name.into(), path: path.display().to_string() }.into())
            }
        };
        let extents = metadata.extents_of(partition);
        let partition_size = metadata.partition_size(partition);
        let index = self.images.len();
        let mut file = File::open(path)?;
        let mut pieces = Vec::new();
        let size = if is_sparse_image(&mut file)? {
            let sparse = SparseImage::read_from(&mut file)?;
            for chunk in sparse.chunks() {
                let base = match chunk.data {
                    ChunkData::Raw { file_offset } =>
                        Source::Image { index, offset: file_offset },
                    ChunkData::Fill(value) => Source::Fill(value),
                    ChunkData::DontCare | ChunkData::Crc32(_) => continue,
                };
                map_through_extents(extents, chunk.offset, chunk.length,
                    |device, offset, length, delta| {
                        let source = match base {
                            Source::Image { index, offset: file_offset } =>
                                Source::Image { index, offset: file_offset + delta },
                            other => other,
                        };
                        pieces.push((device as usize, Segment { offset, length, source }))
                    });
            }
            sparse.expanded_size()
        } else {
            let size = file.metadata()?.len();
            if let Some(length) = align_to(size, self.block_size as u64) {
                map_through_extents(extents, 0, length,
                    |device, offset, length, delta| pieces.push((device as usize, Segment {
                        offset, length, source: Source::Image { index, offset: delta } })));
            }
            size
        };
        if size > partition_size {
            error!("Image '{}' is {} bytes, partition '{}' only {}", path.display(),
                size, name, partition_size);
            return Err(ImageError::ImageTooLarge {
                name: name.into(),
                path: path.display().to_string(),
                size,
                partition_size,
            }.into())
        }
        debug!("Partition '{}' takes {} segments from '{}'", name, pieces.len(),
            path.display());
        for (device, segment) in pieces {
            if let Some(device) = self.devices.get_mut(device) {
                device.segments.push(segment)
            }
        }
        self.images.push(path.into());
        Ok(())
    }

    /// Stream the bytes of a non-fill segment in block-aligned pieces
    fn for_each_piece<F>(&self, files: &mut [File], segment: &Segment, mut consume: F)
        -> Result<()>
    where
        F: FnMut(u64, &[u8]) -> Result<()>
    {
        let buffer_size = align_to(SIZE_BUFFER, self.block_size as u64)
            .unwrap_or(self.block_size as u64);
        match segment.source {
            Source::Metadata(start) => {
                let start = start as usize;
                let data = &self.metadata_region[start..start + segment.length as usize];
                for (id, piece) in data.chunks(buffer_size as usize).enumerate() {
                    consume(segment.offset + id as u64 * buffer_size, piece)?
                }
            },
            Source::Image { index, offset } => {
                let file = &mut files[index];
                file.seek(SeekFrom::Start(offset))?;
                let mut buffer = vec![0; buffer_size.min(segment.length) as usize];
                let mut done = 0;
                while done < segment.length {
                    let size = (segment.length - done).min(buffer.len() as u64) as usize;
                    read_padded(file, &mut buffer[..size])?;
                    consume(segment.offset + done, &buffer[..size])?;
                    done += size as u64;
                }
            },
            Source::Fill(_) => (),
        }
        Ok(())
    }

    fn data_length(device: &DevicePlan) -> u64 {
        device.segments.iter().map(|segment|segment.length).sum()
    }

    fn write_device_flat(&self, device: &DevicePlan, files: &mut [File], output: &mut File,
        progress: &ProgressBar
    ) -> Result<()> {
        output.set_len(device.size)?;
        for segment in device.segments.iter() {
            output.seek(SeekFrom::Start(segment.offset))?;
            match segment.source {
                Source::Fill(0) => (),
                Source::Fill(value) => {
                    let pattern: Vec<u8> = value.to_le_bytes().iter().copied().cycle()
                        .take(segment.length.min(SIZE_BUFFER) as usize).collect();
                    let mut remaining = segment.length;
                    while remaining > 0 {
                        let size = remaining.min(pattern.len() as u64) as usize;
                        output.write_all(&pattern[..size])?;
                        remaining -= size as u64;
                    }
                },
                _ => self.for_each_piece(files, segment, |_, data| {
                    output.write_all(data)?;
                    Ok(())
                })?,
            }
            progress.inc(segment.length);
        }
        output.flush()?;
        Ok(())
    }

    fn write_device_sparse(&self, device: &DevicePlan, files: &mut [File], output: File,
        progress: &ProgressBar
    ) -> Result<()> {
        let mut writer = SparseWriter::new(output, self.block_size)?;
        for segment in device.segments.iter() {
            match segment.source {
                Source::Fill(value) =>
                    writer.write_fill(segment.offset, segment.length, value)?,
                _ => self.for_each_piece(files, segment,
                    |offset, data|writer.write_raw(offset, data))?,
            }
            progress.inc(segment.length);
        }
        writer.finish(device.size)?;
        Ok(())
    }

    /// Write block device `index` to `path`, flat with holes or sparse
    pub fn write_device<P: AsRef<Path>>(&self, index: usize, path: P, sparse: bool)
        -> Result<()>
    {
        let path = path.as_ref();
        let device = match self.devices.get(index) {
            Some(device) => device,
            None => return Err(ImageError::NoSuchBlockDevice { index }.into()),
        };
        let mut files = self.images.iter().map(File::open)
            .collect::<std::io::Result<Vec<File>>>()?;
        let output = File::create(path)?;
        let name = path.file_name().map(|name|name.to_string_lossy().into_owned())
            .unwrap_or_else(||device.name.clone());
        let progress = bytes_progress_bar(Self::data_length(device),
            format!("Writing {}", name))?;
        debug!("Writing block device '{}' ({} bytes, {} segments) to '{}'{}",
            device.name, device.size, device.segments.len(), path.display(),
            if sparse { " as sparse" } else { "" });
        let result = if sparse {
            self.write_device_sparse(device, &mut files, output, &progress)
        } else {
            let mut output = output;
            self.write_device_flat(device, &mut files, &mut output, &progress)
        };
        progress.finish_and_clear();
        if let Err(e) = &result {
            error!("Failed to write '{}': {}", path.display(), e);
        }
        result
    }
}

/// Geometry padded to its block followed by a single metadata copy
pub fn write_empty_image_file<P: AsRef<Path>>(path: P, metadata: &Metadata) -> Result<()> {
    let mut data = metadata.geometry.encode();
    data.extend_from_slice(&metadata.encode());
    let mut file = File::create(path)?;
    file.write_all(&data)?;
    file.flush()?;
    Ok(())
}

/// Full image of a single-device super partition
pub fn write_to_image_file<P: AsRef<Path>>(
    path: P, metadata: &Metadata, block_size: u32, images: &BTreeMap<String, PathBuf>,
    sparse: bool
) -> Result<()> {
    let count = metadata.block_devices.len();
    if count != 1 {
        error!("Cannot write {} block devices into a single image", count);
        return Err(ImageError::MultipleBlockDevices { count }.into())
    }
    ImagePlan::new(metadata, block_size, images)?.write_device(0, path, sparse)
}

/// Path of the split image for one block device
pub fn split_image_path<P: AsRef<Path>>(output_dir: P, device_name: &str) -> PathBuf {
    output_dir.as_ref().join(format!("super_{}.img", device_name))
}

/// One image per block device in `output_dir`, metadata only on the first
pub fn write_split_image_files<P: AsRef<Path>>(
    output_dir: P, metadata: &Metadata, block_size: u32,
    images: &BTreeMap<String, PathBuf>, sparse: bool
) -> Result<()> {
    let output_dir = output_dir.as_ref();
    let plan = ImagePlan::new(metadata, block_size, images)?;
    create_dir_all(output_dir)?;
    for (index, device) in metadata.block_devices.iter().enumerate() {
        plan.write_device(index,
            split_image_path(output_dir, &device.partition_name), sparse)?
    }
    Ok(())
}

/// Write both geometry copies and every slot's primary and backup metadata
/// onto an existing device, leaving partition data alone
pub fn flash_partition_table<P: AsRef<Path>>(device: P, metadata: &Metadata) -> Result<()> {
    let geometry = &metadata.geometry;
    let mut file = OpenOptions::new().write(true).open(device.as_ref())?;
    let encoded_geometry = geometry.encode();
    file.seek(SeekFrom::Start(PARTITION_RESERVED_BYTES))?;
    file.write_all(&encoded_geometry)?;
    file.write_all(&encoded_geometry)?;
    let encoded = metadata.encode();
    for slot in 0..geometry.metadata_slot_count {
        for offset in [primary_metadata_offset(geometry, slot),
            backup_metadata_offset(geometry, slot)]
        {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&encoded)?;
        }
    }
    file.flush()?;
    debug!("Flashed partition table to '{}'", device.as_ref().display());
    Ok(())
}
