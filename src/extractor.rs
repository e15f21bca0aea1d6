/*
lptools, to make, dump and unpack Android logical partition images: extractor module
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

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use indicatif::ProgressBar;
use tracing::{debug, error};

use crate::{
    format::{Metadata, MetadataPartition, TargetType, SECTOR_SIZE},
    progress::bytes_progress_bar,
    Result,
};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("could not find partition(s): {}", names.join(", "))]
    PartitionsNotFound {
        names: Vec<String>
    },
    #[error("partition '{name}' has an extent of unsupported target type {target_type}")]
    UnsupportedTargetType {
        name: String,
        target_type: TargetType,
    },
    #[error("partition '{name}' lives on block device {index}, split super devices are not supported")]
    SplitSuperDevice {
        name: String,
        index: u32,
    },
    #[error("partition '{name}' has an extent past the end of addressable bytes")]
    ExtentOutOfRange {
        name: String
    },
    #[error("extent is not block-aligned in partition '{name}'")]
    UnalignedExtent {
        name: String
    },
    #[error("this image appears to be a sparse image, it must be unsparsed first")]
    SparseSuperImage,
}

/// Writes blocks to a file, turning runs of all-zero blocks into holes
#[derive(Debug)]
pub struct HoleWriter {
    file: File,
    pending_hole: u64,
}

impl HoleWriter {
    pub fn new(file: File) -> Self {
        Self { file, pending_hole: 0 }
    }

    pub fn write_block(&mut self, block: &[u8]) -> Result<()> {
        if block.iter().all(|byte|*byte == 0) {
            self.pending_hole += block.len() as u64;
            return Ok(())
        }
        if self.pending_hole > 0 {
            self.file.seek(SeekFrom::Current(self.pending_hole as i64))?;
            self.pending_hole = 0;
        }
        self.file.write_all(block)?;
        Ok(())
    }

    /// Materialize a trailing hole by extending the file to its full length
    pub fn finish(mut self) -> Result<File> {
        if self.pending_hole > 0 {
            let position = self.file.stream_position()?;
            self.file.set_len(position + self.pending_hole)?;
        }
        self.file.flush()?;
        Ok(self.file)
    }
}

/// Copies partitions out of a single-device super image
#[derive(Debug)]
pub struct ImageExtractor {
    image: File,
    metadata: Metadata,
    /// Partitions to extract by name, each an index into the partition table
    targets: BTreeMap<String, usize>,
}

impl ImageExtractor {
    /// Pick `names` out of the partition table, every partition when empty
    pub fn new(image: File, metadata: Metadata, names: &[String]) -> Result<Self> {
        let mut missing: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let mut targets = BTreeMap::new();
        for (index, partition) in metadata.partitions.iter().enumerate() {
            if names.is_empty() || missing.remove(partition.name.as_str()) {
                targets.insert(partition.name.clone(), index);
            }
        }
        if ! missing.is_empty() {
            let names: Vec<String> = missing.into_iter().map(Into::into).collect();
            error!("Could not find partition(s): {}", names.join(", "));
            return Err(ExtractError::PartitionsNotFound { names }.into())
        }
        Ok(Self { image, metadata, targets })
    }

    pub fn output_path<P: AsRef<Path>>(output_dir: P, name: &str) -> PathBuf {
        output_dir.as_ref().join(format!("{}.img", name))
    }

    /// Extract every target in name order, stopping at the first failure
    pub fn extract<P: AsRef<Path>>(&mut self, output_dir: P) -> Result<()> {
        let output_dir = output_dir.as_ref();
        let targets: Vec<usize> = self.targets.values().copied().collect();
        for index in targets {
            let partition = self.metadata.partitions[index].clone();
            self.extract_partition(&partition, output_dir)?
        }
        Ok(())
    }

    /// Byte ranges on the super device backing `partition`, as (start, length)
    fn byte_ranges(&self, partition: &MetadataPartition) -> Result<Vec<(u64, u64)>> {
        let mut ranges = Vec::new();
        for extent in self.metadata.extents_of(partition) {
            if extent.target_type != TargetType::Linear {
                error!("Unsupported target type in extent of '{}': {}", partition.name,
                    extent.target_type);
                return Err(ExtractError::UnsupportedTargetType {
                    name: partition.name.clone(), target_type: extent.target_type }.into())
            }
            if extent.target_source != 0 {
                error!("Partition '{}' is on split super device {}", partition.name,
                    extent.target_source);
                return Err(ExtractError::SplitSuperDevice {
                    name: partition.name.clone(), index: extent.target_source }.into())
            }
            match extent.target_data.checked_mul(SECTOR_SIZE)
                .zip(extent.num_sectors.checked_mul(SECTOR_SIZE))
            {
                Some(range) => ranges.push(range),
                None => return Err(ExtractError::ExtentOutOfRange {
                    name: partition.name.clone() }.into()),
            }
        }
        Ok(ranges)
    }

    fn extract_partition(&mut self, partition: &MetadataPartition, output_dir: &Path)
        -> Result<()>
    {
        let ranges = self.byte_ranges(partition)?;
        let total_size = match ranges.iter().try_fold(0u64,
            |total, (_, length)|total.checked_add(*length))
        {
            Some(total_size) => total_size,
            None => return Err(ExtractError::ExtentOutOfRange {
                name: partition.name.clone() }.into()),
        };
        let path = Self::output_path(output_dir, &partition.name);
        debug!("Extracting '{}' ({} bytes) to '{}'", partition.name, total_size,
            path.display());
        let mut writer = HoleWriter::new(File::create(&path)?);
        let progress = bytes_progress_bar(total_size,
            format!("Extracting {}", partition.name))?;
        let block_size = self.metadata.geometry.logical_block_size as usize;
        let mut buffer = vec![0; block_size];
        for (start, length) in ranges {
            let result = self.copy_range(partition, start, length, &mut buffer, &mut writer,
                &progress);
            if result.is_err() {
                progress.finish_and_clear();
                return result
            }
        }
        writer.finish()?;
        progress.finish_and_clear();
        Ok(())
    }

    fn copy_range(&mut self, partition: &MetadataPartition, start: u64, length: u64,
        buffer: &mut [u8], writer: &mut HoleWriter, progress: &ProgressBar
    ) -> Result<()> {
        self.image.seek(SeekFrom::Start(start))?;
        let mut remaining = length;
        while remaining > 0 {
            if remaining < buffer.len() as u64 {
                error!("Extent is not block-aligned in partition '{}'", partition.name);
                return Err(ExtractError::UnalignedExtent {
                    name: partition.name.clone() }.into())
            }
            self.image.read_exact(buffer)?;
            writer.write_block(buffer)?;
            remaining -= buffer.len() as u64;
            progress.inc(buffer.len() as u64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builder::MetadataBuilder, Error};

    const MIB: u64 = 1 << 20;

    /// One 64 KiB partition "system" on a 4 MiB device, with a backing image
    fn sample() -> (Metadata, File) {
        let mut builder = MetadataBuilder::with_device_size(4 * MIB, 4096, 2).unwrap();
        let system = builder.add_partition("system", "default", 0).unwrap();
        builder.resize_partition(system, 65536).unwrap();
        let image = tempfile::tempfile().unwrap();
        image.set_len(4 * MIB).unwrap();
        (builder.export().unwrap(), image)
    }

    fn extract_failure(metadata: Metadata, image: File) -> (Error, bool) {
        let dir = tempfile::tempdir().unwrap();
        let mut extractor = ImageExtractor::new(image, metadata, &[]).unwrap();
        let error = extractor.extract(dir.path()).unwrap_err();
        let created = ImageExtractor::output_path(dir.path(), "system").exists();
        (error, created)
    }

    #[test]
    fn zero_extents_are_refused() {
        let (mut metadata, image) = sample();
        metadata.extents[0].target_type = TargetType::Zero;
        let (error, created) = extract_failure(metadata, image);
        assert!(matches!(error, Error::ExtractError(ExtractError::UnsupportedTargetType {
            target_type: TargetType::Zero, .. })));
        assert!(! created);
    }

    #[test]
    fn split_super_devices_are_refused() {
        let (mut metadata, image) = sample();
        metadata.extents[0].target_source = 1;
        let (error, created) = extract_failure(metadata, image);
        assert!(matches!(error,
            Error::ExtractError(ExtractError::SplitSuperDevice { index: 1, .. })));
        assert!(! created);
    }

    #[test]
    fn unaddressable_extents_are_refused() {
        let (mut metadata, image) = sample();
        metadata.extents[0].target_data = u64::MAX / 256;
        let (error, created) = extract_failure(metadata, image);
        assert!(matches!(error, Error::ExtractError(ExtractError::ExtentOutOfRange { .. })));
        assert!(! created);
        let (mut metadata, image) = sample();
        metadata.extents[0].num_sectors = u64::MAX / 2;
        let (error, created) = extract_failure(metadata, image);
        assert!(matches!(error, Error::ExtractError(ExtractError::ExtentOutOfRange { .. })));
        assert!(! created);
    }

    #[test]
    fn extracts_into_output_dir() {
        let (metadata, mut image) = sample();
        let start = metadata.extents[0].target_data * SECTOR_SIZE;
        image.seek(SeekFrom::Start(start)).unwrap();
        image.write_all(&[0x42; 4096]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut extractor = ImageExtractor::new(image, metadata, &[]).unwrap();
        extractor.extract(dir.path()).unwrap();
        let data = std::fs::read(ImageExtractor::output_path(dir.path(), "system")).unwrap();
        assert_eq!(data.len(), 65536);
        assert!(data[..4096].iter().all(|byte|*byte == 0x42));
        assert!(data[4096..].iter().all(|byte|*byte == 0));
    }

    #[test]
    fn holes_read_back_as_zero() {
        let file = tempfile::tempfile().unwrap();
        let mut writer = HoleWriter::new(file);
        writer.write_block(&[0; 4096]).unwrap();
        writer.write_block(&[7; 4096]).unwrap();
        writer.write_block(&[0; 4096]).unwrap();
        writer.write_block(&[0; 4096]).unwrap();
        let mut file = writer.finish().unwrap();
        assert_eq!(file.metadata().unwrap().len(), 16384);
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut data).unwrap();
        assert!(data[..4096].iter().all(|byte|*byte == 0));
        assert!(data[4096..8192].iter().all(|byte|*byte == 7));
        assert!(data[8192..].iter().all(|byte|*byte == 0));
    }

    #[test]
    fn all_zero_input_still_has_full_length() {
        let file = tempfile::tempfile().unwrap();
        let mut writer = HoleWriter::new(file);
        for _ in 0..4 {
            writer.write_block(&[0; 512]).unwrap();
        }
        let file = writer.finish().unwrap();
        assert_eq!(file.metadata().unwrap().len(), 2048);
    }
}
