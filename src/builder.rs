/*
lptools, to make, dump and unpack Android logical partition images: metadata builder module
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

//! Mutable model of the super partition.
//!
//! Every block device owns a sorted free list of sector intervals, which is
//! the only resource the allocator hands out. Growing a partition plans the
//! whole allocation against a copy of the free lists and commits only when
//! the request is fully satisfied, so a failed resize never changes the
//! builder.

use tracing::{debug, warn};

use crate::{
    format::{
        Geometry, Header, Metadata, MetadataBlockDevice, MetadataExtent,
        MetadataGroup, MetadataPartition, TargetType,
        BLOCK_DEVICE_SLOT_SUFFIXED, DEFAULT_GROUP_NAME, GROUP_SLOT_SUFFIXED,
        HEADER_FLAG_VIRTUAL_AB_DEVICE, METADATA_VERSION_FOR_EXPANDED_HEADER,
        METADATA_VERSION_FOR_UPDATED_ATTR, NAME_LENGTH, PARTITION_ATTRIBUTE_MASK,
        PARTITION_ATTRIBUTE_MASK_V1, PARTITION_ATTR_SLOT_SUFFIXED, SECTOR_SIZE,
    },
    utility::{align_to, align_to_offset, total_metadata_size},
    Result,
};

/// Smallest metadata area that still fits the expanded header
const MIN_METADATA_SIZE: u32 = 256;

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("metadata size {size} is too small")]
    MetadataTooSmall {
        size: u32
    },
    #[error("at least one metadata slot is required")]
    NoMetadataSlots,
    #[error("at least one block device is required")]
    NoBlockDevices,
    #[error("logical block size {size} is not a multiple of the sector size")]
    InvalidLogicalBlockSize {
        size: u32
    },
    #[error("block device '{name}' has a different logical block size {size}")]
    MismatchedLogicalBlockSize {
        name: String,
        size: u32,
    },
    #[error("block device '{name}' size {size} is not a multiple of the logical block size {block_size}")]
    UnalignedDeviceSize {
        name: String,
        size: u64,
        block_size: u32,
    },
    #[error("block device '{name}' alignment or alignment offset is not sector-aligned")]
    UnalignedAlignment {
        name: String
    },
    #[error("block device '{name}' is listed twice")]
    DuplicateBlockDevice {
        name: String
    },
    #[error("super device '{name}' is not among the block devices")]
    SuperDeviceNotFound {
        name: String
    },
    #[error("block device '{name}' of {size} bytes cannot hold {needed} bytes of metadata")]
    DeviceTooSmall {
        name: String,
        size: u64,
        needed: u64,
    },
    #[error("name must not be empty")]
    EmptyName,
    #[error("name '{name}' is longer than {} bytes", NAME_LENGTH)]
    NameTooLong {
        name: String
    },
    #[error("group '{name}' already exists")]
    DuplicateGroup {
        name: String
    },
    #[error("partition '{name}' already exists")]
    DuplicatePartition {
        name: String
    },
    #[error("group '{name}' does not exist")]
    UnknownGroup {
        name: String
    },
    #[error("partition '{name}' does not exist")]
    UnknownPartition {
        name: String
    },
    #[error("partition handle is stale")]
    StalePartition,
    #[error("partition '{name}' has invalid attributes 0x{attributes:x}")]
    InvalidAttributes {
        name: String,
        attributes: u32,
    },
    #[error("group '{group}' would grow to {requested} bytes, over its maximum of {maximum_size}")]
    GroupQuotaExceeded {
        group: String,
        maximum_size: u64,
        requested: u64,
    },
    #[error("not enough space for partition '{partition}': need {needed} more bytes, {available} available")]
    NotEnoughSpace {
        partition: String,
        needed: u64,
        available: u64,
    },
    #[error("metadata of {size} bytes exceeds the maximum of {maximum_size}")]
    MetadataTooLarge {
        size: u64,
        maximum_size: u64,
    },
}

/// A block device the super partition may span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    pub partition_name: String,
    pub size: u64,
    pub alignment: u32,
    pub alignment_offset: u32,
    pub logical_block_size: u32,
}

impl BlockDeviceInfo {
    pub fn new<S: Into<String>>(
        partition_name: S, size: u64, alignment: u32, alignment_offset: u32,
        logical_block_size: u32
    ) -> Self {
        Self {
            partition_name: partition_name.into(),
            size,
            alignment,
            alignment_offset,
            logical_block_size,
        }
    }
}

/// Independent toggles that only change what gets exported
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuilderOptions {
    pub auto_slot_suffixing: bool,
    pub virtual_ab_device: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Linear {
        device_index: u32,
        physical_sector: u64,
        num_sectors: u64,
    },
    Zero {
        num_sectors: u64,
    },
}

impl Extent {
    pub fn num_sectors(&self) -> u64 {
        match self {
            Extent::Linear { num_sectors, .. } => *num_sectors,
            Extent::Zero { num_sectors } => *num_sectors,
        }
    }

    fn to_metadata(self) -> MetadataExtent {
        match self {
            Extent::Linear { device_index, physical_sector, num_sectors } =>
                MetadataExtent {
                    num_sectors,
                    target_type: TargetType::Linear,
                    target_data: physical_sector,
                    target_source: device_index,
                },
            Extent::Zero { num_sectors } =>
                MetadataExtent {
                    num_sectors,
                    target_type: TargetType::Zero,
                    target_data: 0,
                    target_source: 0,
                },
        }
    }

    fn from_metadata(extent: &MetadataExtent) -> Self {
        match extent.target_type {
            TargetType::Linear => Extent::Linear {
                device_index: extent.target_source,
                physical_sector: extent.target_data,
                num_sectors: extent.num_sectors,
            },
            TargetType::Zero => Extent::Zero { num_sectors: extent.num_sectors },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    name: String,
    group_name: String,
    attributes: u32,
    extents: Vec<Extent>,
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn attributes(&self) -> u32 {
        self.attributes
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn size(&self) -> u64 {
        self.extents.iter().map(|extent|extent.num_sectors()).sum::<u64>() * SECTOR_SIZE
    }

    fn append_linear(&mut self, device_index: u32, start: u64, sectors: u64) {
        if let Some(Extent::Linear {
            device_index: last_device, physical_sector, num_sectors
        }) = self.extents.last_mut() {
            if *last_device == device_index && *physical_sector + *num_sectors == start {
                *num_sectors += sectors;
                return
            }
        }
        self.extents.push(Extent::Linear {
            device_index, physical_sector: start, num_sectors: sectors })
    }

    /// Devices holding this partition, most recently extended first
    fn devices_used(&self) -> Vec<usize> {
        let mut devices = Vec::new();
        for extent in self.extents.iter().rev() {
            if let Extent::Linear { device_index, .. } = extent {
                let device_index = *device_index as usize;
                if ! devices.contains(&device_index) {
                    devices.push(device_index)
                }
            }
        }
        devices
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionGroup {
    name: String,
    maximum_size: u64,
}

impl PartitionGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 0 means unlimited
    pub fn maximum_size(&self) -> u64 {
        self.maximum_size
    }
}

/// Handle of a partition inside one builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionId(usize);

/// Free sector range `[start, end)` on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    fn sectors(&self) -> u64 {
        self.end - self.start
    }
}

type FreeList = Vec<Interval>;

/// A run of sectors picked for a partition but not yet committed
#[derive(Debug, Clone, Copy)]
struct Piece {
    device_index: usize,
    start: u64,
    num_sectors: u64,
}

/// Remove `[start, start + sectors)` from the free interval at `pos`
fn take_from(list: &mut FreeList, pos: usize, start: u64, sectors: u64) {
    let interval = list.remove(pos);
    let tail = Interval { start: start + sectors, end: interval.end };
    if tail.sectors() > 0 {
        list.insert(pos, tail)
    }
    let head = Interval { start: interval.start, end: start };
    if head.sectors() > 0 {
        list.insert(pos, head)
    }
}

/// Put a range back, merging it with adjacent free ranges
fn release(list: &mut FreeList, mut interval: Interval) {
    let pos = list.partition_point(|free|free.start < interval.start);
    if pos < list.len() && list[pos].start == interval.end {
        interval.end = list.remove(pos).end;
    }
    if pos > 0 && list[pos - 1].end == interval.start {
        list[pos - 1].end = interval.end;
    } else {
        list.insert(pos, interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBuilder {
    geometry: Geometry,
    options: BuilderOptions,
    block_devices: Vec<MetadataBlockDevice>,
    groups: Vec<PartitionGroup>,
    partitions: Vec<Option<Partition>>,
    free_lists: Vec<FreeList>,
}

impl MetadataBuilder {
    /// Lay out the metadata area on `super_name` and mark the rest of every
    /// device free. The super device always ends up at index 0.
    pub fn new(
        block_devices: &[BlockDeviceInfo], super_name: &str,
        metadata_max_size: u32, metadata_slot_count: u32
    ) -> Result<Self> {
        if metadata_max_size < MIN_METADATA_SIZE {
            return Err(BuilderError::MetadataTooSmall { size: metadata_max_size }.into())
        }
        if metadata_slot_count == 0 {
            return Err(BuilderError::NoMetadataSlots.into())
        }
        let metadata_max_size = match align_to(metadata_max_size as u64, SECTOR_SIZE)
            .and_then(|size|u32::try_from(size).ok())
        {
            Some(size) => size,
            None => return Err(BuilderError::MetadataTooLarge {
                size: metadata_max_size as u64, maximum_size: u32::MAX as u64 }.into()),
        };
        let logical_block_size = match block_devices.first() {
            Some(device) => device.logical_block_size,
            None => return Err(BuilderError::NoBlockDevices.into()),
        };
        if logical_block_size == 0 || logical_block_size as u64 % SECTOR_SIZE != 0 {
            return Err(BuilderError::InvalidLogicalBlockSize {
                size: logical_block_size }.into())
        }
        for (id, device) in block_devices.iter().enumerate() {
            if device.partition_name.is_empty() {
                return Err(BuilderError::EmptyName.into())
            }
            if block_devices[..id].iter().any(
                |other|other.partition_name == device.partition_name)
            {
                return Err(BuilderError::DuplicateBlockDevice {
                    name: device.partition_name.clone() }.into())
            }
            if device.logical_block_size != logical_block_size {
                return Err(BuilderError::MismatchedLogicalBlockSize {
                    name: device.partition_name.clone(),
                    size: device.logical_block_size
                }.into())
            }
            if device.size % logical_block_size as u64 != 0 {
                return Err(BuilderError::UnalignedDeviceSize {
                    name: device.partition_name.clone(),
                    size: device.size,
                    block_size: logical_block_size
                }.into())
            }
            if device.alignment as u64 % SECTOR_SIZE != 0 ||
                device.alignment_offset as u64 % SECTOR_SIZE != 0
            {
                return Err(BuilderError::UnalignedAlignment {
                    name: device.partition_name.clone() }.into())
            }
        }
        let super_id = match block_devices.iter().position(
            |device|device.partition_name == super_name)
        {
            Some(id) => id,
            None => return Err(BuilderError::SuperDeviceNotFound {
                name: super_name.into() }.into()),
        };
        let ordered = std::iter::once(&block_devices[super_id]).chain(
            block_devices.iter().enumerate()
                .filter(|(id, _)|*id != super_id)
                .map(|(_, device)|device));
        let reserved = total_metadata_size(metadata_max_size, metadata_slot_count);
        let mut devices = Vec::with_capacity(block_devices.len());
        let mut free_lists = Vec::with_capacity(block_devices.len());
        for (id, info) in ordered.enumerate() {
            let first_logical_sector = if id == 0 {
                let free_start =
                    if info.alignment != 0 || info.alignment_offset != 0 {
                        align_to_offset(reserved,
                            info.alignment as u64, info.alignment_offset as u64)
                    } else {
                        align_to(reserved, logical_block_size as u64)
                    };
                let free_start = match free_start {
                    Some(free_start) if free_start < info.size => free_start,
                    _ => return Err(BuilderError::DeviceTooSmall {
                        name: info.partition_name.clone(),
                        size: info.size,
                        needed: free_start.unwrap_or(u64::MAX)
                    }.into()),
                };
                free_start / SECTOR_SIZE
            } else {
                0
            };
            let last_sector = info.size / SECTOR_SIZE;
            debug!("Block device '{}': sectors {}..{} usable", info.partition_name,
                first_logical_sector, last_sector);
            free_lists.push(if first_logical_sector < last_sector {
                vec![Interval { start: first_logical_sector, end: last_sector }]
            } else {
                Vec::new()
            });
            devices.push(MetadataBlockDevice {
                first_logical_sector,
                alignment: info.alignment,
                alignment_offset: info.alignment_offset,
                size: info.size,
                partition_name: info.partition_name.clone(),
                flags: 0,
            });
        }
        Ok(Self {
            geometry: Geometry {
                metadata_max_size,
                metadata_slot_count,
                logical_block_size,
            },
            options: BuilderOptions::default(),
            block_devices: devices,
            groups: vec![PartitionGroup {
                name: DEFAULT_GROUP_NAME.into(), maximum_size: 0 }],
            partitions: Vec::new(),
            free_lists,
        })
    }

    /// Single unaligned device named "super" with 4096-byte blocks
    pub fn with_device_size(
        device_size: u64, metadata_max_size: u32, metadata_slot_count: u32
    ) -> Result<Self> {
        let device = BlockDeviceInfo::new(
            crate::format::DEFAULT_PARTITION_NAME, device_size, 0, 0, 4096);
        Self::new(&[device], crate::format::DEFAULT_PARTITION_NAME,
            metadata_max_size, metadata_slot_count)
    }

    /// Rebuild a mutable model from decoded metadata
    pub fn from_metadata(metadata: &Metadata) -> Result<Self> {
        metadata.validate()?;
        let options = BuilderOptions {
            auto_slot_suffixing: metadata.block_devices.iter().any(
                |device|device.flags & BLOCK_DEVICE_SLOT_SUFFIXED != 0),
            virtual_ab_device:
                metadata.header.flags & HEADER_FLAG_VIRTUAL_AB_DEVICE != 0,
        };
        let block_devices: Vec<MetadataBlockDevice> = metadata.block_devices.iter()
            .map(|device|MetadataBlockDevice {
                flags: device.flags & !BLOCK_DEVICE_SLOT_SUFFIXED, ..device.clone() })
            .collect();
        let groups: Vec<PartitionGroup> = metadata.groups.iter()
            .map(|group|PartitionGroup {
                name: group.name.clone(), maximum_size: group.maximum_size })
            .collect();
        let mut used: Vec<Vec<Interval>> = vec![Vec::new(); block_devices.len()];
        let mut partitions = Vec::with_capacity(metadata.partitions.len());
        for partition in metadata.partitions.iter() {
            let extents: Vec<Extent> = metadata.extents_of(partition).iter()
                .map(Extent::from_metadata).collect();
            for extent in extents.iter() {
                if let Extent::Linear { device_index, physical_sector, num_sectors } = extent {
                    if let Some(list) = used.get_mut(*device_index as usize) {
                        list.push(Interval {
                            start: *physical_sector, end: physical_sector + num_sectors })
                    }
                }
            }
            partitions.push(Some(Partition {
                name: partition.name.clone(),
                group_name: metadata.group_name(partition).into(),
                attributes: partition.attributes & !PARTITION_ATTR_SLOT_SUFFIXED,
                extents,
            }));
        }
        let free_lists = block_devices.iter().zip(used.iter_mut())
            .map(|(device, used)| {
                used.sort_by_key(|interval|interval.start);
                let mut free = Vec::new();
                let mut cursor = device.first_logical_sector;
                for interval in used.iter() {
                    if interval.start > cursor {
                        free.push(Interval { start: cursor, end: interval.start })
                    }
                    cursor = cursor.max(interval.end);
                }
                let last_sector = device.size / SECTOR_SIZE;
                if cursor < last_sector {
                    free.push(Interval { start: cursor, end: last_sector })
                }
                free
            })
            .collect();
        Ok(Self {
            geometry: metadata.geometry,
            options,
            block_devices,
            groups,
            partitions,
            free_lists,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn set_auto_slot_suffixing(&mut self) {
        self.options.auto_slot_suffixing = true
    }

    pub fn set_virtual_ab_device_flag(&mut self) {
        self.options.virtual_ab_device = true
    }

    pub fn add_group(&mut self, name: &str, maximum_size: u64) -> Result<()> {
        if name.is_empty() {
            return Err(BuilderError::EmptyName.into())
        }
        if self.find_group(name).is_some() {
            return Err(BuilderError::DuplicateGroup { name: name.into() }.into())
        }
        self.groups.push(PartitionGroup { name: name.into(), maximum_size });
        Ok(())
    }

    pub fn find_group(&self, name: &str) -> Option<&PartitionGroup> {
        self.groups.iter().find(|group|group.name == name)
    }

    pub fn list_groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|group|group.name.as_str())
    }

    /// Add an empty partition to an existing group
    pub fn add_partition(&mut self, name: &str, group_name: &str, attributes: u32)
        -> Result<PartitionId>
    {
        if name.is_empty() {
            return Err(BuilderError::EmptyName.into())
        }
        if self.find_partition(name).is_some() {
            return Err(BuilderError::DuplicatePartition { name: name.into() }.into())
        }
        if self.find_group(group_name).is_none() {
            return Err(BuilderError::UnknownGroup { name: group_name.into() }.into())
        }
        if attributes & !PARTITION_ATTRIBUTE_MASK != 0 {
            return Err(BuilderError::InvalidAttributes {
                name: name.into(), attributes }.into())
        }
        self.partitions.push(Some(Partition {
            name: name.into(),
            group_name: group_name.into(),
            attributes,
            extents: Vec::new(),
        }));
        Ok(PartitionId(self.partitions.len() - 1))
    }

    pub fn find_partition(&self, name: &str) -> Option<PartitionId> {
        self.partitions.iter().position(|partition|
            matches!(partition, Some(partition) if partition.name == name))
            .map(PartitionId)
    }

    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(id.0).and_then(Option::as_ref)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter().flatten()
    }

    pub fn partitions_in_group(&self, group_name: &str) -> Vec<&Partition> {
        self.partitions().filter(|partition|partition.group_name == group_name).collect()
    }

    /// Drop a partition and hand its extents back to the free lists
    pub fn remove_partition(&mut self, name: &str) -> Result<()> {
        let id = match self.find_partition(name) {
            Some(id) => id,
            None => return Err(BuilderError::UnknownPartition { name: name.into() }.into()),
        };
        self.shrink_partition(id, 0)?;
        self.partitions[id.0] = None;
        Ok(())
    }

    pub fn block_device_info(&self, name: &str) -> Option<BlockDeviceInfo> {
        self.block_devices.iter().find(|device|device.partition_name == name)
            .map(|device|BlockDeviceInfo {
                partition_name: device.partition_name.clone(),
                size: device.size,
                alignment: device.alignment,
                alignment_offset: device.alignment_offset,
                logical_block_size: self.geometry.logical_block_size,
            })
    }

    /// Bytes outside the metadata area on all devices
    pub fn allocatable_space(&self) -> u64 {
        self.block_devices.iter().map(|device|
            device.size - device.first_logical_sector * SECTOR_SIZE).sum()
    }

    pub fn used_space(&self) -> u64 {
        self.partitions().map(Partition::size).sum()
    }

    fn group_size(&self, group_name: &str) -> u64 {
        self.partitions_in_group(group_name).iter().map(|partition|partition.size()).sum()
    }

    fn sectors_per_block(&self) -> u64 {
        self.geometry.logical_block_size as u64 / SECTOR_SIZE
    }

    fn align_sector(&self, device_index: usize, sector: u64) -> Option<u64> {
        let device = &self.block_devices[device_index];
        let alignment = device.alignment as u64 / SECTOR_SIZE;
        if alignment == 0 {
            return align_to(sector, self.sectors_per_block())
        }
        align_to_offset(sector, alignment, device.alignment_offset as u64 / SECTOR_SIZE)
    }

    /// Aligned start and whole-block length usable inside a free interval
    fn usable_region(&self, device_index: usize, interval: &Interval) -> Option<(u64, u64)> {
        let start = self.align_sector(device_index, interval.start)?;
        if start >= interval.end {
            return None
        }
        let sectors_per_block = self.sectors_per_block();
        let usable = (interval.end - start) / sectors_per_block * sectors_per_block;
        if usable == 0 {
            None
        } else {
            Some((start, usable))
        }
    }

    /// Devices used by the partition first, then the rest in table order
    fn device_preference(&self, partition: &Partition) -> Vec<usize> {
        let mut order = partition.devices_used();
        for device_index in 0..self.block_devices.len() {
            if ! order.contains(&device_index) {
                order.push(device_index)
            }
        }
        order
    }

    /// Resize to `requested_size` rounded up to the logical block size
    pub fn resize_partition(&mut self, id: PartitionId, requested_size: u64) -> Result<()> {
        let (name, old_size) = match self.partition(id) {
            Some(partition) => (&partition.name, partition.size()),
            None => return Err(BuilderError::StalePartition.into()),
        };
        let aligned_size = match align_to(requested_size,
            self.geometry.logical_block_size as u64)
        {
            Some(size) => size,
            None => {
                warn!("Partition '{}' cannot grow to {} bytes", name, requested_size);
                return Err(BuilderError::NotEnoughSpace {
                    partition: name.clone(),
                    needed: requested_size - old_size,
                    available: self.allocatable_space().saturating_sub(self.used_space()),
                }.into())
            },
        };
        if aligned_size > old_size {
            self.grow_partition(id, aligned_size)?
        } else if aligned_size < old_size {
            self.shrink_partition(id, aligned_size)?
        }
        Ok(())
    }

    fn grow_partition(&mut self, id: PartitionId, aligned_size: u64) -> Result<()> {
        let partition = self.partition(id).ok_or(BuilderError::StalePartition)?;
        let old_size = partition.size();
        if let Some(group) = self.find_group(&partition.group_name) {
            let requested = (self.group_size(&group.name) - old_size)
                .saturating_add(aligned_size);
            if group.maximum_size != 0 && requested > group.maximum_size {
                warn!("Partition '{}' would push group '{}' to {} bytes, over its \
                    maximum of {}", partition.name, group.name, requested,
                    group.maximum_size);
                return Err(BuilderError::GroupQuotaExceeded {
                    group: group.name.clone(),
                    maximum_size: group.maximum_size,
                    requested
                }.into())
            }
        }
        let (free_lists, pieces) =
            self.plan_growth(partition, (aligned_size - old_size) / SECTOR_SIZE)?;
        self.free_lists = free_lists;
        let partition = self.partitions[id.0].as_mut().ok_or(BuilderError::StalePartition)?;
        for piece in pieces {
            debug!("Partition '{}': {} sectors at {} on device {}", partition.name,
                piece.num_sectors, piece.start, piece.device_index);
            partition.append_linear(piece.device_index as u32, piece.start, piece.num_sectors)
        }
        Ok(())
    }

    /// Work out every piece of a growth against a copy of the free lists,
    /// nothing is committed here
    fn plan_growth(&self, partition: &Partition, sectors: u64)
        -> Result<(Vec<FreeList>, Vec<Piece>)>
    {
        let mut free_lists = self.free_lists.clone();
        let mut pieces = Vec::new();
        let mut remaining = sectors;
        let sectors_per_block = self.sectors_per_block();
        if let Some(Extent::Linear { device_index, physical_sector, num_sectors })
            = partition.extents.last()
        {
            let device_index = *device_index as usize;
            let end = physical_sector + num_sectors;
            if let Some(list) = free_lists.get_mut(device_index) {
                if let Some(pos) = list.iter().position(|free|free.start == end) {
                    let available = list[pos].sectors() / sectors_per_block * sectors_per_block;
                    let take = remaining.min(available);
                    if take > 0 {
                        take_from(list, pos, end, take);
                        pieces.push(Piece { device_index, start: end, num_sectors: take });
                        remaining -= take;
                    }
                }
            }
        }
        let order = self.device_preference(partition);
        while remaining > 0 {
            let mut chosen = None;
            // Best fit: the smallest region that takes the rest in one go
            for &device_index in order.iter() {
                let best = free_lists[device_index].iter().enumerate()
                    .filter_map(|(pos, free)|
                        self.usable_region(device_index, free)
                            .map(|(start, usable)|(pos, start, usable)))
                    .filter(|(_, _, usable)|*usable >= remaining)
                    .min_by_key(|(_, _, usable)|*usable);
                if let Some((pos, start, _)) = best {
                    chosen = Some((device_index, pos, start, remaining));
                    break
                }
            }
            // Otherwise eat the largest region on the most preferred device
            if chosen.is_none() {
                for &device_index in order.iter() {
                    let largest = free_lists[device_index].iter().enumerate()
                        .filter_map(|(pos, free)|
                            self.usable_region(device_index, free)
                                .map(|(start, usable)|(pos, start, usable)))
                        .max_by_key(|(_, _, usable)|*usable);
                    if let Some((pos, start, usable)) = largest {
                        chosen = Some((device_index, pos, start, usable));
                        break
                    }
                }
            }
            let (device_index, pos, start, take) = match chosen {
                Some(chosen) => chosen,
                None => {
                    let available = self.free_lists.iter().enumerate()
                        .flat_map(|(device_index, list)|list.iter().filter_map(
                            move |free|self.usable_region(device_index, free)))
                        .map(|(_, usable)|usable)
                        .sum::<u64>();
                    warn!("Not enough space for partition '{}': {} sectors short",
                        partition.name, remaining);
                    return Err(BuilderError::NotEnoughSpace {
                        partition: partition.name.clone(),
                        needed: sectors * SECTOR_SIZE,
                        available: available * SECTOR_SIZE,
                    }.into())
                }
            };
            take_from(&mut free_lists[device_index], pos, start, take);
            pieces.push(Piece { device_index, start, num_sectors: take });
            remaining -= take;
        }
        Ok((free_lists, pieces))
    }

    /// Trim trailing extents until `aligned_size` is left
    fn shrink_partition(&mut self, id: PartitionId, aligned_size: u64) -> Result<()> {
        let partition = self.partitions.get_mut(id.0).and_then(Option::as_mut)
            .ok_or(BuilderError::StalePartition)?;
        let mut sectors_to_keep = aligned_size / SECTOR_SIZE;
        let mut kept = Vec::new();
        let mut freed = Vec::new();
        for extent in partition.extents.drain(..) {
            let num_sectors = extent.num_sectors();
            if sectors_to_keep >= num_sectors {
                sectors_to_keep -= num_sectors;
                kept.push(extent);
                continue
            }
            match extent {
                Extent::Linear { device_index, physical_sector, num_sectors } => {
                    if sectors_to_keep > 0 {
                        kept.push(Extent::Linear {
                            device_index, physical_sector, num_sectors: sectors_to_keep })
                    }
                    freed.push((device_index as usize, Interval {
                        start: physical_sector + sectors_to_keep,
                        end: physical_sector + num_sectors,
                    }))
                },
                Extent::Zero { .. } => if sectors_to_keep > 0 {
                    kept.push(Extent::Zero { num_sectors: sectors_to_keep })
                },
            }
            sectors_to_keep = 0;
        }
        partition.extents = kept;
        for (device_index, interval) in freed {
            if let Some(list) = self.free_lists.get_mut(device_index) {
                release(list, interval)
            }
        }
        Ok(())
    }

    /// Freeze the current state into a metadata snapshot
    pub fn export(&self) -> Result<Metadata> {
        let check_name = |name: &str| -> Result<()> {
            if name.len() > NAME_LENGTH {
                Err(BuilderError::NameTooLong { name: name.into() }.into())
            } else {
                Ok(())
            }
        };
        let auto_slot_suffixing = self.options.auto_slot_suffixing;
        let mut header = Header::default();
        if self.options.virtual_ab_device {
            header.flags |= HEADER_FLAG_VIRTUAL_AB_DEVICE;
        }
        let mut metadata = Metadata {
            geometry: self.geometry,
            ..Default::default()
        };
        for group in self.groups.iter() {
            check_name(&group.name)?;
            metadata.groups.push(MetadataGroup {
                name: group.name.clone(),
                flags: if auto_slot_suffixing && group.name != DEFAULT_GROUP_NAME {
                    GROUP_SLOT_SUFFIXED
                } else {
                    0
                },
                maximum_size: group.maximum_size,
            })
        }
        for partition in self.partitions() {
            check_name(&partition.name)?;
            let group_index = match self.groups.iter().position(
                |group|group.name == partition.group_name)
            {
                Some(index) => index as u32,
                None => return Err(BuilderError::UnknownGroup {
                    name: partition.group_name.clone() }.into()),
            };
            let mut attributes = partition.attributes;
            if auto_slot_suffixing {
                attributes |= PARTITION_ATTR_SLOT_SUFFIXED
            }
            if attributes & PARTITION_ATTRIBUTE_MASK_V1 != 0 {
                header.minor_version = header.minor_version.max(
                    METADATA_VERSION_FOR_UPDATED_ATTR)
            }
            metadata.partitions.push(MetadataPartition {
                name: partition.name.clone(),
                attributes,
                first_extent_index: metadata.extents.len() as u32,
                num_extents: partition.extents.len() as u32,
                group_index,
            });
            metadata.extents.extend(partition.extents.iter().map(|extent|extent.to_metadata()));
        }
        for device in self.block_devices.iter() {
            check_name(&device.partition_name)?;
            let mut device = device.clone();
            if auto_slot_suffixing {
                device.flags |= BLOCK_DEVICE_SLOT_SUFFIXED
            }
            metadata.block_devices.push(device)
        }
        if header.flags != 0 {
            header.minor_version = METADATA_VERSION_FOR_EXPANDED_HEADER
        }
        metadata.header = header;
        let size = metadata.encoded_size();
        if size > self.geometry.metadata_max_size as u64 {
            return Err(BuilderError::MetadataTooLarge {
                size, maximum_size: self.geometry.metadata_max_size as u64 }.into())
        }
        Ok(metadata)
    }
}
