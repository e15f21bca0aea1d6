/*
lptools, to make, dump and unpack Android logical partition images: metadata format module
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

//! On-disk layout of logical partition metadata: the geometry block, the
//! versioned header and the four record tables that follow it.
//!
//! Every integer is little-endian and every record is packed. Tables describe
//! their own entry size, so records written by a newer minor version are
//! accepted and their unknown trailing bytes skipped.

use std::fmt::Display;

use crate::{checksum::{Sha256sum, SIZE_SHA256SUM}, Error, Result};

/* These values are always the same for any images */

pub const SECTOR_SIZE: u64 = 512;
pub const PARTITION_RESERVED_BYTES: u64 = 4096;
pub const METADATA_GEOMETRY_SIZE: u64 = 4096;
pub const METADATA_GEOMETRY_MAGIC: u32 = 0x616c4467;
pub const METADATA_HEADER_MAGIC: u32 = 0x414c5030;
pub const METADATA_MAJOR_VERSION: u16 = 10;
pub const METADATA_MINOR_VERSION_MIN: u16 = 0;
pub const METADATA_MINOR_VERSION_MAX: u16 = 2;
pub const METADATA_VERSION_FOR_UPDATED_ATTR: u16 = 1;
pub const METADATA_VERSION_FOR_EXPANDED_HEADER: u16 = 2;
pub const DEFAULT_PARTITION_ALIGNMENT: u32 = 0x100000;
pub const DEFAULT_PARTITION_NAME: &str = "super";
pub const DEFAULT_GROUP_NAME: &str = "default";
pub const NAME_LENGTH: usize = 36;

pub const PARTITION_ATTR_NONE: u32 = 0;
pub const PARTITION_ATTR_READONLY: u32 = 1 << 0;
pub const PARTITION_ATTR_SLOT_SUFFIXED: u32 = 1 << 1;
pub const PARTITION_ATTR_UPDATED: u32 = 1 << 2;
pub const PARTITION_ATTR_DISABLED: u32 = 1 << 3;
pub const PARTITION_ATTRIBUTE_MASK_V0: u32 =
    PARTITION_ATTR_READONLY | PARTITION_ATTR_SLOT_SUFFIXED;
pub const PARTITION_ATTRIBUTE_MASK_V1: u32 =
    PARTITION_ATTR_UPDATED | PARTITION_ATTR_DISABLED;
pub const PARTITION_ATTRIBUTE_MASK: u32 =
    PARTITION_ATTRIBUTE_MASK_V0 | PARTITION_ATTRIBUTE_MASK_V1;

pub const GROUP_SLOT_SUFFIXED: u32 = 1 << 0;
pub const BLOCK_DEVICE_SLOT_SUFFIXED: u32 = 1 << 0;
pub const HEADER_FLAG_VIRTUAL_AB_DEVICE: u32 = 1 << 0;

const SIZE_RAW_GEOMETRY: usize = 52;
const SIZE_RAW_HEADER_V1_0: usize = 128;
const SIZE_RAW_HEADER_V1_2: usize = 256;

const OFFSET_GEOMETRY_CHECKSUM: usize = 8;
const OFFSET_HEADER_CHECKSUM: usize = 12;
const OFFSET_TABLES_SIZE: usize = 44;
const OFFSET_TABLES_CHECKSUM: usize = 48;
const OFFSET_DESCRIPTORS: usize = 80;
const OFFSET_HEADER_FLAGS: usize = 128;
const SIZE_RAW_DESCRIPTOR: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("geometry magic invalid: expected 0x{:08x}, found 0x{magic:08x}",
        METADATA_GEOMETRY_MAGIC)]
    InvalidGeometryMagic {
        magic: u32
    },
    #[error("geometry struct size {size} is not {}", SIZE_RAW_GEOMETRY)]
    InvalidGeometrySize {
        size: u32
    },
    #[error("geometry checksum mismatch: recorded {recorded}, calculated {calculated}")]
    GeometryChecksum {
        recorded: Sha256sum,
        calculated: Sha256sum,
    },
    #[error("geometry is invalid: {0}")]
    InvalidGeometry (&'static str),
    #[error("header magic invalid: expected 0x{:08x}, found 0x{magic:08x}",
        METADATA_HEADER_MAGIC)]
    InvalidHeaderMagic {
        magic: u32
    },
    #[error("incompatible metadata version {major}.{minor}")]
    IncompatibleVersion {
        major: u16,
        minor: u16,
    },
    #[error("header size {size} is invalid")]
    InvalidHeaderSize {
        size: u32
    },
    #[error("header checksum mismatch: recorded {recorded}, calculated {calculated}")]
    HeaderChecksum {
        recorded: Sha256sum,
        calculated: Sha256sum,
    },
    #[error("tables checksum mismatch: recorded {recorded}, calculated {calculated}")]
    TablesChecksum {
        recorded: Sha256sum,
        calculated: Sha256sum,
    },
    #[error("metadata needs {needed} bytes but only {available} are present")]
    Truncated {
        needed: u64,
        available: u64,
    },
    #[error("{table} table lies outside of the tables area")]
    TableOutOfBounds {
        table: &'static str
    },
    #[error("{table} table entry size {entry_size} is smaller than {expected}")]
    EntrySizeTooSmall {
        table: &'static str,
        entry_size: u32,
        expected: usize,
    },
    #[error("partition '{name}' has invalid attributes 0x{attributes:x}")]
    InvalidAttributes {
        name: String,
        attributes: u32,
    },
    #[error("partition '{name}' has extents out of range")]
    ExtentIndexOutOfRange {
        name: String
    },
    #[error("partition '{name}' has group index {index} out of range")]
    GroupIndexOutOfRange {
        name: String,
        index: u32,
    },
    #[error("extent has block device index {index} out of range")]
    BlockDeviceIndexOutOfRange {
        index: u32
    },
    #[error("extent {index} lies outside of its block device")]
    ExtentOutOfBounds {
        index: usize
    },
    #[error("partition '{name}' adds up to more than 2^64 bytes")]
    PartitionTooLarge {
        name: String
    },
    #[error("invalid extent target type {target_type}")]
    InvalidTargetType {
        target_type: u32
    },
    #[error("metadata has no block devices")]
    NoBlockDevices,
    #[error("super device first logical sector {sector} overlaps the metadata region")]
    InvalidFirstLogicalSector {
        sector: u64
    },
    #[error("metadata slot {slot} out of range, only {count} slots")]
    SlotOutOfRange {
        slot: u32,
        count: u32,
    },
}

fn le_u16(raw: &[u8], offset: usize) -> u16 {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(&raw[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

fn le_u32(raw: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&raw[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(raw: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&raw[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn string_from_name_field(slice: &[u8]) -> String {
    let field = &slice[..NAME_LENGTH];
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(NAME_LENGTH);
    String::from_utf8_lossy(&field[..end]).into()
}

fn put_name_field(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; NAME_LENGTH];
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_LENGTH);
    field[..len].copy_from_slice(&bytes[..len]);
    out.extend_from_slice(&field)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Linear,
    Zero,
}

type RawTargetType = u32;

impl TryFrom<RawTargetType> for TargetType {
    type Error = Error;

    fn try_from(value: RawTargetType) -> Result<Self> {
        match value {
            0 => Ok(Self::Linear),
            1 => Ok(Self::Zero),
            _ => Err(FormatError::InvalidTargetType { target_type: value }.into()),
        }
    }
}

impl From<TargetType> for RawTargetType {
    fn from(value: TargetType) -> Self {
        match value {
            TargetType::Linear => 0,
            TargetType::Zero => 1,
        }
    }
}

impl Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}",
            match self {
                TargetType::Linear => "linear",
                TargetType::Zero => "zero",
            }
        )
    }
}

/// Sizing of the metadata area, fixed when the super device is created
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub metadata_max_size: u32,
    pub metadata_slot_count: u32,
    pub logical_block_size: u32,
}

impl Geometry {
    /// The geometry block padded to its reserved on-disk size
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_GEOMETRY_SIZE as usize);
        out.extend_from_slice(&METADATA_GEOMETRY_MAGIC.to_le_bytes());
        out.extend_from_slice(&(SIZE_RAW_GEOMETRY as u32).to_le_bytes());
        out.extend_from_slice(&[0; SIZE_SHA256SUM]);
        out.extend_from_slice(&self.metadata_max_size.to_le_bytes());
        out.extend_from_slice(&self.metadata_slot_count.to_le_bytes());
        out.extend_from_slice(&self.logical_block_size.to_le_bytes());
        let checksum = Sha256sum::from_data(&out);
        out[OFFSET_GEOMETRY_CHECKSUM..OFFSET_GEOMETRY_CHECKSUM + SIZE_SHA256SUM]
            .copy_from_slice(checksum.as_bytes());
        out.resize(METADATA_GEOMETRY_SIZE as usize, 0);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < SIZE_RAW_GEOMETRY {
            return Err(FormatError::Truncated {
                needed: SIZE_RAW_GEOMETRY as u64, available: raw.len() as u64 }.into())
        }
        let magic = le_u32(raw, 0);
        if magic != METADATA_GEOMETRY_MAGIC {
            return Err(FormatError::InvalidGeometryMagic { magic }.into())
        }
        let struct_size = le_u32(raw, 4);
        if struct_size as usize != SIZE_RAW_GEOMETRY {
            return Err(FormatError::InvalidGeometrySize { size: struct_size }.into())
        }
        let raw = &raw[..SIZE_RAW_GEOMETRY];
        let recorded = Sha256sum::from_slice(&raw[OFFSET_GEOMETRY_CHECKSUM..]);
        let calculated = Sha256sum::from_data_with_hole(raw, OFFSET_GEOMETRY_CHECKSUM);
        if recorded != calculated {
            return Err(FormatError::GeometryChecksum { recorded, calculated }.into())
        }
        let geometry = Self {
            metadata_max_size: le_u32(raw, 40),
            metadata_slot_count: le_u32(raw, 44),
            logical_block_size: le_u32(raw, 48),
        };
        if geometry.metadata_max_size as u64 % SECTOR_SIZE != 0 {
            return Err(FormatError::InvalidGeometry(
                "metadata max size is not sector-aligned").into())
        }
        if geometry.metadata_slot_count == 0 {
            return Err(FormatError::InvalidGeometry("no metadata slots").into())
        }
        if geometry.logical_block_size == 0 ||
            geometry.logical_block_size as u64 % SECTOR_SIZE != 0
        {
            return Err(FormatError::InvalidGeometry(
                "logical block size is not sector-aligned").into())
        }
        Ok(geometry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    pub flags: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            major_version: METADATA_MAJOR_VERSION,
            minor_version: METADATA_MINOR_VERSION_MIN,
            flags: 0,
        }
    }
}

impl Header {
    pub fn header_size(&self) -> u32 {
        if self.minor_version >= METADATA_VERSION_FOR_EXPANDED_HEADER {
            SIZE_RAW_HEADER_V1_2 as u32
        } else {
            SIZE_RAW_HEADER_V1_0 as u32
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPartition {
    pub name: String,
    pub attributes: u32,
    pub first_extent_index: u32,
    pub num_extents: u32,
    pub group_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataExtent {
    pub num_sectors: u64,
    pub target_type: TargetType,
    /// First sector on the source device, meaningless for zero extents
    pub target_data: u64,
    pub target_source: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataGroup {
    pub name: String,
    pub flags: u32,
    /// 0 means unlimited
    pub maximum_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBlockDevice {
    pub first_logical_sector: u64,
    pub alignment: u32,
    pub alignment_offset: u32,
    pub size: u64,
    pub partition_name: String,
    pub flags: u32,
}

trait TableRecord: Sized {
    const TABLE: &'static str;
    const SIZE: usize;

    fn write_to(&self, out: &mut Vec<u8>);
    fn read_from(raw: &[u8]) -> Result<Self>;
}

impl TableRecord for MetadataPartition {
    const TABLE: &'static str = "partition";
    const SIZE: usize = 52;

    fn write_to(&self, out: &mut Vec<u8>) {
        put_name_field(out, &self.name);
        out.extend_from_slice(&self.attributes.to_le_bytes());
        out.extend_from_slice(&self.first_extent_index.to_le_bytes());
        out.extend_from_slice(&self.num_extents.to_le_bytes());
        out.extend_from_slice(&self.group_index.to_le_bytes());
    }

    fn read_from(raw: &[u8]) -> Result<Self> {
        Ok(Self {
            name: string_from_name_field(raw),
            attributes: le_u32(raw, 36),
            first_extent_index: le_u32(raw, 40),
            num_extents: le_u32(raw, 44),
            group_index: le_u32(raw, 48),
        })
    }
}

impl TableRecord for MetadataExtent {
    const TABLE: &'static str = "extent";
    const SIZE: usize = 24;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.num_sectors.to_le_bytes());
        out.extend_from_slice(&RawTargetType::from(self.target_type).to_le_bytes());
        out.extend_from_slice(&self.target_data.to_le_bytes());
        out.extend_from_slice(&self.target_source.to_le_bytes());
    }

    fn read_from(raw: &[u8]) -> Result<Self> {
        Ok(Self {
            num_sectors: le_u64(raw, 0),
            target_type: le_u32(raw, 8).try_into()?,
            target_data: le_u64(raw, 12),
            target_source: le_u32(raw, 20),
        })
    }
}

impl TableRecord for MetadataGroup {
    const TABLE: &'static str = "group";
    const SIZE: usize = 48;

    fn write_to(&self, out: &mut Vec<u8>) {
        put_name_field(out, &self.name);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.maximum_size.to_le_bytes());
    }

    fn read_from(raw: &[u8]) -> Result<Self> {
        Ok(Self {
            name: string_from_name_field(raw),
            flags: le_u32(raw, 36),
            maximum_size: le_u64(raw, 40),
        })
    }
}

impl TableRecord for MetadataBlockDevice {
    const TABLE: &'static str = "block device";
    const SIZE: usize = 64;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.first_logical_sector.to_le_bytes());
        out.extend_from_slice(&self.alignment.to_le_bytes());
        out.extend_from_slice(&self.alignment_offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        put_name_field(out, &self.partition_name);
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    fn read_from(raw: &[u8]) -> Result<Self> {
        Ok(Self {
            first_logical_sector: le_u64(raw, 0),
            alignment: le_u32(raw, 8),
            alignment_offset: le_u32(raw, 12),
            size: le_u64(raw, 16),
            partition_name: string_from_name_field(&raw[24..]),
            flags: le_u32(raw, 60),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TableDescriptor {
    offset: u32,
    num_entries: u32,
    entry_size: u32,
}

impl TableDescriptor {
    fn read_from(raw: &[u8]) -> Self {
        Self {
            offset: le_u32(raw, 0),
            num_entries: le_u32(raw, 4),
            entry_size: le_u32(raw, 8),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.num_entries.to_le_bytes());
        out.extend_from_slice(&self.entry_size.to_le_bytes());
    }
}

fn write_table<R: TableRecord>(tables: &mut Vec<u8>, records: &[R]) -> TableDescriptor {
    let descriptor = TableDescriptor {
        offset: tables.len() as u32,
        num_entries: records.len() as u32,
        entry_size: R::SIZE as u32,
    };
    for record in records.iter() {
        record.write_to(tables)
    }
    descriptor
}

fn read_table<R: TableRecord>(tables: &[u8], descriptor: &TableDescriptor)
    -> Result<Vec<R>>
{
    if (descriptor.entry_size as usize) < R::SIZE {
        return Err(FormatError::EntrySizeTooSmall {
            table: R::TABLE,
            entry_size: descriptor.entry_size,
            expected: R::SIZE
        }.into())
    }
    let end = descriptor.num_entries as u64 * descriptor.entry_size as u64 +
        descriptor.offset as u64;
    if end > tables.len() as u64 {
        return Err(FormatError::TableOutOfBounds { table: R::TABLE }.into())
    }
    let mut records = Vec::with_capacity(descriptor.num_entries as usize);
    let table = &tables[descriptor.offset as usize..end as usize];
    // Entries may be longer than we know of, the tail is ignored
    for raw in table.chunks_exact(descriptor.entry_size as usize) {
        records.push(R::read_from(&raw[..R::SIZE])?)
    }
    Ok(records)
}

/// One complete, read-only copy of the partition metadata
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub geometry: Geometry,
    pub header: Header,
    pub partitions: Vec<MetadataPartition>,
    pub extents: Vec<MetadataExtent>,
    pub groups: Vec<MetadataGroup>,
    pub block_devices: Vec<MetadataBlockDevice>,
}

impl Metadata {
    /// Serialize the header and tables, as stored in every metadata slot
    pub fn encode(&self) -> Vec<u8> {
        let mut tables = Vec::new();
        let descriptors = [
            write_table(&mut tables, &self.partitions),
            write_table(&mut tables, &self.extents),
            write_table(&mut tables, &self.groups),
            write_table(&mut tables, &self.block_devices),
        ];
        let header_size = self.header.header_size() as usize;
        let mut out = Vec::with_capacity(header_size + tables.len());
        out.extend_from_slice(&METADATA_HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.header.major_version.to_le_bytes());
        out.extend_from_slice(&self.header.minor_version.to_le_bytes());
        out.extend_from_slice(&(header_size as u32).to_le_bytes());
        out.extend_from_slice(&[0; SIZE_SHA256SUM]);
        out.extend_from_slice(&(tables.len() as u32).to_le_bytes());
        out.extend_from_slice(Sha256sum::from_data(&tables).as_bytes());
        for descriptor in descriptors.iter() {
            descriptor.write_to(&mut out)
        }
        if header_size >= SIZE_RAW_HEADER_V1_2 {
            out.extend_from_slice(&self.header.flags.to_le_bytes());
        }
        out.resize(header_size, 0);
        let checksum = Sha256sum::from_data(&out);
        out[OFFSET_HEADER_CHECKSUM..OFFSET_HEADER_CHECKSUM + SIZE_SHA256SUM]
            .copy_from_slice(checksum.as_bytes());
        out.extend_from_slice(&tables);
        out
    }

    pub fn encoded_size(&self) -> u64 {
        self.header.header_size() as u64 +
            (self.partitions.len() * MetadataPartition::SIZE +
            self.extents.len() * MetadataExtent::SIZE +
            self.groups.len() * MetadataGroup::SIZE +
            self.block_devices.len() * MetadataBlockDevice::SIZE) as u64
    }

    /// Parse one metadata copy, `raw` may extend past the end of the tables.
    ///
    /// Any minor version under major 10 is accepted, including ones newer
    /// than this crate writes: the header size comes from the header itself
    /// and table entries may be longer than the records known here, with the
    /// extra bytes skipped. Attribute bits are still checked against the
    /// mask of the declared minor version.
    pub fn decode(geometry: &Geometry, raw: &[u8]) -> Result<Self> {
        if raw.len() < SIZE_RAW_HEADER_V1_0 {
            return Err(FormatError::Truncated {
                needed: SIZE_RAW_HEADER_V1_0 as u64, available: raw.len() as u64 }.into())
        }
        let magic = le_u32(raw, 0);
        if magic != METADATA_HEADER_MAGIC {
            return Err(FormatError::InvalidHeaderMagic { magic }.into())
        }
        let header = Header {
            major_version: le_u16(raw, 4),
            minor_version: le_u16(raw, 6),
            flags: 0,
        };
        if header.major_version != METADATA_MAJOR_VERSION {
            return Err(FormatError::IncompatibleVersion {
                major: header.major_version, minor: header.minor_version }.into())
        }
        let header_size = le_u32(raw, 8);
        if (header_size as usize) < SIZE_RAW_HEADER_V1_0 ||
            header_size > geometry.metadata_max_size
        {
            return Err(FormatError::InvalidHeaderSize { size: header_size }.into())
        }
        if header_size as usize > raw.len() {
            return Err(FormatError::Truncated {
                needed: header_size as u64, available: raw.len() as u64 }.into())
        }
        let raw_header = &raw[..header_size as usize];
        let recorded = Sha256sum::from_slice(&raw_header[OFFSET_HEADER_CHECKSUM..]);
        let calculated = Sha256sum::from_data_with_hole(raw_header, OFFSET_HEADER_CHECKSUM);
        if recorded != calculated {
            return Err(FormatError::HeaderChecksum { recorded, calculated }.into())
        }
        let header = Header {
            flags: if raw_header.len() >= OFFSET_HEADER_FLAGS + 4 {
                le_u32(raw_header, OFFSET_HEADER_FLAGS)
            } else {
                0
            },
            ..header
        };
        let tables_size = le_u32(raw_header, OFFSET_TABLES_SIZE) as u64;
        let needed = header_size as u64 + tables_size;
        if needed > geometry.metadata_max_size as u64 || needed > raw.len() as u64 {
            return Err(FormatError::Truncated {
                needed, available: raw.len().min(geometry.metadata_max_size as usize) as u64
            }.into())
        }
        let tables = &raw[header_size as usize..needed as usize];
        let recorded = Sha256sum::from_slice(&raw_header[OFFSET_TABLES_CHECKSUM..]);
        let calculated = Sha256sum::from_data(tables);
        if recorded != calculated {
            return Err(FormatError::TablesChecksum { recorded, calculated }.into())
        }
        let mut descriptors = [TableDescriptor::default(); 4];
        for (id, descriptor) in descriptors.iter_mut().enumerate() {
            *descriptor = TableDescriptor::read_from(
                &raw_header[OFFSET_DESCRIPTORS + id * SIZE_RAW_DESCRIPTOR..]);
        }
        let metadata = Self {
            geometry: *geometry,
            header,
            partitions: read_table(tables, &descriptors[0])?,
            extents: read_table(tables, &descriptors[1])?,
            groups: read_table(tables, &descriptors[2])?,
            block_devices: read_table(tables, &descriptors[3])?,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    /// Index, attribute and extent bound checks run on every decode
    pub fn validate(&self) -> Result<()> {
        let attribute_mask =
            if self.header.minor_version >= METADATA_VERSION_FOR_UPDATED_ATTR {
                PARTITION_ATTRIBUTE_MASK
            } else {
                PARTITION_ATTRIBUTE_MASK_V0
            };
        for partition in self.partitions.iter() {
            if partition.attributes & !attribute_mask != 0 {
                return Err(FormatError::InvalidAttributes {
                    name: partition.name.clone(),
                    attributes: partition.attributes
                }.into())
            }
            let end = partition.first_extent_index as u64 + partition.num_extents as u64;
            if end > self.extents.len() as u64 {
                return Err(FormatError::ExtentIndexOutOfRange {
                    name: partition.name.clone() }.into())
            }
            if partition.group_index as usize >= self.groups.len() {
                return Err(FormatError::GroupIndexOutOfRange {
                    name: partition.name.clone(),
                    index: partition.group_index
                }.into())
            }
        }
        for (index, extent) in self.extents.iter().enumerate() {
            let size = match extent.num_sectors.checked_mul(SECTOR_SIZE) {
                Some(size) => size,
                None => return Err(FormatError::ExtentOutOfBounds { index }.into()),
            };
            if extent.target_type != TargetType::Linear {
                continue
            }
            let device = match self.block_devices.get(extent.target_source as usize) {
                Some(device) => device,
                None => return Err(FormatError::BlockDeviceIndexOutOfRange {
                    index: extent.target_source }.into()),
            };
            let fits = extent.target_data.checked_mul(SECTOR_SIZE)
                .and_then(|start|start.checked_add(size))
                .is_some_and(|end|end <= device.size);
            if ! fits {
                return Err(FormatError::ExtentOutOfBounds { index }.into())
            }
        }
        for partition in self.partitions.iter() {
            let total = self.extents_of(partition).iter().try_fold(0u64,
                |total, extent|total.checked_add(extent.num_sectors * SECTOR_SIZE));
            if total.is_none() {
                return Err(FormatError::PartitionTooLarge {
                    name: partition.name.clone() }.into())
            }
        }
        let super_device = match self.block_devices.first() {
            Some(device) => device,
            None => return Err(FormatError::NoBlockDevices.into()),
        };
        let metadata_region = crate::utility::total_metadata_size(
            self.geometry.metadata_max_size, self.geometry.metadata_slot_count);
        let first_byte = super_device.first_logical_sector.checked_mul(SECTOR_SIZE);
        if first_byte.map_or(true, |first_byte|first_byte < metadata_region) {
            return Err(FormatError::InvalidFirstLogicalSector {
                sector: super_device.first_logical_sector }.into())
        }
        Ok(())
    }

    /// The extents of a partition from this same metadata
    pub fn extents_of(&self, partition: &MetadataPartition) -> &[MetadataExtent] {
        let start = partition.first_extent_index as usize;
        let end = start + partition.num_extents as usize;
        self.extents.get(start..end).unwrap_or_default()
    }

    /// Saturates for hand-built metadata, decoded metadata never overflows
    pub fn partition_size(&self, partition: &MetadataPartition) -> u64 {
        self.extents_of(partition).iter().fold(0, |total, extent|
            total.saturating_add(extent.num_sectors.saturating_mul(SECTOR_SIZE)))
    }

    pub fn group_name(&self, partition: &MetadataPartition) -> &str {
        self.groups.get(partition.group_index as usize)
            .map(|group|group.name.as_str())
            .unwrap_or_default()
    }

    pub fn block_device_name(&self, index: u32) -> &str {
        self.block_devices.get(index as usize)
            .map(|device|device.partition_name.as_str())
            .unwrap_or_default()
    }

    pub fn find_partition(&self, name: &str) -> Option<&MetadataPartition> {
        self.partitions.iter().find(|partition|partition.name == name)
    }

    pub fn super_device(&self) -> Option<&MetadataBlockDevice> {
        self.block_devices.first()
    }

    /// Bytes reserved for metadata at the start of the super device
    pub fn metadata_region_size(&self) -> u64 {
        self.super_device().map(
            |device|device.first_logical_sector * SECTOR_SIZE).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        Metadata {
            geometry: Geometry {
                metadata_max_size: 65536,
                metadata_slot_count: 2,
                logical_block_size: 4096,
            },
            header: Header::default(),
            partitions: vec![MetadataPartition {
                name: "system".into(),
                attributes: PARTITION_ATTR_READONLY,
                first_extent_index: 0,
                num_extents: 2,
                group_index: 0,
            }],
            extents: vec![
                MetadataExtent {
                    num_sectors: 2048,
                    target_type: TargetType::Linear,
                    target_data: 2048,
                    target_source: 0,
                },
                MetadataExtent {
                    num_sectors: 8,
                    target_type: TargetType::Zero,
                    target_data: 0,
                    target_source: 0,
                },
            ],
            groups: vec![MetadataGroup {
                name: "default".into(),
                flags: 0,
                maximum_size: 0,
            }],
            block_devices: vec![MetadataBlockDevice {
                first_logical_sector: 2048,
                alignment: DEFAULT_PARTITION_ALIGNMENT,
                alignment_offset: 0,
                size: 100 << 20,
                partition_name: "super".into(),
                flags: 0,
            }],
        }
    }

    #[test]
    fn geometry_survives_encoding() {
        let geometry = sample().geometry;
        let raw = geometry.encode();
        assert_eq!(raw.len(), METADATA_GEOMETRY_SIZE as usize);
        assert_eq!(Geometry::decode(&raw).unwrap(), geometry);
    }

    #[test]
    fn geometry_checksum_is_checked() {
        let mut raw = sample().geometry.encode();
        raw[44] ^= 1;
        assert!(matches!(Geometry::decode(&raw),
            Err(Error::FormatError(FormatError::GeometryChecksum { .. }))));
    }

    #[test]
    fn metadata_survives_encoding() {
        let metadata = sample();
        let raw = metadata.encode();
        assert_eq!(raw.len() as u64, metadata.encoded_size());
        assert_eq!(Metadata::decode(&metadata.geometry, &raw).unwrap(), metadata);
    }

    #[test]
    fn expanded_header_carries_flags() {
        let mut metadata = sample();
        metadata.header.minor_version = METADATA_VERSION_FOR_EXPANDED_HEADER;
        metadata.header.flags = HEADER_FLAG_VIRTUAL_AB_DEVICE;
        let raw = metadata.encode();
        assert_eq!(le_u32(&raw, 8), SIZE_RAW_HEADER_V1_2 as u32);
        let decoded = Metadata::decode(&metadata.geometry, &raw).unwrap();
        assert_eq!(decoded.header.flags, HEADER_FLAG_VIRTUAL_AB_DEVICE);
    }

    #[test]
    fn corrupted_tables_are_rejected() {
        let metadata = sample();
        let mut raw = metadata.encode();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        assert!(matches!(Metadata::decode(&metadata.geometry, &raw),
            Err(Error::FormatError(FormatError::TablesChecksum { .. }))));
    }

    #[test]
    fn bad_magic_and_major_are_rejected() {
        let metadata = sample();
        let mut raw = metadata.encode();
        raw[0] = 0;
        assert!(matches!(Metadata::decode(&metadata.geometry, &raw),
            Err(Error::FormatError(FormatError::InvalidHeaderMagic { .. }))));
        let mut metadata = sample();
        metadata.header.major_version = 11;
        let raw = metadata.encode();
        assert!(matches!(Metadata::decode(&metadata.geometry, &raw),
            Err(Error::FormatError(FormatError::IncompatibleVersion { major: 11, .. }))));
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut metadata = sample();
        metadata.partitions[0].num_extents = 3;
        assert!(matches!(Metadata::decode(&metadata.geometry, &metadata.encode()),
            Err(Error::FormatError(FormatError::ExtentIndexOutOfRange { .. }))));
        let mut metadata = sample();
        metadata.partitions[0].group_index = 1;
        assert!(matches!(Metadata::decode(&metadata.geometry, &metadata.encode()),
            Err(Error::FormatError(FormatError::GroupIndexOutOfRange { .. }))));
        let mut metadata = sample();
        metadata.extents[0].target_source = 1;
        assert!(matches!(Metadata::decode(&metadata.geometry, &metadata.encode()),
            Err(Error::FormatError(FormatError::BlockDeviceIndexOutOfRange { .. }))));
    }

    #[test]
    fn extents_must_fit_their_device() {
        let mut metadata = sample();
        metadata.extents[0].num_sectors = u64::MAX / 2;
        assert!(matches!(Metadata::decode(&metadata.geometry, &metadata.encode()),
            Err(Error::FormatError(FormatError::ExtentOutOfBounds { index: 0 }))));
        let mut metadata = sample();
        metadata.extents[0].target_data = (100 << 20) / SECTOR_SIZE - 2047;
        assert!(matches!(Metadata::decode(&metadata.geometry, &metadata.encode()),
            Err(Error::FormatError(FormatError::ExtentOutOfBounds { index: 0 }))));
        metadata.extents[0].target_data -= 1;
        assert!(Metadata::decode(&metadata.geometry, &metadata.encode()).is_ok());
        let mut metadata = sample();
        metadata.extents[0].target_data = u64::MAX - 1024;
        assert!(matches!(Metadata::decode(&metadata.geometry, &metadata.encode()),
            Err(Error::FormatError(FormatError::ExtentOutOfBounds { index: 0 }))));
        let mut metadata = sample();
        metadata.extents[1].num_sectors = u64::MAX / SECTOR_SIZE;
        metadata.extents.push(metadata.extents[1]);
        metadata.partitions[0].num_extents = 3;
        assert!(matches!(Metadata::decode(&metadata.geometry, &metadata.encode()),
            Err(Error::FormatError(FormatError::PartitionTooLarge { .. }))));
        assert_eq!(metadata.partition_size(&metadata.partitions[0]), u64::MAX);
    }

    #[test]
    fn newer_minor_versions_are_read() {
        let mut metadata = sample();
        metadata.header.minor_version = 7;
        let decoded = Metadata::decode(&metadata.geometry, &metadata.encode()).unwrap();
        assert_eq!(decoded.header.minor_version, 7);
        assert_eq!(decoded.partitions, metadata.partitions);
    }

    #[test]
    fn updated_attribute_needs_minor_one() {
        let mut metadata = sample();
        metadata.partitions[0].attributes |= PARTITION_ATTR_UPDATED;
        assert!(Metadata::decode(&metadata.geometry, &metadata.encode()).is_err());
        metadata.header.minor_version = METADATA_VERSION_FOR_UPDATED_ATTR;
        assert!(Metadata::decode(&metadata.geometry, &metadata.encode()).is_ok());
    }

    #[test]
    fn longer_entries_are_accepted() {
        // Rewrite the extent table with 8 unknown trailing bytes per entry
        let metadata = sample();
        let mut tables = Vec::new();
        let partitions = write_table(&mut tables, &metadata.partitions);
        let extents_offset = tables.len() as u32;
        for extent in metadata.extents.iter() {
            extent.write_to(&mut tables);
            tables.extend_from_slice(&[0xee; 8]);
        }
        let extents = TableDescriptor {
            offset: extents_offset,
            num_entries: metadata.extents.len() as u32,
            entry_size: (MetadataExtent::SIZE + 8) as u32,
        };
        let groups = write_table(&mut tables, &metadata.groups);
        let block_devices = write_table(&mut tables, &metadata.block_devices);
        let mut raw = Vec::new();
        raw.extend_from_slice(&METADATA_HEADER_MAGIC.to_le_bytes());
        raw.extend_from_slice(&METADATA_MAJOR_VERSION.to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes());
        raw.extend_from_slice(&(SIZE_RAW_HEADER_V1_0 as u32).to_le_bytes());
        raw.extend_from_slice(&[0; SIZE_SHA256SUM]);
        raw.extend_from_slice(&(tables.len() as u32).to_le_bytes());
        raw.extend_from_slice(Sha256sum::from_data(&tables).as_bytes());
        for descriptor in [partitions, extents, groups, block_devices].iter() {
            descriptor.write_to(&mut raw)
        }
        let checksum = Sha256sum::from_data(&raw);
        raw[OFFSET_HEADER_CHECKSUM..OFFSET_HEADER_CHECKSUM + SIZE_SHA256SUM]
            .copy_from_slice(checksum.as_bytes());
        raw.extend_from_slice(&tables);
        assert_eq!(Metadata::decode(&metadata.geometry, &raw).unwrap(), metadata);
    }
}
