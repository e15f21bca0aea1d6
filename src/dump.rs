/*
lptools, to make, dump and unpack Android logical partition images: dump module
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

use std::io::Write;

use cli_table::{format::Justify, Cell, CellStruct, Style, Table};
use serde::{Serialize, Serializer};

use crate::{
    builder::MetadataBuilder,
    format::{
        Metadata, TargetType, BLOCK_DEVICE_SLOT_SUFFIXED, GROUP_SLOT_SUFFIXED,
        HEADER_FLAG_VIRTUAL_AB_DEVICE, PARTITION_ATTR_DISABLED, PARTITION_ATTR_READONLY,
        PARTITION_ATTR_SLOT_SUFFIXED, PARTITION_ATTR_UPDATED,
    },
    pretty::human_size,
    Result,
};

macro_rules! cell_right {
    ($raw: expr) => {
        $raw.cell().justify(Justify::Right)
    };
}

macro_rules! cell_bold_center {
    ($raw: expr) => {
        $raw.cell().bold(true).justify(Justify::Center)
    };
}

fn flag_string(strings: Vec<String>) -> String {
    if strings.is_empty() {
        "none".into()
    } else {
        strings.join(",")
    }
}

/// Named bits first, anything left over as `unknown_flag_bit_N`
pub fn header_flag_string(mut flags: u32) -> String {
    let mut strings = Vec::new();
    if flags & HEADER_FLAG_VIRTUAL_AB_DEVICE != 0 {
        strings.push("virtual_ab_device".into());
        flags &= !HEADER_FLAG_VIRTUAL_AB_DEVICE;
    }
    for bit in 0..u32::BITS {
        if flags & (1 << bit) != 0 {
            strings.push(format!("unknown_flag_bit_{}", bit))
        }
    }
    flag_string(strings)
}

pub fn attribute_string(attributes: u32) -> String {
    let names = [
        (PARTITION_ATTR_READONLY, "readonly"),
        (PARTITION_ATTR_SLOT_SUFFIXED, "slot-suffixed"),
        (PARTITION_ATTR_UPDATED, "updated"),
        (PARTITION_ATTR_DISABLED, "disabled"),
    ];
    flag_string(names.iter().filter(|(bit, _)|attributes & bit != 0)
        .map(|(_, name)|name.to_string()).collect())
}

pub fn group_flag_string(flags: u32) -> String {
    flag_string(if flags & GROUP_SLOT_SUFFIXED != 0 {
        vec!["slot-suffixed".into()]
    } else {
        Vec::new()
    })
}

pub fn block_device_flag_string(flags: u32) -> String {
    flag_string(if flags & BLOCK_DEVICE_SLOT_SUFFIXED != 0 {
        vec!["slot-suffixed".into()]
    } else {
        Vec::new()
    })
}

fn print_table<W: Write>(out: &mut W, title: &str, rows: Vec<Vec<CellStruct>>,
    header: &[&str]
) -> Result<()> {
    writeln!(out, "{}:", title)?;
    if rows.is_empty() {
        writeln!(out, "  (empty)")?;
        return Ok(())
    }
    let table = rows.table()
        .title(header.iter().map(|name|cell_bold_center!(name)))
        .bold(true);
    writeln!(out, "{}", table.display()?)?;
    Ok(())
}

/// Human readable dump of one metadata copy
pub fn print_metadata<W: Write>(out: &mut W, metadata: &Metadata) -> Result<()> {
    writeln!(out, "Metadata version: {}.{}", metadata.header.major_version,
        metadata.header.minor_version)?;
    writeln!(out, "Metadata size: {} bytes", metadata.encoded_size())?;
    writeln!(out, "Metadata max size: {} bytes", metadata.geometry.metadata_max_size)?;
    writeln!(out, "Metadata slot count: {}", metadata.geometry.metadata_slot_count)?;
    writeln!(out, "Header flags: {}", header_flag_string(metadata.header.flags))?;

    let mut layout = Vec::new();
    let mut rows = Vec::new();
    for partition in metadata.partitions.iter() {
        let mut extents = Vec::new();
        let mut first_sector = 0;
        for extent in metadata.extents_of(partition) {
            let range = format!("{} .. {}", first_sector,
                (first_sector + extent.num_sectors).saturating_sub(1));
            first_sector += extent.num_sectors;
            match extent.target_type {
                TargetType::Linear => {
                    let device = metadata.block_device_name(extent.target_source);
                    extents.push(format!("{} linear {} {}", range, device, extent.target_data));
                    layout.push((device, extent.target_data, extent.num_sectors,
                        partition.name.as_str()));
                },
                TargetType::Zero => extents.push(format!("{} zero", range)),
            }
        }
        rows.push(vec![
            partition.name.as_str().cell(),
            metadata.group_name(partition).cell(),
            attribute_string(partition.attributes).cell(),
            extents.join("\n").cell(),
        ]);
    }
    print_table(out, "Partition table", rows,
        &["Name", "Group", "Attributes", "Extents"])?;

    layout.sort();
    let rows = layout.iter().map(|(device, start, sectors, name)| vec![
        device.cell(),
        cell_right!(format!("{} .. {}", start, start + sectors)),
        name.cell(),
        cell_right!(format!("{} sectors", sectors)),
    ]).collect();
    print_table(out, "Super partition layout", rows,
        &["Device", "Sectors", "Partition", "Size"])?;

    let rows = metadata.block_devices.iter().map(|device| vec![
        device.partition_name.as_str().cell(),
        cell_right!(device.first_logical_sector),
        cell_right!(format!("{} bytes ({})", device.size, human_size(device.size))),
        block_device_flag_string(device.flags).cell(),
    ]).collect();
    print_table(out, "Block device table", rows,
        &["Partition name", "First sector", "Size", "Flags"])?;

    let rows = metadata.groups.iter().map(|group| vec![
        group.name.as_str().cell(),
        cell_right!(format!("{} bytes", group.maximum_size)),
        group_flag_string(group.flags).cell(),
    ]).collect();
    print_table(out, "Group table", rows, &["Name", "Maximum size", "Flags"])
}

fn is_false(value: &bool) -> bool {
    ! *value
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

/// 64-bit integers go out as strings, like protobuf JSON does
fn u64_as_string<S: Serializer>(value: &u64, serializer: S)
    -> std::result::Result<S::Ok, S::Error>
{
    serializer.collect_str(value)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group_name: String,
    #[serde(skip_serializing_if = "is_false")]
    pub is_dynamic: bool,
    #[serde(skip_serializing_if = "is_zero_u64", serialize_with = "u64_as_string")]
    pub size: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub name: String,
    #[serde(skip_serializing_if = "is_zero_u64", serialize_with = "u64_as_string")]
    pub maximum_size: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDeviceReport {
    pub name: String,
    #[serde(skip_serializing_if = "is_zero_u64", serialize_with = "u64_as_string")]
    pub size: u64,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub block_size: u32,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub alignment: u32,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub alignment_offset: u32,
}

/// Dynamic partition report printed by `lpdump --json`. `enabled` and
/// `retrofit` come from device properties and stay false on a host.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "is_false")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub retrofit: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<PartitionInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub block_devices: Vec<BlockDeviceReport>,
}

impl DeviceInfo {
    /// Groups with their partitions, then block devices
    pub fn merge_metadata(&mut self, metadata: &Metadata) -> Result<()> {
        let builder = MetadataBuilder::from_metadata(metadata)?;
        for group_name in builder.list_groups() {
            let group = match builder.find_group(group_name) {
                Some(group) => group,
                None => continue,
            };
            self.groups.push(GroupInfo {
                name: group_name.into(),
                maximum_size: group.maximum_size(),
            });
            for partition in builder.partitions_in_group(group_name) {
                self.partitions.push(PartitionInfo {
                    name: partition.name().into(),
                    group_name: group_name.into(),
                    is_dynamic: true,
                    size: partition.size(),
                })
            }
        }
        for device in metadata.block_devices.iter() {
            if let Some(info) = builder.block_device_info(&device.partition_name) {
                self.block_devices.push(BlockDeviceReport {
                    name: info.partition_name,
                    size: info.size,
                    block_size: info.logical_block_size,
                    alignment: info.alignment,
                    alignment_offset: info.alignment_offset,
                })
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        let mut builder = MetadataBuilder::with_device_size(1 << 20, 1024, 2).unwrap();
        builder.add_group("main", 1 << 19).unwrap();
        let system = builder.add_partition("system", "main", PARTITION_ATTR_READONLY).unwrap();
        builder.resize_partition(system, 65536).unwrap();
        builder.add_partition("empty", "default", 0).unwrap();
        builder.export().unwrap()
    }

    #[test]
    fn flag_strings() {
        assert_eq!(header_flag_string(0), "none");
        assert_eq!(header_flag_string(1), "virtual_ab_device");
        assert_eq!(header_flag_string(0b101), "virtual_ab_device,unknown_flag_bit_2");
        assert_eq!(attribute_string(0), "none");
        assert_eq!(attribute_string(0b1011), "readonly,slot-suffixed,disabled");
        assert_eq!(group_flag_string(1), "slot-suffixed");
        assert_eq!(block_device_flag_string(0), "none");
    }

    #[test]
    fn text_dump_mentions_everything() {
        let metadata = sample();
        let mut out = Vec::new();
        print_metadata(&mut out, &metadata).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Metadata version: 10.0"));
        assert!(text.contains("Metadata slot count: 2"));
        assert!(text.contains("Header flags: none"));
        assert!(text.contains("0 .. 127 linear super 32"));
        assert!(text.contains("32 .. 160"));
        assert!(text.contains("readonly"));
        assert!(text.contains("Group table:"));
    }

    #[test]
    fn json_report() {
        let mut info = DeviceInfo::default();
        info.merge_metadata(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&info.to_json().unwrap()).unwrap();
        assert!(value.get("enabled").is_none());
        let partitions = value["partitions"].as_array().unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0]["name"], "empty");
        assert!(partitions[0].get("size").is_none());
        assert_eq!(partitions[1]["name"], "system");
        assert_eq!(partitions[1]["group_name"], "main");
        assert_eq!(partitions[1]["size"], "65536");
        assert_eq!(partitions[1]["is_dynamic"], true);
        assert_eq!(value["groups"][1]["maximum_size"], "524288");
        assert_eq!(value["block_devices"][0]["name"], "super");
        assert_eq!(value["block_devices"][0]["block_size"], 4096);
    }

    #[test]
    fn empty_report_is_empty_object() {
        assert_eq!(DeviceInfo::default().to_json().unwrap(), "{}");
    }
}
