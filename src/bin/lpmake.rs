/*
lptools, to make, dump and unpack Android logical partition images: lpmake
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

use std::{collections::BTreeMap, path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing::debug;

use lptools::{
    builder::{BlockDeviceInfo, MetadataBuilder},
    cli::{
        init_logging, parse_args, DeviceSpec, GroupSpec, ImageSpec, PartitionSpec,
        EX_CANTCREAT, EX_OK, EX_SOFTWARE, EX_USAGE,
    },
    format::{DEFAULT_PARTITION_ALIGNMENT, DEFAULT_PARTITION_NAME},
    writer::{write_empty_image_file, write_split_image_files, write_to_image_file},
};

/// Create Android logical partition images
#[derive(Parser, Debug)]
#[command(version)]
struct Arg {
    #[arg(short = 'd', long)]
    /// Size of the block device for logical partitions
    device_size: Option<u64>,

    #[arg(short = 'm', long)]
    /// Maximum size to reserve for partition metadata
    metadata_size: u32,

    #[arg(short = 's', long)]
    /// Number of slots to store metadata copies
    metadata_slots: u32,

    #[arg(short = 'p', long = "partition", value_name = "NAME:ATTRS:SIZE[:GROUP]")]
    /// Add a partition, ATTRS being 'none' or 'readonly'
    partitions: Vec<PartitionSpec>,

    #[arg(short = 'o', long)]
    /// Output file, or output directory when the super partition spans
    /// several block devices
    output: PathBuf,

    #[arg(short = 'b', long, default_value_t = 4096,
        value_parser = clap::value_parser!(u32).range(1..))]
    /// Physical block size, also used as the logical block size
    block_size: u32,

    #[arg(short = 'a', long)]
    /// Optimal partition alignment in bytes
    alignment: Option<u32>,

    #[arg(short = 'O', long)]
    /// Alignment offset in bytes to device parent
    alignment_offset: Option<u32>,

    #[arg(short = 'S', long)]
    /// Output a sparse image for fastboot
    sparse: bool,

    #[arg(short = 'i', long = "image", value_name = "PARTITION=FILE")]
    /// Include the given file (or sparse file) as initial data for the named
    /// partition
    images: Vec<ImageSpec>,

    #[arg(short = 'g', long = "group", value_name = "GROUP:SIZE")]
    /// Define a named partition group with the given maximum size
    groups: Vec<GroupSpec>,

    #[arg(short = 'D', long = "device", value_name = "NAME:SIZE[:ALIGN[:OFFSET]]")]
    /// Add a block device that the super partition spans over, conflicts with
    /// --device-size and the alignment options
    devices: Vec<DeviceSpec>,

    #[arg(short = 'n', long, default_value = DEFAULT_PARTITION_NAME)]
    /// Name of the block device that will house the super partition
    super_name: String,

    #[arg(short = 'x', long)]
    /// Mark the block device and partition names needing slot suffixes
    auto_slot_suffixing: bool,

    #[arg(short = 'F', long)]
    /// Write a full, flashable image even if no partition images were given
    force_full_image: bool,

    #[arg(long)]
    /// Add the VIRTUAL_AB_DEVICE flag to the metadata header
    virtual_ab: bool,
}

impl Arg {
    /// The block devices to build on, or a usage message
    fn block_devices(&self) -> Result<Vec<BlockDeviceInfo>, &'static str> {
        let implied_super = self.device_size.is_some() || self.alignment.is_some() ||
            self.alignment_offset.is_some();
        if implied_super == self.devices.is_empty() {
            if let Some(device_size) = self.device_size {
                if device_size == 0 {
                    return Err("Invalid argument to --device-size.")
                }
                return Ok(vec![BlockDeviceInfo::new(&self.super_name, device_size,
                    self.alignment.unwrap_or(DEFAULT_PARTITION_ALIGNMENT),
                    self.alignment_offset.unwrap_or(0), self.block_size)])
            }
            if ! implied_super {
                return Ok(self.devices.iter().map(|device|BlockDeviceInfo::new(
                    &device.name, device.size, device.alignment,
                    device.alignment_offset, self.block_size)).collect())
            }
        }
        Err("Must specify --device OR --device-size.")
    }
}

fn make(arg: &Arg) -> u8 {
    let block_devices = match arg.block_devices() {
        Ok(block_devices) => block_devices,
        Err(message) => {
            eprintln!("{}", message);
            return EX_USAGE
        }
    };
    if arg.metadata_size == 0 {
        eprintln!("--metadata-size must be more than 0 bytes.");
        return EX_USAGE
    }
    if arg.metadata_slots == 0 {
        eprintln!("--metadata-slots must be more than 0.");
        return EX_USAGE
    }
    if arg.output.as_os_str().is_empty() {
        eprintln!("--output must specify a valid path.");
        return EX_USAGE
    }
    if arg.partitions.is_empty() {
        eprintln!("Partition table must have at least one entry.");
        return EX_USAGE
    }
    let mut builder = match MetadataBuilder::new(&block_devices, &arg.super_name,
        arg.metadata_size, arg.metadata_slots)
    {
        Ok(builder) => builder,
        Err(e) => {
            eprintln!("Invalid metadata parameters: {}", e);
            return EX_USAGE
        }
    };
    if arg.auto_slot_suffixing {
        builder.set_auto_slot_suffixing()
    }
    if arg.virtual_ab {
        builder.set_virtual_ab_device_flag()
    }
    for group in arg.groups.iter() {
        if let Err(e) = builder.add_group(&group.name, group.maximum_size) {
            eprintln!("Could not add group {}: {}", group.name, e);
            return EX_SOFTWARE
        }
    }
    for partition in arg.partitions.iter() {
        let id = match builder.add_partition(
            &partition.name, &partition.group_name, partition.attributes)
        {
            Ok(id) => id,
            Err(e) => {
                eprintln!("Could not add partition {}: {}", partition.name, e);
                return EX_SOFTWARE
            }
        };
        if let Err(e) = builder.resize_partition(id, partition.size) {
            eprintln!("Not enough space on device for partition {} with size {}: {}",
                partition.name, partition.size, e);
            return EX_SOFTWARE
        }
    }
    let metadata = match builder.export() {
        Ok(metadata) => metadata,
        Err(e) => {
            eprintln!("Could not export metadata: {}", e);
            return EX_SOFTWARE
        }
    };
    let images: BTreeMap<String, PathBuf> = arg.images.iter()
        .map(|image|(image.partition.clone(), image.path.clone())).collect();
    let result = if ! images.is_empty() || arg.force_full_image {
        if block_devices.len() == 1 {
            debug!("Writing full image to '{}'", arg.output.display());
            write_to_image_file(&arg.output, &metadata, arg.block_size, &images,
                arg.sparse)
        } else {
            debug!("Writing split images into '{}'", arg.output.display());
            write_split_image_files(&arg.output, &metadata, arg.block_size, &images,
                arg.sparse)
        }
    } else {
        debug!("Writing empty image to '{}'", arg.output.display());
        write_empty_image_file(&arg.output, &metadata)
    };
    match result {
        Ok(_) => EX_OK,
        Err(e) => {
            eprintln!("Could not write '{}': {}", arg.output.display(), e);
            EX_CANTCREAT
        }
    }
}

fn main() -> ExitCode {
    init_logging();
    let arg: Arg = match parse_args() {
        Ok(arg) => arg,
        Err(code) => return code,
    };
    ExitCode::from(make(&arg))
}
