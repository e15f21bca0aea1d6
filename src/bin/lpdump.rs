/*
lptools, to make, dump and unpack Android logical partition images: lpdump
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

use std::{io::Write, path::{Path, PathBuf}, process::ExitCode};

use clap::Parser;
use tracing::debug;

use lptools::{
    cli::{init_logging, parse_args, parse_slot, EX_NOINPUT, EX_OK, EX_SOFTWARE},
    dump::{print_metadata, DeviceInfo},
    format::Metadata,
    reader::{is_empty_super_image, read_image_metadata},
};

/// Dump the partition table of an Android super partition or image
#[derive(Parser, Debug)]
#[command(version)]
struct Arg {
    #[arg(short = 's', long, value_parser = parse_slot, conflicts_with = "all")]
    /// Slot number or suffix
    slot: Option<u32>,

    #[arg(short = 'j', long, conflicts_with = "all")]
    /// Print in JSON format
    json: bool,

    #[arg(short = 'd', long)]
    /// Print the space reserved for metadata at the start of the super device,
    /// in bytes
    dump_metadata_size: bool,

    #[arg(short = 'a', long)]
    /// Dump all slots
    all: bool,

    #[arg(short = 'e', long = "is-super-empty", hide = true)]
    /// Accepted and ignored
    _is_super_empty: bool,

    /// Super partition or image
    path: PathBuf,
}

fn read_metadata(path: &Path, slot: u32) -> Option<Metadata> {
    match read_image_metadata(path, slot) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            debug!("Could not read slot {} of '{}': {}", slot, path.display(), e);
            None
        }
    }
}

fn print_json(metadata: Option<&Metadata>) -> u8 {
    let mut info = DeviceInfo::default();
    let merged = match metadata {
        Some(metadata) => info.merge_metadata(metadata).is_ok(),
        None => false,
    };
    if ! merged {
        eprintln!("Warning: Failed to read metadata.");
    }
    match info.to_json() {
        Ok(json) => {
            println!("{}", json);
            EX_OK
        },
        Err(e) => {
            eprintln!("{}", e);
            EX_SOFTWARE
        }
    }
}

fn dump(arg: &Arg) -> u8 {
    let slot = arg.slot.unwrap_or(0);
    let metadata = read_metadata(&arg.path, slot);
    if arg.json {
        return print_json(metadata.as_ref())
    }
    let metadata = match metadata {
        Some(metadata) => metadata,
        None => {
            eprintln!("Failed to read metadata.");
            return EX_NOINPUT
        }
    };
    if arg.dump_metadata_size {
        println!("{}", metadata.metadata_region_size());
        return EX_OK
    }
    match print_slots(arg, slot, &metadata) {
        Ok(_) => EX_OK,
        Err(e) => {
            eprintln!("Failed to print metadata: {}", e);
            EX_SOFTWARE
        }
    }
}

/// Empty images only have one slot
fn print_slots(arg: &Arg, slot: u32, metadata: &Metadata) -> lptools::Result<()> {
    let num_slots = match is_empty_super_image(&arg.path) {
        Ok(true) => 1,
        _ => metadata.geometry.metadata_slot_count,
    };
    let mut stdout = std::io::stdout().lock();
    if num_slots > 1 {
        writeln!(stdout, "Slot {}:", slot)?;
    }
    print_metadata(&mut stdout, metadata)?;
    if ! arg.all {
        return Ok(())
    }
    for other in 1..num_slots {
        if let Some(metadata) = read_metadata(&arg.path, other) {
            writeln!(stdout, "\nSlot {}:", other)?;
            print_metadata(&mut stdout, &metadata)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let arg: Arg = match parse_args() {
        Ok(arg) => arg,
        Err(code) => return code,
    };
    ExitCode::from(dump(&arg))
}
