/*
lptools, to make, dump and unpack Android logical partition images: lpflash
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

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;

use lptools::{
    cli::{init_logging, parse_args, EX_NOINPUT, EX_OK, EX_SOFTWARE},
    reader::read_from_image_file,
    writer::flash_partition_table,
};

/// Write the partition table of an empty super image onto a block device
#[derive(Parser, Debug)]
#[command(version)]
struct Arg {
    /// Block device (or full image) to write the partition table onto
    block_device: PathBuf,

    /// Empty super image holding the partition table
    image: PathBuf,
}

fn flash(arg: &Arg) -> u8 {
    let metadata = match read_from_image_file(&arg.image) {
        Ok(metadata) => metadata,
        Err(e) => {
            println!("Failed to read image file: {}", e);
            return EX_NOINPUT
        }
    };
    if let Err(e) = flash_partition_table(&arg.block_device, &metadata) {
        println!("Failed to flash partition table: {}", e);
        return EX_SOFTWARE
    }
    println!("Successfully flashed partition table.");
    EX_OK
}

fn main() -> ExitCode {
    init_logging();
    let arg: Arg = match parse_args() {
        Ok(arg) => arg,
        Err(code) => return code,
    };
    ExitCode::from(flash(&arg))
}
