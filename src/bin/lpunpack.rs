/*
lptools, to make, dump and unpack Android logical partition images: lpunpack
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

use std::{fs::File, io::Seek, path::PathBuf, process::ExitCode};

use clap::Parser;

use lptools::{
    cli::{init_logging, parse_args, EX_OK, EX_OSERR, EX_SOFTWARE, EX_USAGE},
    extractor::{ExtractError, ImageExtractor},
    reader::try_read_metadata,
    sparse::is_sparse_image,
};

/// Extract partition images from a super image
#[derive(Parser, Debug)]
#[command(version)]
struct Arg {
    #[arg(short = 'p', long = "partition", value_name = "NAME")]
    /// Extract the named partition, can be given multiple times, extract
    /// every partition if none given
    partitions: Vec<String>,

    #[arg(short = 'S', long, default_value_t = 0)]
    /// Slot number
    slot: u32,

    /// Path of the super image
    super_image: PathBuf,

    /// Path of dir to output partition images into
    #[arg(default_value = ".")]
    output_dir: PathBuf,
}

fn unpack(arg: &Arg) -> u8 {
    let mut image = match File::open(&arg.super_image) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("open failed: {}: {}", arg.super_image.display(), e);
            return EX_OSERR
        }
    };
    let metadata = match try_read_metadata(&mut image, arg.slot) {
        Ok(metadata) => metadata,
        Err(e) => {
            let sparse = image.rewind().is_ok() &&
                matches!(is_sparse_image(&mut image), Ok(true));
            if sparse {
                eprintln!("{}", ExtractError::SparseSuperImage);
            } else {
                eprintln!("Image does not appear to be in super-partition format: {}", e);
            }
            return EX_USAGE
        }
    };
    let mut extractor = match ImageExtractor::new(image, metadata, &arg.partitions) {
        Ok(extractor) => extractor,
        Err(e) => {
            eprintln!("{}", e);
            return EX_SOFTWARE
        }
    };
    match extractor.extract(&arg.output_dir) {
        Ok(_) => EX_OK,
        Err(e) => {
            eprintln!("Failed to extract: {}", e);
            EX_SOFTWARE
        }
    }
}

fn main() -> ExitCode {
    init_logging();
    let arg: Arg = match parse_args() {
        Ok(arg) => arg,
        Err(code) => return code,
    };
    ExitCode::from(unpack(&arg))
}
