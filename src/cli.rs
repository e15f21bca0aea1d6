/*
lptools, to make, dump and unpack Android logical partition images: command line module
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

//! Pieces shared by the `lp*` binaries

use std::{path::PathBuf, process::ExitCode, str::FromStr};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::{
    format::{DEFAULT_GROUP_NAME, DEFAULT_PARTITION_ALIGNMENT, PARTITION_ATTR_READONLY},
    utility::slot_number_for_slot_suffix,
};

pub const EX_OK: u8 = 0;
pub const EX_USAGE: u8 = 64;
pub const EX_NOINPUT: u8 = 66;
pub const EX_SOFTWARE: u8 = 70;
pub const EX_OSERR: u8 = 71;
pub const EX_CANTCREAT: u8 = 73;

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Log to stderr, filtered by `RUST_LOG`
pub fn init_logging() {
    let result = tracing_subscriber::fmt()
        .with_env_filter(default_env_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
    if let Err(e) = result {
        eprintln!("Failed to initialize logger: {}", e)
    }
}

/// Parse the command line, usage errors become `EX_USAGE` while help and
/// version output exit cleanly
pub fn parse_args<T: Parser>() -> Result<T, ExitCode> {
    match T::try_parse() {
        Ok(args) => Ok(args),
        Err(e) => {
            let code = if e.use_stderr() { EX_USAGE } else { EX_OK };
            if let Err(e) = e.print() {
                eprintln!("Failed to print usage: {}", e)
            }
            Err(ExitCode::from(code))
        }
    }
}

fn parse_number<T: FromStr>(value: &str, what: &str) -> Result<T, String> {
    value.parse().map_err(|_|format!("{} must be an unsigned number, not '{}'", what, value))
}

/// `<name>:<attributes>:<size>[:group]`, attributes being `none` or
/// `readonly`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    pub attributes: u32,
    pub size: u64,
    pub group_name: String,
}

impl FromStr for PartitionSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 {
            return Err(format!("partition info '{}' has invalid formatting", s))
        }
        if parts[0].is_empty() {
            return Err("partition must have a valid name".into())
        }
        let attributes = match parts[1] {
            "none" => 0,
            "readonly" => PARTITION_ATTR_READONLY,
            other => return Err(format!("attribute not recognized: {}", other)),
        };
        Ok(Self {
            name: parts[0].into(),
            attributes,
            size: parse_number(parts[2], "partition size")?,
            group_name: parts.get(3).copied().unwrap_or(DEFAULT_GROUP_NAME).into(),
        })
    }
}

/// `<name>:<maximum size>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub name: String,
    pub maximum_size: u64,
}

impl FromStr for GroupSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, size) = match s.split_once(':') {
            Some((name, size)) if ! size.contains(':') => (name, size),
            _ => return Err(format!("group info '{}' has invalid formatting", s)),
        };
        if name.is_empty() {
            return Err("partition group must have a valid name".into())
        }
        Ok(Self {
            name: name.into(),
            maximum_size: parse_number(size, "group maximum size")?,
        })
    }
}

/// `<partition name>:<size>[:<alignment>[:<alignment offset>]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub name: String,
    pub size: u64,
    pub alignment: u32,
    pub alignment_offset: u32,
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(format!("block device info '{}' has invalid formatting", s))
        }
        if parts[0].is_empty() {
            return Err("block device must have a valid name".into())
        }
        let size = parse_number(parts[1], "block device size")?;
        if size == 0 {
            return Err("block device must have a valid size".into())
        }
        Ok(Self {
            name: parts[0].into(),
            size,
            alignment: match parts.get(2) {
                Some(alignment) => parse_number(alignment, "block device alignment")?,
                None => DEFAULT_PARTITION_ALIGNMENT,
            },
            alignment_offset: match parts.get(3) {
                Some(offset) => parse_number(offset, "block device alignment offset")?,
                None => 0,
            },
        })
    }
}

/// `<partition>=<file>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub partition: String,
    pub path: PathBuf,
}

impl FromStr for ImageSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((partition, path)) if ! partition.is_empty() && ! path.is_empty() =>
                Ok(Self { partition: partition.into(), path: path.into() }),
            _ => Err("expected PARTITION=FILE".into()),
        }
    }
}

/// Slot given either as a number or as a suffix like `_b`
pub fn parse_slot(value: &str) -> Result<u32, String> {
    match value.parse() {
        Ok(slot) => Ok(slot),
        Err(_) => Ok(slot_number_for_slot_suffix(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_specs() {
        assert_eq!("system:readonly:1048576".parse::<PartitionSpec>().unwrap(),
            PartitionSpec {
                name: "system".into(),
                attributes: PARTITION_ATTR_READONLY,
                size: 1048576,
                group_name: "default".into(),
            });
        let spec: PartitionSpec = "vendor:none:0:main".parse().unwrap();
        assert_eq!((spec.attributes, spec.group_name.as_str()), (0, "main"));
        assert!("system:rw:1".parse::<PartitionSpec>().is_err());
        assert!("system:none".parse::<PartitionSpec>().is_err());
        assert!(":none:1".parse::<PartitionSpec>().is_err());
        assert!("system:none:1:main:extra".parse::<PartitionSpec>().is_err());
        assert!("system:none:-1".parse::<PartitionSpec>().is_err());
    }

    #[test]
    fn group_specs() {
        assert_eq!("main:4096".parse::<GroupSpec>().unwrap(),
            GroupSpec { name: "main".into(), maximum_size: 4096 });
        assert!("main".parse::<GroupSpec>().is_err());
        assert!(":4096".parse::<GroupSpec>().is_err());
        assert!("main:4096:1".parse::<GroupSpec>().is_err());
    }

    #[test]
    fn device_specs() {
        assert_eq!("super:1048576".parse::<DeviceSpec>().unwrap(), DeviceSpec {
            name: "super".into(),
            size: 1048576,
            alignment: DEFAULT_PARTITION_ALIGNMENT,
            alignment_offset: 0,
        });
        let spec: DeviceSpec = "system_b:2097152:4096:512".parse().unwrap();
        assert_eq!((spec.alignment, spec.alignment_offset), (4096, 512));
        assert!("super:0".parse::<DeviceSpec>().is_err());
        assert!("super".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn image_specs() {
        let spec: ImageSpec = "system=out/system.img".parse().unwrap();
        assert_eq!(spec.partition, "system");
        assert_eq!(spec.path, PathBuf::from("out/system.img"));
        assert!("=system.img".parse::<ImageSpec>().is_err());
        assert!("system=".parse::<ImageSpec>().is_err());
        assert!("system".parse::<ImageSpec>().is_err());
    }

    #[test]
    fn slots() {
        assert_eq!(parse_slot("1"), Ok(1));
        assert_eq!(parse_slot("_b"), Ok(1));
        assert_eq!(parse_slot("a"), Ok(0));
    }
}
