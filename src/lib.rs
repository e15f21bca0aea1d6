/*
lptools, to make, dump and unpack Android logical partition images
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

//! Android logical partition ("super" partition) metadata: the on-disk
//! format, a builder with an extent allocator, image reading and writing,
//! and partition extraction.

pub mod builder;
mod checksum;
pub mod cli;
pub mod dump;
mod error;
pub mod extractor;
pub mod format;
mod pretty;
mod progress;
pub mod reader;
pub mod sparse;
pub mod utility;
pub mod writer;

pub use checksum::Sha256sum;
pub use error::{Error, Result};
