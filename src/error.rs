/*
lptools, to make, dump and unpack Android logical partition images: error module
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

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IOError (#[from] std::io::Error),
    #[error("invalid metadata: {0}")]
    FormatError (#[from] crate::format::FormatError),
    #[error("metadata builder: {0}")]
    BuilderError (#[from] crate::builder::BuilderError),
    #[error("image: {0}")]
    ImageError (#[from] crate::writer::ImageError),
    #[error("sparse image: {0}")]
    SparseError (#[from] crate::sparse::SparseError),
    #[error("extract: {0}")]
    ExtractError (#[from] crate::extractor::ExtractError),
    #[error("progress bar template: {0}")]
    TemplateError (#[from] indicatif::style::TemplateError),
    #[error("JSON: {0}")]
    JsonError (#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
