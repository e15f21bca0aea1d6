/*
lptools, to make, dump and unpack Android logical partition images: sparse image module
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

//! Android sparse image container, v1.0

use std::{fs::File, io::{Read, Seek, SeekFrom, Write}};

use tracing::{debug, error};

use crate::Result;

pub const SPARSE_HEADER_MAGIC: u32 = 0xed26ff3a;
const SPARSE_MAJOR_VERSION: u16 = 1;
const SPARSE_MINOR_VERSION: u16 = 0;
const SIZE_FILE_HEADER: usize = 28;
const SIZE_CHUNK_HEADER: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xcac1;
const CHUNK_TYPE_FILL: u16 = 0xcac2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// Longest run of data one RAW chunk may carry
const MAX_RAW_CHUNK_BYTES: u64 = 64 << 20;

const SIZE_BUFFER: usize = 0x100000;

#[derive(Debug, thiserror::Error)]
pub enum SparseError {
    #[error("sparse magic invalid: expected 0x{:08x}, found 0x{magic:08x}", SPARSE_HEADER_MAGIC)]
    InvalidMagic {
        magic: u32
    },
    #[error("unsupported sparse version {major}.{minor}")]
    UnsupportedVersion {
        major: u16,
        minor: u16,
    },
    #[error("sparse header sizes {file_header}/{chunk_header} are too small")]
    InvalidHeaderSize {
        file_header: u16,
        chunk_header: u16,
    },
    #[error("sparse block size {size} is invalid")]
    InvalidBlockSize {
        size: u32
    },
    #[error("chunk {index} has unknown type 0x{chunk_type:04x}")]
    InvalidChunkType {
        index: u32,
        chunk_type: u16,
    },
    #[error("chunk {index} declares {total_size} bytes, which does not match its type")]
    InvalidChunkSize {
        index: u32,
        total_size: u32,
    },
    #[error("chunks cover {found} blocks but the header declares {expected}")]
    BlockCountMismatch {
        expected: u32,
        found: u64,
    },
    #[error("chunk {index} runs past the {expected} blocks the header declares")]
    ChunkPastEnd {
        index: u32,
        expected: u32,
    },
    #[error("CRC32 mismatch: recorded 0x{recorded:08x}, calculated 0x{calculated:08x}")]
    Crc32Mismatch {
        recorded: u32,
        calculated: u32,
    },
    #[error("write at {offset} of {length} bytes is not block-aligned or goes backwards")]
    UnalignedWrite {
        offset: u64,
        length: u64,
    },
    #[error("expanded image of {size} bytes does not fit the sparse format")]
    TooLarge {
        size: u64
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// Data stored in the sparse file starting at this byte offset
    Raw {
        file_offset: u64
    },
    /// A 32-bit pattern repeated over the whole chunk
    Fill(u32),
    DontCare,
    /// Running CRC32 of everything before it, covers no blocks
    Crc32(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset in the expanded image
    pub offset: u64,
    pub length: u64,
    pub data: ChunkData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
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

/// Check the magic at the current position, then rewind back to it
pub fn is_sparse_image<R: Read + Seek>(reader: &mut R) -> Result<bool> {
    let start = reader.stream_position()?;
    let mut magic = [0; 4];
    let result = match reader.read_exact(&mut magic) {
        Ok(_) => u32::from_le_bytes(magic) == SPARSE_HEADER_MAGIC,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e.into()),
    };
    reader.seek(SeekFrom::Start(start))?;
    Ok(result)
}

/// Chunk list of a sparse file, the data itself stays in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseImage {
    header: SparseHeader,
    chunks: Vec<Chunk>,
}

impl SparseImage {
    pub fn read_from<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let base = reader.stream_position()?;
        let mut raw = [0; SIZE_FILE_HEADER];
        reader.read_exact(&mut raw)?;
        let magic = le_u32(&raw, 0);
        if magic != SPARSE_HEADER_MAGIC {
            return Err(SparseError::InvalidMagic { magic }.into())
        }
        let major = le_u16(&raw, 4);
        let minor = le_u16(&raw, 6);
        if major != SPARSE_MAJOR_VERSION {
            return Err(SparseError::UnsupportedVersion { major, minor }.into())
        }
        let file_header = le_u16(&raw, 8);
        let chunk_header = le_u16(&raw, 10);
        if (file_header as usize) < SIZE_FILE_HEADER ||
            (chunk_header as usize) < SIZE_CHUNK_HEADER
        {
            return Err(SparseError::InvalidHeaderSize { file_header, chunk_header }.into())
        }
        let header = SparseHeader {
            block_size: le_u32(&raw, 12),
            total_blocks: le_u32(&raw, 16),
            total_chunks: le_u32(&raw, 20),
            image_checksum: le_u32(&raw, 24),
        };
        if header.block_size == 0 || header.block_size % 4 != 0 {
            return Err(SparseError::InvalidBlockSize { size: header.block_size }.into())
        }
        reader.seek(SeekFrom::Start(base + file_header as u64))?;
        let block_size = header.block_size as u64;
        let limit = header.total_blocks as u64 * block_size;
        let mut chunks = Vec::new();
        let mut offset: u64 = 0;
        let mut raw_chunk = vec![0; chunk_header as usize];
        for index in 0..header.total_chunks {
            reader.read_exact(&mut raw_chunk)?;
            let chunk_type = le_u16(&raw_chunk, 0);
            let blocks = le_u32(&raw_chunk, 4) as u64;
            let total_size = le_u32(&raw_chunk, 8);
            let payload = total_size as u64 - (chunk_header as u64).min(total_size as u64);
            let length = blocks * block_size;
            let bad_size = || SparseError::InvalidChunkSize { index, total_size };
            let data = match chunk_type {
                CHUNK_TYPE_RAW => {
                    if payload != length {
                        return Err(bad_size().into())
                    }
                    let file_offset = reader.stream_position()?;
                    reader.seek(SeekFrom::Current(payload as i64))?;
                    ChunkData::Raw { file_offset }
                },
                CHUNK_TYPE_FILL | CHUNK_TYPE_CRC32 => {
                    if payload != 4 {
                        return Err(bad_size().into())
                    }
                    let mut value = [0; 4];
                    reader.read_exact(&mut value)?;
                    let value = u32::from_le_bytes(value);
                    if chunk_type == CHUNK_TYPE_FILL {
                        ChunkData::Fill(value)
                    } else {
                        ChunkData::Crc32(value)
                    }
                },
                CHUNK_TYPE_DONT_CARE => {
                    if payload != 0 {
                        return Err(bad_size().into())
                    }
                    ChunkData::DontCare
                },
                _ => return Err(SparseError::InvalidChunkType { index, chunk_type }.into()),
            };
            let length = if let ChunkData::Crc32(_) = data { 0 } else { length };
            let end = match offset.checked_add(length) {
                Some(end) if end <= limit => end,
                _ => return Err(SparseError::ChunkPastEnd {
                    index, expected: header.total_blocks }.into()),
            };
            chunks.push(Chunk { offset, length, data });
            offset = end;
        }
        let found = offset / block_size;
        if found != header.total_blocks as u64 {
            error!("Sparse image declares {} blocks, chunks cover {}",
                header.total_blocks, found);
            return Err(SparseError::BlockCountMismatch {
                expected: header.total_blocks, found }.into())
        }
        debug!("Sparse image: {} chunks, {} blocks of {} bytes", chunks.len(),
            header.total_blocks, header.block_size);
        Ok(Self { header, chunks })
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn expanded_size(&self) -> u64 {
        self.header.total_blocks as u64 * self.header.block_size as u64
    }

    /// Walk the expanded content, checking every CRC32 chunk and the header
    /// checksum when one is recorded
    pub fn verify<R: Read + Seek>(&self, reader: &mut R) -> Result<()> {
        let mut hasher = crc32fast::Hasher::new();
        let mut buffer = vec![0; SIZE_BUFFER];
        for chunk in self.chunks.iter() {
            match chunk.data {
                ChunkData::Raw { file_offset } => {
                    reader.seek(SeekFrom::Start(file_offset))?;
                    let mut remaining = chunk.length;
                    while remaining > 0 {
                        let size = remaining.min(SIZE_BUFFER as u64) as usize;
                        reader.read_exact(&mut buffer[..size])?;
                        hasher.update(&buffer[..size]);
                        remaining -= size as u64;
                    }
                },
                ChunkData::Fill(value) => hash_pattern(&mut hasher, value, chunk.length),
                ChunkData::DontCare => hash_pattern(&mut hasher, 0, chunk.length),
                ChunkData::Crc32(recorded) => {
                    let calculated = hasher.clone().finalize();
                    if recorded != calculated {
                        error!("CRC32 chunk mismatch at offset {}", chunk.offset);
                        return Err(SparseError::Crc32Mismatch { recorded, calculated }.into())
                    }
                },
            }
        }
        let calculated = hasher.finalize();
        if self.header.image_checksum != 0 && self.header.image_checksum != calculated {
            error!("Sparse image checksum mismatch");
            return Err(SparseError::Crc32Mismatch {
                recorded: self.header.image_checksum, calculated }.into())
        }
        Ok(())
    }

    /// Write the expanded image into `file`, DONT_CARE ranges become holes
    pub fn expand_to<R: Read + Seek>(&self, reader: &mut R, file: &mut File) -> Result<()> {
        let mut buffer = vec![0; SIZE_BUFFER];
        file.set_len(0)?;
        for chunk in self.chunks.iter() {
            match chunk.data {
                ChunkData::Raw { file_offset } => {
                    reader.seek(SeekFrom::Start(file_offset))?;
                    file.seek(SeekFrom::Start(chunk.offset))?;
                    let mut remaining = chunk.length;
                    while remaining > 0 {
                        let size = remaining.min(SIZE_BUFFER as u64) as usize;
                        reader.read_exact(&mut buffer[..size])?;
                        file.write_all(&buffer[..size])?;
                        remaining -= size as u64;
                    }
                },
                ChunkData::Fill(value) if value != 0 => {
                    file.seek(SeekFrom::Start(chunk.offset))?;
                    write_pattern(file, value, chunk.length)?
                },
                _ => (),
            }
        }
        file.set_len(self.expanded_size())?;
        Ok(())
    }
}

fn pattern_buffer(value: u32, length: usize) -> Vec<u8> {
    value.to_le_bytes().iter().copied().cycle().take(length).collect()
}

fn hash_pattern(hasher: &mut crc32fast::Hasher, value: u32, length: u64) {
    let buffer = pattern_buffer(value, length.min(SIZE_BUFFER as u64) as usize);
    let mut remaining = length;
    while remaining > 0 {
        let size = remaining.min(buffer.len() as u64) as usize;
        hasher.update(&buffer[..size]);
        remaining -= size as u64;
    }
}

fn write_pattern<W: Write>(writer: &mut W, value: u32, length: u64) -> Result<()> {
    let buffer = pattern_buffer(value, length.min(SIZE_BUFFER as u64) as usize);
    let mut remaining = length;
    while remaining > 0 {
        let size = remaining.min(buffer.len() as u64) as usize;
        writer.write_all(&buffer[..size])?;
        remaining -= size as u64;
    }
    Ok(())
}

/// RAW chunk still accepting data, its header gets patched on close
#[derive(Debug)]
struct OpenRawChunk {
    header_offset: u64,
    length: u64,
}

/// Streams block-aligned writes at increasing offsets into a sparse file.
/// Gaps between writes become DONT_CARE chunks.
pub struct SparseWriter<W: Write + Seek> {
    writer: W,
    block_size: u32,
    /// Expanded bytes covered so far
    position: u64,
    total_chunks: u32,
    open_raw: Option<OpenRawChunk>,
    hasher: crc32fast::Hasher,
}

impl<W: Write + Seek> SparseWriter<W> {
    pub fn new(mut writer: W, block_size: u32) -> Result<Self> {
        if block_size == 0 || block_size % 4 != 0 {
            return Err(SparseError::InvalidBlockSize { size: block_size }.into())
        }
        writer.write_all(&[0; SIZE_FILE_HEADER])?;
        Ok(Self {
            writer,
            block_size,
            position: 0,
            total_chunks: 0,
            open_raw: None,
            hasher: crc32fast::Hasher::new(),
        })
    }

    fn check_write(&self, offset: u64, length: u64) -> Result<()> {
        let block_size = self.block_size as u64;
        if offset % block_size != 0 || length % block_size != 0 || offset < self.position {
            return Err(SparseError::UnalignedWrite { offset, length }.into())
        }
        Ok(())
    }

    fn write_chunk_header(&mut self, chunk_type: u16, length: u64, payload: u64) -> Result<()> {
        let blocks = length / self.block_size as u64;
        let total_size = SIZE_CHUNK_HEADER as u64 + payload;
        if blocks > u32::MAX as u64 || total_size > u32::MAX as u64 {
            return Err(SparseError::TooLarge { size: self.position + length }.into())
        }
        let mut raw = [0; SIZE_CHUNK_HEADER];
        raw[0..2].copy_from_slice(&chunk_type.to_le_bytes());
        raw[4..8].copy_from_slice(&(blocks as u32).to_le_bytes());
        raw[8..12].copy_from_slice(&(total_size as u32).to_le_bytes());
        self.writer.write_all(&raw)?;
        Ok(())
    }

    fn close_raw(&mut self) -> Result<()> {
        if let Some(chunk) = self.open_raw.take() {
            let end = self.writer.stream_position()?;
            self.writer.seek(SeekFrom::Start(chunk.header_offset))?;
            self.write_chunk_header(CHUNK_TYPE_RAW, chunk.length, chunk.length)?;
            self.writer.seek(SeekFrom::Start(end))?;
        }
        Ok(())
    }

    /// Cover everything up to `offset` with a DONT_CARE chunk
    fn skip_to(&mut self, offset: u64) -> Result<()> {
        if offset == self.position {
            return Ok(())
        }
        self.close_raw()?;
        let length = offset - self.position;
        self.write_chunk_header(CHUNK_TYPE_DONT_CARE, length, 0)?;
        hash_pattern(&mut self.hasher, 0, length);
        self.total_chunks += 1;
        self.position = offset;
        Ok(())
    }

    pub fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_write(offset, data.len() as u64)?;
        self.skip_to(offset)?;
        let mut data = data;
        while ! data.is_empty() {
            let room = match &self.open_raw {
                Some(chunk) if chunk.length < MAX_RAW_CHUNK_BYTES =>
                    MAX_RAW_CHUNK_BYTES - chunk.length,
                _ => {
                    self.close_raw()?;
                    let header_offset = self.writer.stream_position()?;
                    self.writer.write_all(&[0; SIZE_CHUNK_HEADER])?;
                    self.open_raw = Some(OpenRawChunk { header_offset, length: 0 });
                    self.total_chunks += 1;
                    MAX_RAW_CHUNK_BYTES
                },
            };
            let size = room.min(data.len() as u64) as usize;
            let (head, tail) = data.split_at(size);
            self.writer.write_all(head)?;
            self.hasher.update(head);
            if let Some(chunk) = self.open_raw.as_mut() {
                chunk.length += size as u64
            }
            self.position += size as u64;
            data = tail;
        }
        Ok(())
    }

    pub fn write_fill(&mut self, offset: u64, length: u64, value: u32) -> Result<()> {
        self.check_write(offset, length)?;
        if length == 0 {
            return Ok(())
        }
        self.skip_to(offset)?;
        self.close_raw()?;
        self.write_chunk_header(CHUNK_TYPE_FILL, length, 4)?;
        self.writer.write_all(&value.to_le_bytes())?;
        hash_pattern(&mut self.hasher, value, length);
        self.total_chunks += 1;
        self.position += length;
        Ok(())
    }

    /// Pad to `total_size` and fill in the file header
    pub fn finish(mut self, total_size: u64) -> Result<W> {
        self.check_write(total_size, 0)?;
        self.skip_to(total_size)?;
        self.close_raw()?;
        let total_blocks = total_size / self.block_size as u64;
        if total_blocks > u32::MAX as u64 {
            return Err(SparseError::TooLarge { size: total_size }.into())
        }
        let mut raw = [0; SIZE_FILE_HEADER];
        raw[0..4].copy_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        raw[4..6].copy_from_slice(&SPARSE_MAJOR_VERSION.to_le_bytes());
        raw[6..8].copy_from_slice(&SPARSE_MINOR_VERSION.to_le_bytes());
        raw[8..10].copy_from_slice(&(SIZE_FILE_HEADER as u16).to_le_bytes());
        raw[10..12].copy_from_slice(&(SIZE_CHUNK_HEADER as u16).to_le_bytes());
        raw[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        raw[16..20].copy_from_slice(&(total_blocks as u32).to_le_bytes());
        raw[20..24].copy_from_slice(&self.total_chunks.to_le_bytes());
        raw[24..28].copy_from_slice(&self.hasher.clone().finalize().to_le_bytes());
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&raw)?;
        self.writer.seek(SeekFrom::End(0))?;
        self.writer.flush()?;
        debug!("Sparse image finished: {} chunks, {} blocks", self.total_chunks, total_blocks);
        Ok(self.writer)
    }
}
