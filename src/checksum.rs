/*
lptools, to make, dump and unpack Android logical partition images: sha256 checksum module
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

use std::fmt::Display;

use sha2::{Digest, Sha256};

pub(crate) const SIZE_SHA256SUM: usize = 32;

type Sha256sumByteArray = [u8; SIZE_SHA256SUM];

#[derive(Default, Debug, PartialEq, Eq, Clone, Copy)]
pub struct Sha256sum(Sha256sumByteArray);

impl Sha256sum {
    pub(crate) fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Digest of `data` as if the `len` bytes starting at `zeroed_at` were
    /// all zero, the way both on-disk checksum fields are defined
    pub(crate) fn from_data_with_hole(data: &[u8], zeroed_at: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&data[..zeroed_at]);
        hasher.update([0; SIZE_SHA256SUM]);
        hasher.update(&data[zeroed_at + SIZE_SHA256SUM..]);
        Self(hasher.finalize().into())
    }

    pub(crate) fn from_slice(slice: &[u8]) -> Self {
        let mut bytes = Sha256sumByteArray::default();
        bytes.copy_from_slice(&slice[..SIZE_SHA256SUM]);
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &Sha256sumByteArray {
        &self.0
    }
}

impl Display for Sha256sum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hole_digest_matches_zeroed_copy() {
        let mut data = vec![0x5au8; 100];
        let zeroed = {
            let mut copy = data.clone();
            copy[10..42].fill(0);
            copy
        };
        data[10..42].copy_from_slice(&[0xff; 32]);
        assert_eq!(Sha256sum::from_data_with_hole(&data, 10),
            Sha256sum::from_data(&zeroed));
    }

    #[test]
    fn display_is_lowercase_hex() {
        let sum = Sha256sum::from_data(b"");
        assert_eq!(sum.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
