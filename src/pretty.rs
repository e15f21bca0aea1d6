/*
lptools, to make, dump and unpack Android logical partition images: pretty printing module
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

/// Scale a byte count into the largest binary unit below 1024
pub(crate) fn human_size(bytes: u64) -> String {
    const SUFFIXES: [char; 7] = ['B', 'K', 'M', 'G', 'T', 'P', 'E'];
    let mut number = bytes as f64;
    let mut suffix_id = 0;
    while number >= 1024.0 && suffix_id < SUFFIXES.len() - 1 {
        number /= 1024.0;
        suffix_id += 1;
    }
    if suffix_id == 0 {
        format!("{}{}", bytes, SUFFIXES[0])
    } else {
        format!("{:.2}{}", number, SUFFIXES[suffix_id])
    }
}
