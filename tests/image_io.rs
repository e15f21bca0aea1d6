/*
lptools, to make, dump and unpack Android logical partition images: image I/O tests
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

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::Path,
};

use lptools::{
    builder::MetadataBuilder,
    extractor::{ExtractError, ImageExtractor},
    format::{FormatError, Metadata, PARTITION_RESERVED_BYTES},
    reader::{is_empty_super_image, read_from_image_file, read_image_metadata,
        try_read_metadata},
    utility::{backup_metadata_offset, primary_metadata_offset},
    writer::{flash_partition_table, write_empty_image_file, write_to_image_file},
    Error,
};

const MIB: u64 = 1 << 20;

fn sample_metadata() -> Metadata {
    let mut builder = MetadataBuilder::with_device_size(4 * MIB, 4096, 2).unwrap();
    builder.add_group("main", 2 * MIB).unwrap();
    let system = builder.add_partition("system", "main", 0).unwrap();
    builder.resize_partition(system, 40960).unwrap();
    let vendor = builder.add_partition("vendor", "default", 0).unwrap();
    builder.resize_partition(vendor, 8192).unwrap();
    builder.add_partition("odm", "default", 0).unwrap();
    builder.export().unwrap()
}

fn system_content() -> Vec<u8> {
    let mut content: Vec<u8> = (0..40960u32).map(|value|(value % 253 + 1) as u8).collect();
    content[8192..20480].fill(0);
    content
}

fn full_image(dir: &Path, metadata: &Metadata) -> std::path::PathBuf {
    let system = dir.join("system.raw");
    std::fs::write(&system, system_content()).unwrap();
    let images = BTreeMap::from([("system".to_string(), system)]);
    let path = dir.join("super.img");
    write_to_image_file(&path, metadata, 4096, &images, false).unwrap();
    path
}

fn corrupt(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[0xff; 16]).unwrap();
}

#[test]
fn full_image_reads_back() {
    let metadata = sample_metadata();
    let dir = tempfile::tempdir().unwrap();
    let path = full_image(dir.path(), &metadata);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * MIB);
    assert!(!is_empty_super_image(&path).unwrap());
    for slot in 0..2 {
        assert_eq!(read_image_metadata(&path, slot).unwrap(), metadata);
    }
}

#[test]
fn corrupt_primary_falls_back_to_backup() {
    let metadata = sample_metadata();
    let dir = tempfile::tempdir().unwrap();
    let path = full_image(dir.path(), &metadata);
    corrupt(&path, PARTITION_RESERVED_BYTES);
    corrupt(&path, primary_metadata_offset(&metadata.geometry, 0));
    let mut file = File::open(&path).unwrap();
    assert_eq!(try_read_metadata(&mut file, 0).unwrap(), metadata);

    corrupt(&path, primary_metadata_offset(&metadata.geometry, 1));
    corrupt(&path, backup_metadata_offset(&metadata.geometry, 1));
    let mut file = File::open(&path).unwrap();
    assert!(try_read_metadata(&mut file, 1).is_err());
    assert_eq!(try_read_metadata(&mut file, 0).unwrap(), metadata);
}

#[test]
fn slot_out_of_range() {
    let metadata = sample_metadata();
    let dir = tempfile::tempdir().unwrap();
    let path = full_image(dir.path(), &metadata);
    let mut file = File::open(&path).unwrap();
    assert!(matches!(try_read_metadata(&mut file, 2),
        Err(Error::FormatError(FormatError::SlotOutOfRange { slot: 2, count: 2 }))));
}

#[test]
fn empty_image_round_trip() {
    let metadata = sample_metadata();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("super_empty.img");
    write_empty_image_file(&path, &metadata).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096 + metadata.encoded_size());
    assert!(is_empty_super_image(&path).unwrap());
    assert_eq!(read_from_image_file(&path).unwrap(), metadata);
    assert_eq!(read_image_metadata(&path, 0).unwrap(), metadata);
}

#[test]
fn flashing_keeps_partition_data() {
    let metadata = sample_metadata();
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("device.img");
    {
        let mut file = File::create(&device).unwrap();
        file.set_len(4 * MIB).unwrap();
        file.seek(SeekFrom::Start(2 * MIB)).unwrap();
        file.write_all(b"partition data").unwrap();
    }
    flash_partition_table(&device, &metadata).unwrap();
    let mut file = File::open(&device).unwrap();
    for slot in 0..2 {
        assert_eq!(try_read_metadata(&mut file, slot).unwrap(), metadata);
    }
    let data = std::fs::read(&device).unwrap();
    assert_eq!(&data[2 * MIB as usize..2 * MIB as usize + 14], b"partition data");
}

#[test]
fn extracted_partitions_match_source() {
    let metadata = sample_metadata();
    let dir = tempfile::tempdir().unwrap();
    let path = full_image(dir.path(), &metadata);
    let output = dir.path().join("out");
    std::fs::create_dir(&output).unwrap();
    let mut extractor = ImageExtractor::new(File::open(&path).unwrap(), metadata, &[])
        .unwrap();
    assert_eq!(extractor.partition_names().collect::<Vec<_>>(), ["odm", "system", "vendor"]);
    extractor.extract(&output).unwrap();
    assert_eq!(std::fs::read(output.join("system.img")).unwrap(), system_content());
    assert_eq!(std::fs::read(output.join("vendor.img")).unwrap(), vec![0; 8192]);
    assert_eq!(std::fs::metadata(output.join("odm.img")).unwrap().len(), 0);
}

#[test]
fn selected_partitions_only() {
    let metadata = sample_metadata();
    let dir = tempfile::tempdir().unwrap();
    let path = full_image(dir.path(), &metadata);
    let names = vec!["vendor".to_string()];
    let mut extractor = ImageExtractor::new(File::open(&path).unwrap(), metadata.clone(),
        &names).unwrap();
    extractor.extract(dir.path()).unwrap();
    assert!(dir.path().join("vendor.img").exists());
    assert!(!dir.path().join("system.img").exists());

    let names = vec!["vendor".to_string(), "product".to_string(), "boot".to_string()];
    match ImageExtractor::new(File::open(&path).unwrap(), metadata, &names) {
        Err(Error::ExtractError(ExtractError::PartitionsNotFound { names })) =>
            assert_eq!(names, ["boot", "product"]),
        other => panic!("unexpected result: {:?}", other.map(|_|())),
    }
}
