/*
lptools, to make, dump and unpack Android logical partition images: command line tests
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

use std::{path::Path, process::{Command, Output}};

const MIB: u64 = 1 << 20;

fn run<P: AsRef<Path>>(program: &str, args: &[P]) -> Output {
    Command::new(program).args(args.iter().map(|arg|arg.as_ref().as_os_str())).output().unwrap()
}

fn lpmake<P: AsRef<Path>>(args: &[P]) -> Output {
    run(env!("CARGO_BIN_EXE_lpmake"), args)
}

fn lpdump<P: AsRef<Path>>(args: &[P]) -> Output {
    run(env!("CARGO_BIN_EXE_lpdump"), args)
}

fn lpunpack<P: AsRef<Path>>(args: &[P]) -> Output {
    run(env!("CARGO_BIN_EXE_lpunpack"), args)
}

fn lpflash<P: AsRef<Path>>(args: &[P]) -> Output {
    run(env!("CARGO_BIN_EXE_lpflash"), args)
}

fn system_content() -> Vec<u8> {
    let mut content = vec![0; 10 * MIB as usize];
    for (index, byte) in content.iter_mut().enumerate().take(3 * MIB as usize) {
        *byte = (index % 241 + 7) as u8
    }
    content[9 * MIB as usize..].fill(0x5a);
    content
}

fn make_super(dir: &Path, extra: &[&str]) -> (std::path::PathBuf, Output) {
    let system = dir.join("system.raw");
    std::fs::write(&system, system_content()).unwrap();
    let output = dir.join("super.img");
    let mut args = vec![
        "--device-size=104857600".to_string(),
        "--metadata-size=4096".into(),
        "--metadata-slots=2".into(),
        "--partition=system:none:10485760".into(),
        format!("--image=system={}", system.display()),
        format!("--output={}", output.display()),
    ];
    args.extend(extra.iter().map(|arg|arg.to_string()));
    let result = lpmake(&args);
    (output, result)
}

#[test]
fn make_dump_unpack() {
    let dir = tempfile::tempdir().unwrap();
    let (image, result) = make_super(dir.path(), &[]);
    assert_eq!(result.status.code(), Some(0), "{}", String::from_utf8_lossy(&result.stderr));
    assert_eq!(std::fs::metadata(&image).unwrap().len(), 100 * MIB);

    let result = lpdump(&[Path::new("-j"), image.as_path()]);
    assert_eq!(result.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&result.stdout).unwrap();
    assert_eq!(report["partitions"][0]["name"], "system");
    assert_eq!(report["partitions"][0]["group_name"], "default");
    assert_eq!(report["partitions"][0]["size"], "10485760");
    assert_eq!(report["block_devices"][0]["name"], "super");
    assert_eq!(report["block_devices"][0]["size"], "104857600");

    let result = lpdump(&[image.as_path()]);
    assert_eq!(result.status.code(), Some(0));
    let text = String::from_utf8_lossy(&result.stdout);
    assert!(text.starts_with("Slot 0:"));
    assert!(text.contains("system"));

    let result = lpdump(&[Path::new("-d"), image.as_path()]);
    assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "1048576");

    let output = dir.path().join("out");
    std::fs::create_dir(&output).unwrap();
    let result = lpunpack(&[image.as_path(), output.as_path()]);
    assert_eq!(result.status.code(), Some(0), "{}", String::from_utf8_lossy(&result.stderr));
    let unpacked = std::fs::read(output.join("system.img")).unwrap();
    assert_eq!(unpacked.len() as u64, 10 * MIB);
    assert!(unpacked == system_content());
}

#[test]
fn empty_image_without_partition_images() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("super_empty.img");
    let result = lpmake(&[
        "-d", "104857600", "-m", "4096", "-s", "2", "-p", "system:readonly:4096",
        "-o", output.to_str().unwrap(),
    ]);
    assert_eq!(result.status.code(), Some(0));
    assert!(std::fs::metadata(&output).unwrap().len() < MIB);

    let result = lpdump(&[output.as_path()]);
    assert_eq!(result.status.code(), Some(0));
    let text = String::from_utf8_lossy(&result.stdout);
    assert!(!text.contains("Slot"));
    assert!(text.contains("readonly"));

    let device = dir.path().join("device.img");
    std::fs::File::create(&device).unwrap().set_len(100 * MIB).unwrap();
    let result = lpflash(&[device.as_path(), output.as_path()]);
    assert_eq!(result.status.code(), Some(0));
    let result = lpdump(&[Path::new("--all"), device.as_path()]);
    assert_eq!(result.status.code(), Some(0));
    let text = String::from_utf8_lossy(&result.stdout);
    assert!(text.contains("Slot 0:") && text.contains("Slot 1:"));
}

#[test]
fn usage_errors() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("super.img");
    let output = output.to_str().unwrap();
    let no_device = lpmake(&["-m", "4096", "-s", "2", "-p", "system:none:0", "-o", output]);
    assert_eq!(no_device.status.code(), Some(64));
    let both = lpmake(&["-d", "1048576", "-D", "super:1048576", "-m", "4096", "-s", "2",
        "-p", "system:none:0", "-o", output]);
    assert_eq!(both.status.code(), Some(64));
    let bad_attribute = lpmake(&["-d", "1048576", "-m", "4096", "-s", "2",
        "-p", "system:rw:0", "-o", output]);
    assert_eq!(bad_attribute.status.code(), Some(64));
    let too_large = lpmake(&["-d", "4194304", "-m", "4096", "-s", "2",
        "-p", "system:none:8388608", "-o", output]);
    assert_eq!(too_large.status.code(), Some(70));
    let unknown_group = lpmake(&["-d", "4194304", "-m", "4096", "-s", "2",
        "-p", "system:none:0:main", "-o", output]);
    assert_eq!(unknown_group.status.code(), Some(70));

    let missing = dir.path().join("missing.img");
    assert_eq!(lpdump(&[missing.as_path()]).status.code(), Some(66));
    let json = lpdump(&[Path::new("--json"), missing.as_path()]);
    assert_eq!(json.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&json.stdout).trim(), "{}");
    assert_eq!(lpdump(&[Path::new("--all"), Path::new("--json"), missing.as_path()])
        .status.code(), Some(64));
    assert_eq!(lpunpack(&[missing.as_path()]).status.code(), Some(71));
}

#[test]
fn sparse_super_is_refused_by_lpunpack() {
    let dir = tempfile::tempdir().unwrap();
    let (image, result) = make_super(dir.path(), &["--sparse"]);
    assert_eq!(result.status.code(), Some(0), "{}", String::from_utf8_lossy(&result.stderr));
    assert!(std::fs::metadata(&image).unwrap().len() < 100 * MIB);
    let result = lpunpack(&[image.as_path(), dir.path()]);
    assert_eq!(result.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&result.stderr).contains("sparse"));
}
