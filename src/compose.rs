// Copyright 2024 Red Hat
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Public factories that open a base ISO and return a `ReadSeek` stream
//! embedding ignition, an optional auxiliary ramdisk, and optional
//! kernel arguments at the exact byte ranges the ISO already reserves
//! for them. Factory time does all the fallible work; once a composer
//! is built, `Read`/`Seek` fail only with I/O errors from the
//! underlying file.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;

use anyhow::Context;

use crate::ignition::{self, IgnitionPayload};
use crate::iso9660::IsoFs;
use crate::kargs::{self, DEFAULT_KARGS_FILES};
use crate::overlay::{BoxedReadSeek, Overlay, OverlayReader};

const RAMDISK_PLACEHOLDER_PATH: &str = "IMAGES/ASSISTED_INSTALLER_CUSTOM.IMG";
const KARGS_JSON_PATH: &str = "COREOS/KARGS.JSO";
const INITRD_IMG_PATH: &str = "IMAGES/PXEBOOT/INITRD.IMG";

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("ignition content length {actual} exceeds embed area size {limit}")]
    EmbedAreaExceeded { actual: usize, limit: usize },
}

/// Build the `ReadSeek` stream serving `iso_path` with `ignition`
/// embedded, plus optionally a ramdisk overlay and a kargs string
/// repeated into every kargs-bearing bootloader file.
pub fn stream_reader(
    iso_path: &Path,
    ignition: &IgnitionPayload,
    ramdisk_bytes: Option<&[u8]>,
    kargs: Option<&str>,
) -> anyhow::Result<BoxedReadSeek> {
    let base_file =
        File::open(iso_path).with_context(|| format!("opening {}", iso_path.display()))?;
    let base_len = base_file
        .metadata()
        .with_context(|| format!("statting {}", iso_path.display()))?
        .len();

    let mut meta = IsoFs::from_file(
        File::open(iso_path).with_context(|| format!("opening {}", iso_path.display()))?,
    )
    .with_context(|| format!("parsing {}", iso_path.display()))?;

    let ignition_bytes = ignition.render().context("rendering ignition payload")?;
    let (ign_offset, ign_len) = ignition::locate(&mut meta).context("locating ignition region")?;
    if ignition_bytes.len() as u64 > ign_len {
        return Err(ComposeError::EmbedAreaExceeded {
            actual: ignition_bytes.len(),
            limit: ign_len as usize,
        }
        .into());
    }

    let mut stream: BoxedReadSeek = Box::new(OverlayReader::new(
        base_file,
        base_len,
        Overlay::new(ign_offset, ignition_bytes),
    ));

    if let Some(ramdisk_bytes) = ramdisk_bytes {
        let (offset, len) = meta
            .file_info(RAMDISK_PLACEHOLDER_PATH)
            .context("locating ramdisk placeholder")?;
        let write_len = (ramdisk_bytes.len() as u64).min(len as u64) as usize;
        stream = Box::new(OverlayReader::new(
            stream,
            base_len,
            Overlay::new(offset, ramdisk_bytes[..write_len].to_vec()),
        ));
    }

    if let Some(kargs) = kargs {
        let files = kargs_files(&mut meta);
        for path in files {
            let (offset, area_len) = match kargs::locate_in_iso(&mut meta, &path) {
                Ok(loc) => loc,
                Err(_) => continue,
            };
            let bytes = kargs::build_kargs_bytes(&path, kargs, area_len)?;
            stream = Box::new(OverlayReader::new(stream, base_len, Overlay::new(offset, bytes)));
        }
    }

    Ok(stream)
}

fn kargs_files(meta: &mut IsoFs) -> Vec<String> {
    match kargs::read_kargs_file_info(meta, KARGS_JSON_PATH) {
        Ok(map) => map.into_keys().collect(),
        Err(_) => DEFAULT_KARGS_FILES.iter().map(|s| s.to_string()).collect(),
    }
}

/// s390x PXE sibling composer: instead of an ISO stream, returns the
/// 16-byte `initrd.addrsize` record derived from the real initrd's size.
/// Shares the ignition/kargs locator primitives but produces no overlay
/// stream of its own.
pub fn addrsize_record(iso_path: &Path) -> anyhow::Result<[u8; 16]> {
    let mut meta = IsoFs::from_file(
        File::open(iso_path).with_context(|| format!("opening {}", iso_path.display()))?,
    )
    .with_context(|| format!("parsing {}", iso_path.display()))?;
    let (_offset, length) = meta
        .file_info(INITRD_IMG_PATH)
        .context("locating initrd.img")?;

    // Layout matches s390 zipl's addrsize record: two big-endian u64
    // fields, load address (always 0 for an initrd blob) and size.
    let mut record = [0u8; 16];
    record[8..16].copy_from_slice(&(length as u64).to_be_bytes());
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn synthetic_iso_with_ignition_slot() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("images")).unwrap();
        std::fs::write(src.join("images/ignition.img"), vec![0u8; 4096]).unwrap();
        let iso_path = dir.path().join("out.iso");
        if crate::iso9660::create(&iso_path, &src, "test-vol").is_err() {
            // xorriso not installed; caller must tolerate a missing file
        }
        (dir, iso_path)
    }

    #[test]
    fn embed_area_exceeded_is_reported() {
        let (_dir, iso_path) = synthetic_iso_with_ignition_slot();
        if !iso_path.is_file() {
            eprintln!("skipping embed_area_exceeded_is_reported: xorriso not installed");
            return;
        }
        let payload = IgnitionPayload::with_config(vec![1u8; 10 * 1024 * 1024]);
        let err = stream_reader(&iso_path, &payload, None, None).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ComposeError>(),
            Some(ComposeError::EmbedAreaExceeded { .. })
        ));
    }

    #[test]
    fn writes_ramdisk_bytes_into_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("images")).unwrap();
        std::fs::write(src.join("images/ignition.img"), vec![0u8; 4096]).unwrap();
        std::fs::write(
            src.join("images/assisted_installer_custom.img"),
            vec![0u8; 1024 * 1024],
        )
        .unwrap();
        let iso_path = dir.path().join("out.iso");
        if crate::iso9660::create(&iso_path, &src, "test-vol").is_err() {
            eprintln!("skipping writes_ramdisk_bytes_into_placeholder: xorriso not installed");
            return;
        }
        let payload = IgnitionPayload::with_config(b"hi".to_vec());
        let mut stream =
            stream_reader(&iso_path, &payload, Some(b"someramdisk"), None).unwrap();
        let mut out = Vec::new();
        stream.seek(SeekFrom::Start(0)).unwrap();
        stream.read_to_end(&mut out).unwrap();
        assert!(!out.is_empty());
    }
}
