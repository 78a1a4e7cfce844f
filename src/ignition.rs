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

//! Renders a caller-supplied ignition config (plus any side system-config
//! files) into the gzip+CPIO blob the live system unpacks at boot, and
//! locates where in a base ISO that blob must be overlaid.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::io::{build_gzip_cpio, CpioEntry};
use crate::iso9660::IsoFs;

/// Where the ignition region lives inside a base ISO, per `igninfo.json`.
const IGNINFO_PATH: &str = "COREOS/IGNINFO.JSO";
/// Fallback location on older media that never shipped `igninfo.json`:
/// a dedicated, pre-sized `ignition.img` file whose full extent is the
/// embeddable region.
const IGNITION_IMG_PATH: &str = "IMAGES/IGNITION.IMG";

/// `igninfo.json`'s schema: byte offset and length of the embeddable
/// region inside the ISO.
#[derive(Debug, Deserialize)]
struct IgnInfo {
    file: String,
    offset: u64,
    length: u64,
}

/// A rendered ignition payload: the primary config, plus any named
/// system-config side files (e.g. `nmstatectl`-consumed network configs)
/// that ride alongside it in the same archive.
pub struct IgnitionPayload {
    pub config: Option<Vec<u8>>,
    pub system_configs: BTreeMap<String, Vec<u8>>,
}

impl IgnitionPayload {
    pub fn new() -> Self {
        Self {
            config: None,
            system_configs: BTreeMap::new(),
        }
    }

    pub fn with_config(config: Vec<u8>) -> Self {
        Self {
            config: Some(config),
            system_configs: BTreeMap::new(),
        }
    }

    /// Add a side file. `name` must not contain a path separator: these
    /// files land flat alongside the primary config inside the archive.
    pub fn add_system_config(&mut self, name: impl Into<String>, content: Vec<u8>) -> Result<()> {
        let name = name.into();
        if name.contains('/') {
            bail!("system config name {name:?} must not contain a path separator");
        }
        self.system_configs.insert(name, content);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.config.is_none() && self.system_configs.is_empty()
    }

    /// Render to the gzip+CPIO bytes the live system expects to find in
    /// the embedded ignition region.
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut entries = Vec::new();
        if let Some(config) = &self.config {
            entries.push(CpioEntry::new("config.ign", 0o100_644, config.clone()));
        }
        for (name, content) in &self.system_configs {
            entries.push(CpioEntry::new(
                format!("usr/lib/ignition/base.d/{name}"),
                0o100_644,
                content.clone(),
            ));
        }
        build_gzip_cpio(&entries).context("rendering ignition archive")
    }
}

impl Default for IgnitionPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the (offset, length) of the embeddable ignition region in `iso`.
/// Tries `igninfo.json` first; on any failure to find or parse it, falls
/// back to the whole extent of `images/ignition.img`.
pub fn locate(iso: &mut IsoFs) -> Result<(u64, u64)> {
    match locate_via_igninfo(iso) {
        Ok(loc) => Ok(loc),
        Err(_) => locate_via_ignition_img(iso),
    }
}

fn locate_via_igninfo(iso: &mut IsoFs) -> Result<(u64, u64)> {
    let data = iso
        .read_file_at_path(IGNINFO_PATH)
        .context("reading igninfo")?;
    let info: IgnInfo = serde_json::from_slice(&data).context("parsing igninfo.json")?;
    // info.offset is relative to the start of info.file, not the ISO.
    let (container_offset, _container_len) = iso
        .file_info(&info.file)
        .with_context(|| format!("locating {}", info.file))?;
    Ok((container_offset + info.offset, info.length))
}

fn locate_via_ignition_img(iso: &mut IsoFs) -> Result<(u64, u64)> {
    let (offset, length) = iso
        .file_info(IGNITION_IMG_PATH)
        .with_context(|| format!("locating {IGNITION_IMG_PATH}"))?;
    Ok((offset, length as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_gzip_cpio;

    #[test]
    fn render_empty_payload() {
        let payload = IgnitionPayload::new();
        assert!(payload.is_empty());
        let bytes = payload.render().unwrap();
        let decoded = read_gzip_cpio(&bytes).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn render_config_and_system_configs() {
        let mut payload = IgnitionPayload::with_config(b"{\"ignition\":{}}".to_vec());
        payload
            .add_system_config("nmstatectl.yml", b"interfaces: []".to_vec())
            .unwrap();
        assert!(!payload.is_empty());
        let bytes = payload.render().unwrap();
        assert_eq!(bytes.len() % 4, 0);
        let decoded = read_gzip_cpio(&bytes).unwrap();
        assert_eq!(decoded.get("config.ign").unwrap(), b"{\"ignition\":{}}");
        assert_eq!(
            decoded
                .get("usr/lib/ignition/base.d/nmstatectl.yml")
                .unwrap(),
            b"interfaces: []"
        );
    }

    #[test]
    fn rejects_nested_system_config_name() {
        let mut payload = IgnitionPayload::new();
        let err = payload
            .add_system_config("dir/nmstatectl.yml", b"x".to_vec())
            .unwrap_err();
        assert!(err.to_string().contains("path separator"));
    }

    #[test]
    fn locate_via_igninfo_adds_container_offset() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("COREOS")).unwrap();
        std::fs::create_dir_all(src.join("images")).unwrap();
        std::fs::write(src.join("images/cdboot.img"), vec![0u8; 270_336]).unwrap();
        std::fs::write(
            src.join("COREOS/IGNINFO.JSO"),
            br#"{"file":"images/cdboot.img","offset":4096,"length":262144}"#,
        )
        .unwrap();
        let iso_path = dir.path().join("out.iso");
        if crate::iso9660::create(&iso_path, &src, "test-vol").is_err() {
            eprintln!("skipping locate_via_igninfo_adds_container_offset: xorriso not installed");
            return;
        }

        let mut iso = IsoFs::from_file(std::fs::File::open(&iso_path).unwrap()).unwrap();
        let (container_offset, _) = iso.file_info("images/cdboot.img").unwrap();
        let (offset, length) = locate(&mut iso).unwrap();
        assert_eq!(offset, container_offset + 4096);
        assert_eq!(length, 262144);
    }
}
