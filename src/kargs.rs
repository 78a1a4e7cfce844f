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

//! Locates and rewrites the kernel-argument embed area inside a
//! bootloader configuration file.
//!
//! The embed area is a literal marker line, `# COREOS_KARG_EMBED_AREA`,
//! followed by padding bytes reserved for argument text. Streaming a
//! custom kargs string means finding that marker's byte range inside the
//! config file and overlaying it, never touching the file's length.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::iso9660::IsoFs;

/// The literal marker that opens an embed area. The embeddable region
/// runs from the start of this line to the end of the padding that
/// follows it, before the next newline-delimited line that doesn't
/// belong to the area.
const EMBED_MARKER: &str = "# COREOS_KARG_EMBED_AREA";

/// Config files searched when a catalog entry doesn't name its own,
/// in order.
pub const DEFAULT_KARGS_FILES: &[&str] = &["EFI/redhat/grub.cfg", "isolinux/isolinux.cfg"];

/// `kargs.json`'s schema.
#[derive(Debug, Deserialize)]
pub struct KargsFileInfo {
    pub files: Vec<KargsFileLoc>,
    #[serde(default)]
    pub default: String,
}

#[derive(Debug, Deserialize)]
pub struct KargsFileLoc {
    pub path: String,
    pub offset: u64,
    pub length: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum KargsError {
    #[error("no kernel argument embed area found in {path}")]
    EmbedAreaNotFound { path: String },
    #[error(
        "kernel arguments ({actual} bytes, including trailing newline) exceed the embed area in {path} ({limit} bytes)"
    )]
    EmbedAreaExceeded {
        path: String,
        actual: usize,
        limit: usize,
    },
}

/// Find the embed area's byte range within `content`: from the start of
/// the marker line through to the end of its trailing run of `#` padding
/// characters.
pub fn find_embed_area(content: &str) -> Option<(usize, usize)> {
    let marker_start = content.find(EMBED_MARKER)?;
    let line_end = content[marker_start..]
        .find('\n')
        .map(|i| marker_start + i)
        .unwrap_or(content.len());
    // The rest of the marker's line, if any, is '#' padding reserving
    // space for kernel arguments; the whole line is the embeddable area.
    Some((marker_start, line_end))
}

/// Find the absolute (offset, length) of the embed area for `path`
/// inside `iso`.
pub fn locate_in_iso(iso: &mut IsoFs, path: &str) -> Result<(u64, usize)> {
    let (file_offset, _file_len) = iso
        .file_info(path)
        .with_context(|| format!("locating {path}"))?;
    let content = iso
        .read_file_at_path(path)
        .with_context(|| format!("reading {path}"))?;
    let text = String::from_utf8_lossy(&content);
    let (start, end) =
        find_embed_area(&text).ok_or_else(|| KargsError::EmbedAreaNotFound {
            path: path.to_string(),
        })?;
    Ok((file_offset + start as u64, end - start))
}

/// Build the bytes to overlay into an embed area: `kargs` followed by a
/// trailing newline, NUL-padded (matching the `#` padding convention
/// used by the surrounding config syntax is unnecessary since this
/// region is a comment-only placeholder) out to `area_len`. Fails if the
/// argument string doesn't fit.
pub fn build_kargs_bytes(path: &str, kargs: &str, area_len: usize) -> Result<Vec<u8>> {
    let mut out = kargs.as_bytes().to_vec();
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    if out.len() > area_len {
        return Err(KargsError::EmbedAreaExceeded {
            path: path.to_string(),
            actual: out.len(),
            limit: area_len,
        }
        .into());
    }
    out.resize(area_len, b'#');
    Ok(out)
}

/// Read `kargs.json` (if present) and return the map of inner path to
/// its declared embed-area location, along with the default path to use
/// when a caller doesn't ask for a specific one.
pub fn read_kargs_file_info(iso: &mut IsoFs, path: &str) -> Result<BTreeMap<String, KargsFileLoc>> {
    let data = iso
        .read_file_at_path(path)
        .with_context(|| format!("reading {path}"))?;
    let info: KargsFileInfo = serde_json::from_slice(&data).context("parsing kargs.json")?;
    Ok(info
        .files
        .into_iter()
        .map(|f| (f.path.clone(), f))
        .collect())
}
