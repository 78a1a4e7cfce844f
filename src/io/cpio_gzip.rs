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

//! Gzip-compressed newc CPIO framing, as consumed by Linux's initramfs
//! concatenation (`Documentation/filesystems/ramfs-rootfs-initramfs.rst`).

use anyhow::{Context, Result};
use cpio::{write_cpio, NewcBuilder, NewcReader};
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

/// One named entry to be placed in the archive.
pub struct CpioEntry {
    pub name: String,
    pub mode: u32,
    pub content: Vec<u8>,
}

impl CpioEntry {
    pub fn new(name: impl Into<String>, mode: u32, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mode,
            content,
        }
    }
}

/// Build a gzip-compressed newc CPIO archive of `entries`, NUL-padded so its
/// total length is a multiple of 4.
pub fn build_gzip_cpio(entries: &[CpioEntry]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    write_cpio(
        entries
            .iter()
            .map(|e| (NewcBuilder::new(&e.name).mode(e.mode), Cursor::new(&e.content))),
        &mut encoder,
    )
    .context("writing CPIO archive")?;
    let mut out = encoder.finish().context("closing gzip compressor")?;
    let pad = (4 - out.len() % 4) % 4;
    out.extend(std::iter::repeat(0u8).take(pad));
    Ok(out)
}

/// Decode a gzip-compressed newc CPIO archive built by [`build_gzip_cpio`],
/// tolerating trailing NUL padding. Used by tests.
pub fn read_gzip_cpio(data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut decoder = GzDecoder::new(data);
    let mut result = BTreeMap::new();
    loop {
        let mut reader = NewcReader::new(decoder).context("reading CPIO entry")?;
        let entry = reader.entry();
        if entry.is_trailer() {
            break;
        }
        let name = entry.name().to_string();
        let mut buf = Vec::with_capacity(entry.file_size() as usize);
        reader
            .read_to_end(&mut buf)
            .context("reading CPIO entry contents")?;
        result.insert(name, buf);
        decoder = reader.finish().context("finishing reading CPIO entry")?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let entries = vec![
            CpioEntry::new("config.ign", 0o100_644, b"hello".to_vec()),
            CpioEntry::new("usr/lib/ignition/base.d/net.ign", 0o100_644, b"net".to_vec()),
        ];
        let archive = build_gzip_cpio(&entries).unwrap();
        assert_eq!(archive.len() % 4, 0);
        let decoded = read_gzip_cpio(&archive).unwrap();
        assert_eq!(decoded.get("config.ign").unwrap(), b"hello");
        assert_eq!(
            decoded.get("usr/lib/ignition/base.d/net.ign").unwrap(),
            b"net"
        );
    }

    #[test]
    fn length_is_multiple_of_four() {
        for len in 0..20 {
            let content = vec![b'x'; len];
            let archive =
                build_gzip_cpio(&[CpioEntry::new("config.ign", 0o100_644, content)]).unwrap();
            assert_eq!(archive.len() % 4, 0, "len={len}");
        }
    }
}
