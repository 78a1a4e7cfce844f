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

//! Extracts the `nmstatectl` binary from a full ISO's rootfs so it can be
//! re-packaged as a standalone CPIO archive for minimal-ISO boot.
//!
//! The path from ISO to binary is: `images/pxeboot/rootfs.img` is an
//! outer gzip+CPIO archive; one of its members is a squashfs or erofs
//! image of the live root filesystem; `usr/bin/nmstatectl` lives inside
//! that nested filesystem.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tempfile::tempdir;

use crate::io::{build_gzip_cpio, CpioEntry, Initrd};
use crate::iso9660::IsoFs;
use crate::util::cmd_output;

const ROOTFS_IMG_PATH: &str = "IMAGES/PXEBOOT/ROOTFS.IMG";
const NMSTATECTL_INNER_PATH: &str = "usr/bin/nmstatectl";

/// Which nested filesystem format the rootfs squashfs/erofs member uses.
/// Either may appear depending on the RHCOS build; both are handled by
/// shelling out to their respective read-only extraction tools rather
/// than hand-rolling parsers for either format, the same tradeoff
/// `iso9660::create` makes for El-Torito authoring.
enum NestedFs {
    Squashfs,
    Erofs,
}

impl NestedFs {
    fn detect(member_path: &str) -> Result<Self> {
        if member_path.ends_with(".squashfs") || member_path.ends_with("root.squashfs") {
            Ok(Self::Squashfs)
        } else if member_path.ends_with(".erofs") || member_path.ends_with("root.erofs") {
            Ok(Self::Erofs)
        } else {
            bail!("unrecognized nested filesystem member {member_path:?}")
        }
    }

    fn extract_file(&self, image_path: &Path, inner_path: &str, dest: &Path) -> Result<()> {
        match self {
            Self::Squashfs => {
                let mut cmd = Command::new("unsquashfs");
                cmd.arg("-f")
                    .arg("-d")
                    .arg(dest)
                    .arg(image_path)
                    .arg(inner_path);
                cmd_output(&mut cmd).context("running unsquashfs")?;
            }
            Self::Erofs => {
                let mut cmd = Command::new("fsck.erofs");
                cmd.arg(format!("--extract={}", dest.display()))
                    .arg(image_path);
                cmd_output(&mut cmd).context("running fsck.erofs")?;
            }
        }
        Ok(())
    }
}

/// Extract `nmstatectl` from `iso` and return it packaged as the
/// gzip+CPIO archive the minimal-ISO's auxiliary ramdisk expects.
pub fn extract_nmstatectl_archive(iso: &mut IsoFs) -> Result<Vec<u8>> {
    let rootfs_img = iso
        .read_file_at_path(ROOTFS_IMG_PATH)
        .with_context(|| format!("reading {ROOTFS_IMG_PATH}"))?;
    let outer = Initrd::from_reader(&rootfs_img[..])
        .context("decoding rootfs.img outer CPIO archive")?;
    let (member_path, member_bytes) = outer
        .find_by_suffix(".squashfs")
        .or_else(|| outer.find_by_suffix(".erofs"))
        .context("rootfs.img has no nested squashfs or erofs member")?;
    let fs_kind = NestedFs::detect(member_path)?;

    let workdir = tempdir().context("creating extraction tempdir")?;
    let image_path = workdir.path().join("root-image");
    fs::write(&image_path, member_bytes).context("writing nested filesystem image")?;

    let out_dir = workdir.path().join("out");
    fs::create_dir_all(&out_dir).context("creating extraction output directory")?;
    fs_kind.extract_file(&image_path, NMSTATECTL_INNER_PATH, &out_dir)?;

    let extracted_path = out_dir.join(NMSTATECTL_INNER_PATH);
    let contents = fs::read(&extracted_path)
        .with_context(|| format!("reading extracted {}", extracted_path.display()))?;

    build_gzip_cpio(&[CpioEntry::new("usr/bin/nmstatectl", 0o100_755, contents)])
        .context("packaging nmstatectl archive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_squashfs_by_suffix() {
        assert!(matches!(
            NestedFs::detect("usr/share/ostree/root.squashfs").unwrap(),
            NestedFs::Squashfs
        ));
    }

    #[test]
    fn detects_erofs_by_suffix() {
        assert!(matches!(
            NestedFs::detect("usr/share/ostree/root.erofs").unwrap(),
            NestedFs::Erofs
        ));
    }

    #[test]
    fn rejects_unknown_suffix() {
        assert!(NestedFs::detect("usr/share/ostree/root.ext4").is_err());
    }
}
