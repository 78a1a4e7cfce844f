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

//! Builds the minimal-ISO template a base full ISO is reduced to: strip
//! the heavy rootfs, rewrite bootloader configs to fetch it over HTTP,
//! and leave placeholder slots for per-request ignition and ramdisk
//! overlays.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::iso9660;
use crate::kargs::find_embed_area;

const ROOTFS_IMG_REL: &str = "images/pxeboot/rootfs.img";
const RAMDISK_PLACEHOLDER_REL: &str = "images/assisted_installer_custom.img";
const NMSTATE_IMG_REL: &str = "images/nmstate.img";
const KARGS_JSON_REL: &str = "coreos/kargs.json";
const RAMDISK_PLACEHOLDER_SIZE: u64 = 1024 * 1024;

const BOOTLOADER_CONFIGS: &[&str] = &[
    "EFI/redhat/grub.cfg",
    "EFI/fedora/grub.cfg",
    "EFI/centos/grub.cfg",
    "boot/grub/grub.cfg",
    "isolinux/isolinux.cfg",
];

/// Build the minimal-ISO template for `full_iso_path` at `output_path`.
/// `arch` gates `isolinux.cfg` rewriting, which doesn't apply to
/// ppc64le media. `nmstate_cache`, if given, is copied into the
/// extracted tree and referenced from the rewritten initrd list.
pub fn build(
    full_iso_path: &Path,
    output_path: &Path,
    root_fs_url: &str,
    arch: &str,
    nmstate_cache: Option<&Path>,
) -> Result<()> {
    if root_fs_url.contains('$') || root_fs_url.contains('\\') {
        bail!("rootfs URL {root_fs_url:?} must not contain '$' or '\\'");
    }

    let workdir = tempfile::tempdir().context("creating build work directory")?;
    let extract_dir = workdir.path().join("iso");
    fs::create_dir_all(&extract_dir).context("creating extraction directory")?;

    iso9660::extract(full_iso_path, &extract_dir)
        .with_context(|| format!("extracting {}", full_iso_path.display()))?;
    let volume_id = iso9660::volume_identifier(full_iso_path)
        .with_context(|| format!("reading volume identifier of {}", full_iso_path.display()))?;

    let has_nmstate = if let Some(nmstate_cache) = nmstate_cache {
        let dest = extract_dir.join(NMSTATE_IMG_REL);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("creating images directory")?;
        }
        fs::copy(nmstate_cache, &dest).with_context(|| format!("copying {}", dest.display()))?;
        true
    } else {
        false
    };

    let rootfs_path = extract_dir.join(ROOTFS_IMG_REL);
    if rootfs_path.is_file() {
        fs::remove_file(&rootfs_path)
            .with_context(|| format!("removing {}", rootfs_path.display()))?;
    }

    let placeholder_path = extract_dir.join(RAMDISK_PLACEHOLDER_REL);
    if let Some(parent) = placeholder_path.parent() {
        fs::create_dir_all(parent).context("creating images directory")?;
    }
    write_zero_file(&placeholder_path, RAMDISK_PLACEHOLDER_SIZE)
        .with_context(|| format!("writing {}", placeholder_path.display()))?;

    let mut initrd_entries = vec![RAMDISK_PLACEHOLDER_REL.to_string()];
    if has_nmstate {
        initrd_entries.push(NMSTATE_IMG_REL.to_string());
    }

    let mut rewritten = Vec::new();
    for rel in BOOTLOADER_CONFIGS {
        if *rel == "isolinux/isolinux.cfg" && arch == "ppc64le" {
            continue;
        }
        let path = extract_dir.join(rel);
        if !path.is_file() {
            continue;
        }
        let original = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let is_isolinux = rel.ends_with("isolinux.cfg");
        let updated = rewrite_bootloader_config(&original, root_fs_url, &initrd_entries, is_isolinux);
        fs::write(&path, &updated).with_context(|| format!("writing {}", path.display()))?;
        rewritten.push((rel.to_string(), original.len(), updated.len()));
    }

    let kargs_json_path = extract_dir.join(KARGS_JSON_REL);
    if kargs_json_path.is_file() {
        update_kargs_json(&kargs_json_path, &extract_dir, &rewritten)
            .with_context(|| format!("updating {}", kargs_json_path.display()))?;
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    iso9660::create(output_path, &extract_dir, &volume_id)
        .with_context(|| format!("authoring {}", output_path.display()))?;
    Ok(())
}

fn write_zero_file(path: &Path, size: u64) -> Result<()> {
    let file = fs::File::create(path)?;
    file.set_len(size)?;
    Ok(())
}

/// Strip any `coreos.liveiso=<value>` token from the kernel-argument
/// line (grub's `linux …` line, isolinux's `append …` line), append
/// `coreos.live.rootfs_url="<root_fs_url>"` to it, and fold each of
/// `initrd_entries` into the initrd list: grub lists initrd images on
/// their own `initrd …` line, while isolinux/PXELINUX packs them into
/// an `initrd=a,b,c` parameter on the same `append` line as the kernel
/// arguments.
fn rewrite_bootloader_config(
    content: &str,
    root_fs_url: &str,
    initrd_entries: &[String],
    is_isolinux: bool,
) -> String {
    if is_isolinux {
        return rewrite_isolinux_append(content, root_fs_url, initrd_entries);
    }

    let mut out = String::with_capacity(content.len() + 256);
    for line in content.split_inclusive('\n') {
        let trimmed_start = line.trim_start();
        if starts_with_word(trimmed_start, "linux") {
            let (body, newline) = split_trailing_newline(line);
            let without_liveiso = remove_liveiso_token(body);
            out.push_str(without_liveiso.trim_end());
            out.push_str(&format!(" coreos.live.rootfs_url=\"{root_fs_url}\""));
            out.push_str(newline);
        } else if starts_with_word(trimmed_start, "initrd") {
            let (body, newline) = split_trailing_newline(line);
            out.push_str(body.trim_end());
            for entry in initrd_entries {
                out.push(' ');
                out.push_str(entry);
            }
            out.push_str(newline);
        } else {
            out.push_str(line);
        }
    }
    out
}

/// Rewrite isolinux/PXELINUX's single `append …` line: strip
/// `coreos.liveiso=`, fold `initrd_entries` into its `initrd=` token
/// (creating one at the end if absent), and append
/// `coreos.live.rootfs_url="<root_fs_url>"`.
fn rewrite_isolinux_append(content: &str, root_fs_url: &str, initrd_entries: &[String]) -> String {
    let mut out = String::with_capacity(content.len() + 256);
    for line in content.split_inclusive('\n') {
        let trimmed_start = line.trim_start();
        if starts_with_word(trimmed_start, "append") {
            let (body, newline) = split_trailing_newline(line);
            let without_liveiso = remove_liveiso_token(body);
            let with_initrd = add_initrd_tokens(&without_liveiso, initrd_entries);
            out.push_str(with_initrd.trim_end());
            out.push_str(&format!(" coreos.live.rootfs_url=\"{root_fs_url}\""));
            out.push_str(newline);
        } else {
            out.push_str(line);
        }
    }
    out
}

/// Fold `entries` into `line`'s `initrd=` token, comma-joined after
/// whatever's already there; if no such token exists, add one at the
/// end of the line.
fn add_initrd_tokens(line: &str, entries: &[String]) -> String {
    if entries.is_empty() {
        return line.to_string();
    }
    let mut found = false;
    let mut tokens: Vec<String> = line
        .split_whitespace()
        .map(|tok| {
            if let Some(existing) = tok.strip_prefix("initrd=") {
                found = true;
                let mut value = existing.to_string();
                for entry in entries {
                    value.push(',');
                    value.push_str(entry);
                }
                format!("initrd={value}")
            } else {
                tok.to_string()
            }
        })
        .collect();
    if !found {
        tokens.push(format!("initrd={}", entries.join(",")));
    }
    tokens.join(" ")
}

fn starts_with_word(s: &str, word: &str) -> bool {
    s.strip_prefix(word)
        .map(|rest| rest.starts_with(char::is_whitespace))
        .unwrap_or(false)
}

fn split_trailing_newline(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

fn remove_liveiso_token(line: &str) -> String {
    line.split_whitespace()
        .filter(|tok| !tok.starts_with("coreos.liveiso="))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Re-derive each file's embed-area `offset`/`length` from the rewritten
/// bootloader config on disk, keeping `kargs.json` consistent with the
/// rewrites `rewrite_bootloader_config` just performed.
fn update_kargs_json(
    kargs_json_path: &Path,
    extract_dir: &Path,
    rewritten: &[(String, usize, usize)],
) -> Result<()> {
    let data = fs::read(kargs_json_path)?;
    let mut value: Value = serde_json::from_slice(&data).context("parsing kargs.json")?;
    let files = match value.get_mut("files").and_then(Value::as_array_mut) {
        Some(files) => files,
        None => return Ok(()),
    };

    for file_entry in files.iter_mut() {
        let Some(path) = file_entry.get("path").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let matches_rewrite = rewritten.iter().any(|(rel, _, _)| path.ends_with(rel.as_str()));
        if !matches_rewrite {
            continue;
        }
        let on_disk = extract_dir.join(path.trim_start_matches('/'));
        let content = fs::read_to_string(&on_disk)
            .with_context(|| format!("reading {}", on_disk.display()))?;
        if let Some((start, end)) = find_embed_area(&content) {
            if let Some(obj) = file_entry.as_object_mut() {
                obj.insert("offset".to_string(), Value::from(start as u64));
                obj.insert("length".to_string(), Value::from((end - start) as u64));
            }
        }
    }

    fs::write(
        kargs_json_path,
        serde_json::to_vec_pretty(&value).context("re-encoding kargs.json")?,
    )
    .context("writing kargs.json")
}
