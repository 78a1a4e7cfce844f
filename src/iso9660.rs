// Copyright 2021 Red Hat, Inc.
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

//! Minimal ISO 9660 parser. This is not a comprehensive parser; we only
//! parse out the fields we care about. Extensions such as Rock Ridge
//! and Joliet are not supported.
//!
//! The official specification is not free. The primary reference used
//! for this module is https://wiki.osdev.org/ISO_9660.

// An initial version of this module used the zerocopy crate to try to deserialize directly from
// the on-disk ISO file in with zero copying. It works, but it's non-trivial and the performance
// difference from just copying stuff didn't justify it.

// Many magic numbers corresponding to offsets and lengths have not been const-ified. It should be
// straightforward to see to what they correspond using the referenced linked above.

use std::fs;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use crate::io::*;
use crate::util::cmd_output;

// technically the standard supports others, but this is the only one we support
const ISO9660_SECTOR_SIZE: usize = 2048;

#[derive(Debug, Serialize)]
pub struct IsoFs {
    descriptors: Vec<VolumeDescriptor>,
    #[serde(skip_serializing)]
    file: fs::File,
}

impl IsoFs {
    pub fn from_file(mut file: fs::File) -> Result<Self> {
        let length = file.metadata()?.len();
        let descriptors = get_volume_descriptors(&mut file)?;
        let iso_fs = Self { descriptors, file };
        let primary = iso_fs.get_primary_volume_descriptor()?;
        if primary.volume_space_size * ISO9660_SECTOR_SIZE as u64 > length {
            bail!("ISO image is incomplete");
        }

        Ok(iso_fs)
    }

    pub fn as_file(&mut self) -> Result<&mut fs::File> {
        self.file
            .seek(SeekFrom::Start(0))
            .context("seeking to start of ISO")?;
        Ok(&mut self.file)
    }

    pub fn get_root_directory(&self) -> Result<Directory> {
        let primary = self
            .get_primary_volume_descriptor()
            .context("getting root directory")?;
        Ok(primary.root.clone())
    }

    pub fn walk(&mut self) -> Result<IsoFsWalkIterator> {
        let root_dir = self.get_root_directory()?;
        let buf = self.list_dir(&root_dir)?;
        Ok(IsoFsWalkIterator {
            iso: &mut self.file,
            parent_dirs: Vec::new(),
            current_dir: Some(buf),
            dirpath: PathBuf::new(),
        })
    }

    /// Returns an iterator over the records of a directory.
    pub fn list_dir(&mut self, dir: &Directory) -> Result<IsoFsIterator> {
        IsoFsIterator::new(&mut self.file, dir)
    }

    /// Returns the record for a specific path.
    pub fn get_path(&mut self, path: &str) -> Result<DirectoryRecord> {
        let mut dir = self.get_root_directory()?;
        let mut components = path_components(path);
        let filename = match components.pop() {
            Some(f) => f,
            None => return Ok(DirectoryRecord::Directory(dir)),
        };

        for c in &components {
            dir = self
                .get_dir_record(&dir, c)?
                .ok_or_else(|| NotFound(format!("intermediate directory {} does not exist", c)))?
                .try_into_dir()
                .map_err(|_| {
                    NotFound(format!(
                        "component {:?} in path {} is not a directory",
                        c, path
                    ))
                })?;
        }

        self.get_dir_record(&dir, filename)?.ok_or_else(|| {
            anyhow!(NotFound(format!(
                "no record for {} in directory {}",
                filename,
                components.join("/")
            )))
        })
    }

    /// Returns the record for a specific name in a directory if it exists.
    fn get_dir_record(&mut self, dir: &Directory, name: &str) -> Result<Option<DirectoryRecord>> {
        for record in self
            .list_dir(dir)
            .with_context(|| format!("listing directory {}", dir.name))?
        {
            let record = record?;
            match &record {
                DirectoryRecord::Directory(d) if d.name == name => return Ok(Some(record)),
                DirectoryRecord::File(f) if f.name == name => return Ok(Some(record)),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Returns a reader for a file record.
    pub fn read_file(&mut self, file: &File) -> Result<impl Read + '_> {
        self.file
            .seek(SeekFrom::Start(file.address.as_offset()))
            .with_context(|| format!("seeking to file {}", file.name))?;
        Ok(BufReader::with_capacity(
            BUFFER_SIZE,
            (&self.file).take(file.length as u64),
        ))
    }

    /// Returns a writer for a file record.
    pub fn overwrite_file(&mut self, file: &File) -> Result<impl Write + '_> {
        self.file
            .seek(SeekFrom::Start(file.address.as_offset()))
            .with_context(|| format!("seeking to file {}", file.name))?;
        Ok(LimitWriter::new(
            &mut self.file,
            file.length as u64,
            format!("end of file {}", file.name),
        ))
    }

    fn get_primary_volume_descriptor(&self) -> Result<&PrimaryVolumeDescriptor> {
        for d in &self.descriptors {
            if let VolumeDescriptor::Primary(p) = d {
                return Ok(p);
            }
        }
        Err(anyhow!("no primary volume descriptor found in ISO"))
    }

    /// Returns the trimmed Primary Volume Descriptor volume identifier
    /// (ISO9660 sector 16, bytes 40..71, space-padded).
    pub fn volume_id(&self) -> Result<&str> {
        Ok(self.get_primary_volume_descriptor()?.volume_id.as_str())
    }

    /// Convenience read of a small file by inner path.
    pub fn read_file_at_path(&mut self, path: &str) -> Result<Vec<u8>> {
        let file = self
            .get_path(path)
            .with_context(|| format!("looking up {}", path))?
            .try_into_file()?;
        let mut buf = Vec::with_capacity(file.length as usize);
        self.read_file(&file)?
            .read_to_end(&mut buf)
            .with_context(|| format!("reading {}", path))?;
        Ok(buf)
    }

    /// Absolute byte offset and length of `path` within the enclosing ISO
    /// file.
    pub fn file_info(&mut self, path: &str) -> Result<(u64, u32)> {
        let file = self
            .get_path(path)
            .with_context(|| format!("looking up {}", path))?
            .try_into_file()?;
        Ok((file.address.as_offset(), file.length))
    }
}

/// Read just the Primary Volume Descriptor volume identifier from an ISO
/// at `path`, without walking its directory hierarchy.
pub fn volume_identifier(path: &Path) -> Result<String> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let iso = IsoFs::from_file(file).with_context(|| format!("parsing {}", path.display()))?;
    Ok(iso.volume_id()?.to_string())
}

/// Write every regular file inside the ISO at `iso_path` under `dest_dir`,
/// preserving its path within the ISO.
pub fn extract(iso_path: &Path, dest_dir: &Path) -> Result<()> {
    let file =
        fs::File::open(iso_path).with_context(|| format!("opening {}", iso_path.display()))?;
    let mut iso = IsoFs::from_file(file).with_context(|| format!("parsing {}", iso_path.display()))?;
    let entries: Vec<(String, DirectoryRecord)> = iso
        .walk()
        .with_context(|| format!("walking {}", iso_path.display()))?
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("walking {}", iso_path.display()))?;
    for (path, record) in entries {
        let record_file = match record {
            DirectoryRecord::File(f) => f,
            DirectoryRecord::Directory(_) => continue,
        };
        let out_path = dest_dir.join(&path);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("creating {}", out_path.display()))?;
        std::io::copy(&mut iso.read_file(&record_file)?, &mut out)
            .with_context(|| format!("extracting {}", path))?;
    }
    Ok(())
}

/// Detected El-Torito boot images in a source tree, as understood by
/// `create()`.
struct BootImages {
    isolinux: bool,
    efiboot: bool,
    cdboot_sectors: Option<u32>,
}

impl BootImages {
    fn detect(src_dir: &Path) -> Result<Self> {
        let isolinux = src_dir.join("isolinux/isolinux.bin").is_file()
            && src_dir.join("isolinux/boot.cat").is_file();
        let efiboot = src_dir.join("images/efiboot.img").is_file();
        let cdboot_path = src_dir.join("images/cdboot.img");
        let cdboot_sectors = if cdboot_path.is_file() {
            let len = fs::metadata(&cdboot_path)
                .with_context(|| format!("statting {}", cdboot_path.display()))?
                .len();
            // round up to a multiple of 2048 bytes, capped at 65535 * 512 bytes
            let sector = ISO9660_SECTOR_SIZE as u64;
            let rounded = (len + sector - 1) / sector * sector;
            let capped = rounded.min(65_535 * 512);
            Some((capped / 512) as u32)
        } else {
            None
        };
        Ok(Self {
            isolinux,
            efiboot,
            cdboot_sectors,
        })
    }
}

/// Build an ISO at `output_path` from the tree rooted at `src_dir`,
/// preserving whichever El-Torito boot catalog entries it finds.
///
/// Shells out to `xorriso`, the same tool RHCOS's own build pipeline
/// (coreos-assembler) uses to author live ISOs; hand-rolling El-Torito
/// boot-catalog authoring on top of the read-only parser above would
/// duplicate a well-tested external tool for no benefit.
pub fn create(output_path: &Path, src_dir: &Path, volume_id: &str) -> Result<()> {
    let boot = BootImages::detect(src_dir)?;

    let mut cmd = std::process::Command::new("xorriso");
    cmd.arg("-as").arg("mkisofs");
    cmd.arg("-V").arg(volume_id);
    cmd.arg("-o").arg(output_path);
    cmd.arg("-r");

    if boot.isolinux {
        cmd.arg("-b")
            .arg("isolinux/isolinux.bin")
            .arg("-c")
            .arg("isolinux/boot.cat")
            .arg("-no-emul-boot")
            .arg("-boot-load-size")
            .arg("4")
            .arg("-boot-info-table");
    }
    if boot.efiboot {
        cmd.arg("-eltorito-alt-boot")
            .arg("-e")
            .arg("images/efiboot.img")
            .arg("-no-emul-boot");
    }
    if let Some(sectors) = boot.cdboot_sectors {
        cmd.arg("-eltorito-alt-boot")
            .arg("-e")
            .arg("images/cdboot.img")
            .arg("-no-emul-boot")
            .arg("-boot-load-size")
            .arg(sectors.to_string());
    }

    cmd.arg(src_dir);

    cmd_output(&mut cmd).with_context(|| format!("authoring ISO at {}", output_path.display()))?;
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum VolumeDescriptor {
    Boot(BootVolumeDescriptor),
    Primary(PrimaryVolumeDescriptor),
    Supplementary,
    Unknown { type_id: u8 },
}

#[derive(Debug, Serialize)]
struct BootVolumeDescriptor {
    boot_system_id: String,
    boot_id: String,
}

#[derive(Debug, Serialize)]
struct PrimaryVolumeDescriptor {
    system_id: String,
    volume_id: String,
    volume_space_size: u64,
    root: Directory,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirectoryRecord {
    Directory(Directory),
    File(File),
}

impl DirectoryRecord {
    pub fn try_into_dir(self) -> Result<Directory> {
        match self {
            Self::Directory(d) => Ok(d),
            Self::File(f) => Err(anyhow!("entry {} is a file", f.name)),
        }
    }

    pub fn try_into_file(self) -> Result<File> {
        match self {
            Self::Directory(f) => Err(anyhow!("entry {} is a directory", f.name)),
            Self::File(f) => Ok(f),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct Directory {
    pub name: String,
    pub address: Address,
    pub length: u32,
}

#[derive(Debug, Serialize, Clone)]
pub struct File {
    pub name: String,
    pub address: Address,
    pub length: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Address(u32);

impl Address {
    pub fn as_offset(&self) -> u64 {
        self.0 as u64 * ISO9660_SECTOR_SIZE as u64
    }

    pub fn as_sector(&self) -> u32 {
        self.0
    }
}

/// Requested path was not found.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NotFound(String);

/// Reads all the volume descriptors.
fn get_volume_descriptors(f: &mut fs::File) -> Result<Vec<VolumeDescriptor>> {
    const ISO9660_VOLUME_DESCRIPTORS: Address = Address(0x10);
    f.seek(SeekFrom::Start(ISO9660_VOLUME_DESCRIPTORS.as_offset()))
        .context("seeking to volume descriptors")?;

    let mut descriptors: Vec<VolumeDescriptor> = Vec::new();
    while let Some(d) = get_next_volume_descriptor(f)
        .with_context(|| format!("getting volume descriptor #{}", descriptors.len() + 1))?
    {
        descriptors.push(d);
    }

    Ok(descriptors)
}

/// Reads the volume descriptor at cursor and advances to the next one.
fn get_next_volume_descriptor(f: &mut fs::File) -> Result<Option<VolumeDescriptor>> {
    const TYPE_BOOT: u8 = 0;
    const TYPE_PRIMARY: u8 = 1;
    const TYPE_SUPPLEMENTARY: u8 = 2;
    const TYPE_TERMINATOR: u8 = 255;

    let mut buf = vec![0; ISO9660_SECTOR_SIZE];
    f.read_exact(&mut buf)
        .context("reading volume descriptor")?;
    let buf = &mut Bytes::from(buf);

    Ok(match buf.get_u8() {
        TYPE_BOOT => Some(VolumeDescriptor::Boot(BootVolumeDescriptor::parse(buf)?)),
        TYPE_PRIMARY => Some(VolumeDescriptor::Primary(PrimaryVolumeDescriptor::parse(
            buf,
        )?)),
        TYPE_SUPPLEMENTARY => Some(VolumeDescriptor::Supplementary),
        TYPE_TERMINATOR => None,
        t => Some(VolumeDescriptor::Unknown { type_id: t }),
    })
}

impl BootVolumeDescriptor {
    /// Parses boot descriptor at cursor after type field.
    fn parse(buf: &mut Bytes) -> Result<Self> {
        verify_descriptor_header(buf).context("parsing boot descriptor")?;
        Ok(Self {
            boot_system_id: parse_iso9660_string(buf, 32, IsoString::StrA)
                .context("parsing boot system ID")?,
            boot_id: parse_iso9660_string(buf, 32, IsoString::StrA).context("parsing boot ID")?,
        })
    }
}

impl PrimaryVolumeDescriptor {
    /// Parses primary descriptor at cursor after type field.
    fn parse(buf: &mut Bytes) -> Result<Self> {
        verify_descriptor_header(buf).context("parsing primary descriptor")?;
        let system_id =
            parse_iso9660_string(eat(buf, 1), 32, IsoString::StrA).context("parsing system id")?;
        let volume_id = // technically should be StrD, but non-compliance is common
            parse_iso9660_string(buf, 32, IsoString::StrA).context("parsing volume id")?;
        eat(buf, 8); // Unused field always 0x00
        let volume_space_size = buf.get_u32_le() as u64;
        let root = match get_next_directory_record(eat(buf, 156 - 84), 34, true)? {
            Some(DirectoryRecord::Directory(d)) => d,
            _ => bail!("failed to parse root directory record from primary descriptor"),
        };
        Ok(Self {
            system_id,
            volume_id,
            volume_space_size,
            root,
        })
    }
}

/// Verifies descriptor header at cursor.
fn verify_descriptor_header(buf: &mut Bytes) -> Result<()> {
    const VOLUME_DESCRIPTOR_ID: &[u8] = b"CD001";
    const VOLUME_DESCRIPTOR_VERSION: u8 = 1;

    let id = buf.copy_to_bytes(5);
    if id != VOLUME_DESCRIPTOR_ID {
        bail!("unknown descriptor ID: {:?}", id);
    }

    let version = buf.get_u8();
    if version != VOLUME_DESCRIPTOR_VERSION {
        bail!("unknown descriptor version: {}", version);
    }

    Ok(())
}

pub struct IsoFsIterator {
    dir: Bytes,
    length: u32,
}

impl IsoFsIterator {
    fn new(iso: &mut fs::File, dir: &Directory) -> Result<Self> {
        iso.seek(SeekFrom::Start(dir.address.as_offset()))
            .with_context(|| format!("seeking to directory {}", dir.name))?;

        let mut buf = vec![0; dir.length as usize];
        iso.read_exact(&mut buf)
            .with_context(|| format!("reading directory {}", dir.name))?;

        Ok(Self {
            dir: Bytes::from(buf),
            length: dir.length,
        })
    }
}

impl Iterator for IsoFsIterator {
    type Item = Result<DirectoryRecord>;
    fn next(&mut self) -> Option<Self::Item> {
        get_next_directory_record(&mut self.dir, self.length, false)
            .context("reading next record")
            .transpose()
    }
}

pub struct IsoFsWalkIterator<'a> {
    iso: &'a mut fs::File,
    parent_dirs: Vec<IsoFsIterator>,
    current_dir: Option<IsoFsIterator>,
    dirpath: PathBuf,
}

impl<'a> Iterator for IsoFsWalkIterator<'a> {
    type Item = Result<(String, DirectoryRecord)>;
    fn next(&mut self) -> Option<Self::Item> {
        self.walk_iterator_next().transpose()
    }
}

impl<'a> IsoFsWalkIterator<'a> {
    // This is simply split out of next() above for easier error-handling
    fn walk_iterator_next(&mut self) -> Result<Option<(String, DirectoryRecord)>> {
        while let Some(ref mut current_dir) = self.current_dir {
            match current_dir.next() {
                Some(Ok(r)) => {
                    // ideally, we'd return a ref and avoid cloning, but there's no way for an
                    // iterator to return a reference to data within itself
                    let mut path = self.dirpath.clone();
                    match &r {
                        DirectoryRecord::Directory(d) => {
                            self.parent_dirs.push(self.current_dir.take().unwrap());
                            self.dirpath.push(&d.name);
                            self.current_dir = Some(IsoFsIterator::new(self.iso, d)?);
                            path.push(&d.name);
                        }
                        DirectoryRecord::File(f) => path.push(&f.name),
                    };
                    // paths are all UTF-8
                    return Ok(Some((path.into_os_string().into_string().unwrap(), r)));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    self.current_dir = self.parent_dirs.pop();
                    self.dirpath.pop();
                }
            }
        }
        Ok(None)
    }
}

/// Reads the directory record at cursor and advances to the next one.
fn get_next_directory_record(
    buf: &mut Bytes,
    length: u32,
    is_root: bool,
) -> Result<Option<DirectoryRecord>> {
    loop {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let len = buf.get_u8() as usize;
        if len == 0 {
            let jump = {
                // calculate where we are we in the directory
                let pos = length as usize - buf.remaining();
                // get distance to next 2k-aligned address
                ((pos + ISO9660_SECTOR_SIZE) & !(ISO9660_SECTOR_SIZE - 1)) - pos
            };
            if jump >= buf.remaining() {
                return Ok(None);
            }
            buf.advance(jump);
            continue;
        } else if len > buf.remaining() + 1 {
            // + 1 because len includes the length of the length byte
            // itself, which we already read
            bail!("incomplete directory record; corrupt ISO?");
        }

        let address = Address(eat(buf, 1).get_u32_le());
        let length = eat(buf, 4).get_u32_le();
        let flags = eat(buf, 25 - 14).get_u8();
        let name_length = eat(buf, 32 - 26).get_u8() as usize;
        let name = if name_length == 1 && (buf[0] == 0 || buf[0] == 1) {
            let c = buf.get_u8();
            if is_root && c == 0 {
                // as a special case, allow "." when reading the root directory
                // record from the primary volume descriptor
                Some(".".into())
            } else {
                // "." or ".."
                None
            }
        } else {
            Some(
                parse_iso9660_string(buf, name_length, IsoString::File)
                    .context("parsing record name")?,
            )
        };

        // advance to next record
        eat(buf, len - (33 + name_length));

        if let Some(name) = name {
            if flags & 2 > 0 {
                return Ok(Some(DirectoryRecord::Directory(Directory {
                    name,
                    address,
                    length,
                })));
            } else {
                return Ok(Some(DirectoryRecord::File(File {
                    name,
                    address,
                    length,
                })));
            }
        }
    }
}

#[allow(unused)]
enum IsoString {
    StrA,
    StrD,
    File,
}

/// Reads an ISO9660 string.
fn parse_iso9660_string(buf: &mut Bytes, len: usize, kind: IsoString) -> Result<String> {
    // References:
    // https://wiki.osdev.org/ISO_9660#String_format
    // https://github.com/torvalds/linux/blob/ddf21bd8ab984ccaa924f090fc7f515bb6d51414/fs/isofs/dir.c#L17
    const FILE_CHARS: [u8; 17] = *b"!\"%&'()*+,-.:<=>?"; // full file chars set includes D-chars
    const A_CHARS: [u8; 2] = *b";/"; // full A-chars includes file chars set
    if len > buf.remaining() {
        bail!("incomplete string name; corrupt ISO?");
    }
    let mut s = String::with_capacity(len);
    let mut bytes = buf.copy_to_bytes(len);
    if matches!(kind, IsoString::File) {
        if bytes.ends_with(b";1") {
            bytes.truncate(bytes.len() - 2);
        }
        if bytes.ends_with(b".") {
            bytes.truncate(bytes.len() - 1);
        }
    }
    for byte in &bytes {
        #[allow(clippy::if_same_then_else)] // I find it easier to follow this way
        if byte.is_ascii_alphabetic() || byte.is_ascii_digit() || *byte == b'_' || *byte == b' ' {
            s.push(char::from(*byte));
        } else if FILE_CHARS.contains(byte) && matches!(kind, IsoString::File | IsoString::StrA) {
            s.push(char::from(*byte));
        } else if A_CHARS.contains(byte) && matches!(kind, IsoString::StrA) {
            s.push(char::from(*byte));
        } else if A_CHARS.contains(byte) && matches!(kind, IsoString::File) {
            s.push('.'); // this matches what the kernel does
        } else if *byte == 0 {
            break;
        } else {
            bail!("invalid string name {:?}", bytes);
        }
    }
    if matches!(kind, IsoString::StrA | IsoString::StrD) {
        s.truncate(s.trim_end_matches(' ').len());
    }
    Ok(s)
}

fn eat(buf: &mut Bytes, n: usize) -> &mut Bytes {
    buf.advance(n);
    buf
}

/// Parse path into a Vec<&str> with zero or more components.  Convert path
/// to relative and resolve all "." and ".." components.
fn path_components(s: &str) -> Vec<&str> {
    // empty paths are treated the same as "/" to allow round-tripping
    use std::path::Component::*;
    let mut ret = Vec::new();
    for c in Path::new(s).components() {
        match c {
            Prefix(_) | RootDir | CurDir => (),
            ParentDir => {
                ret.pop();
            }
            Normal(c) => {
                ret.push(c.to_str().unwrap()); // `s` is &str
            }
        }
    }
    ret
}

/// Hand-assembled, minimal but spec-compliant ISO9660 images for tests.
/// This crate carries no binary fixtures, so tests build their inputs
/// directly from the same byte layout the parser above understands.
#[cfg(test)]
mod synthetic {
    use super::ISO9660_SECTOR_SIZE;

    const SECTOR: usize = ISO9660_SECTOR_SIZE;

    fn dir_record(address: u32, length: u32, flags: u8, name: &[u8]) -> Vec<u8> {
        let name_length = name.len();
        let total = 33 + name_length;
        assert!(total <= 255, "synthetic record too long");
        let mut buf = vec![0u8; total];
        buf[0] = total as u8;
        buf[2..6].copy_from_slice(&address.to_le_bytes());
        buf[6..10].copy_from_slice(&address.to_be_bytes());
        buf[10..14].copy_from_slice(&length.to_le_bytes());
        buf[14..18].copy_from_slice(&length.to_be_bytes());
        buf[25] = flags;
        buf[32] = name_length as u8;
        buf[33..33 + name_length].copy_from_slice(name);
        buf
    }

    /// Build directory sector contents: "." and ".." entries followed by
    /// `entries`. Returns the full sector content (its length is what a
    /// parent's directory record for this directory must carry).
    fn build_dir_sector(self_addr: u32, parent_addr: u32, entries: &[Vec<u8>]) -> Vec<u8> {
        let mut content = Vec::new();
        content.extend(dir_record(self_addr, 0, 2, &[0]));
        content.extend(dir_record(parent_addr, 0, 2, &[1]));
        for e in entries {
            content.extend(e);
        }
        assert!(content.len() <= SECTOR, "synthetic directory too large");
        content
    }

    /// Layout: sector 16 PVD, 17 terminator, 18 root dir, 19 FILE.TXT data,
    /// 20 DIR dir, 21 SUB.TXT data.
    pub fn build(volume_id: &str) -> Vec<u8> {
        const ROOT: u32 = 18;
        const FILE_TXT: u32 = 19;
        const DIR: u32 = 20;
        const SUB_TXT: u32 = 21;
        const TOTAL_SECTORS: u32 = 22;

        let file_txt_content = b"hello\n";
        let sub_txt_content = b"world\n";

        let sub_txt_record = dir_record(SUB_TXT, sub_txt_content.len() as u32, 0, b"SUB.TXT");
        let dir_content = build_dir_sector(DIR, ROOT, &[sub_txt_record]);

        let file_record = dir_record(FILE_TXT, file_txt_content.len() as u32, 0, b"FILE.TXT");
        let dir_entry = dir_record(DIR, dir_content.len() as u32, 2, b"DIR");
        let root_content = build_dir_sector(ROOT, ROOT, &[file_record, dir_entry]);

        let mut image = vec![0u8; TOTAL_SECTORS as usize * SECTOR];

        let pvd = &mut image[16 * SECTOR..17 * SECTOR];
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        pvd[6] = 1;
        for b in pvd[8..40].iter_mut() {
            *b = b' ';
        }
        let vid_bytes = volume_id.as_bytes();
        for (i, slot) in pvd[40..72].iter_mut().enumerate() {
            *slot = *vid_bytes.get(i).unwrap_or(&b' ');
        }
        pvd[80..84].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
        let root_record = dir_record(ROOT, root_content.len() as u32, 2, &[0]);
        pvd[156..156 + root_record.len()].copy_from_slice(&root_record);

        let term = &mut image[17 * SECTOR..18 * SECTOR];
        term[0] = 255;
        term[1..6].copy_from_slice(b"CD001");
        term[6] = 1;

        image[ROOT as usize * SECTOR..ROOT as usize * SECTOR + root_content.len()]
            .copy_from_slice(&root_content);
        image[FILE_TXT as usize * SECTOR..FILE_TXT as usize * SECTOR + file_txt_content.len()]
            .copy_from_slice(file_txt_content);
        image[DIR as usize * SECTOR..DIR as usize * SECTOR + dir_content.len()]
            .copy_from_slice(&dir_content);
        image[SUB_TXT as usize * SECTOR..SUB_TXT as usize * SECTOR + sub_txt_content.len()]
            .copy_from_slice(sub_txt_content);

        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn open_iso(volume_id: &str) -> (IsoFs, fs::File) {
        let bytes = synthetic::build(volume_id);
        let mut iso_file = tempfile::tempfile().unwrap();
        iso_file.write_all(&bytes).unwrap();
        iso_file.seek(SeekFrom::Start(0)).unwrap();
        let dup = iso_file.try_clone().unwrap();
        (IsoFs::from_file(iso_file).unwrap(), dup)
    }

    #[test]
    fn open_truncated_iso() {
        let bytes = synthetic::build("TESTVOL");
        let mut iso_file = tempfile::tempfile().unwrap();
        iso_file.write_all(&bytes).unwrap();
        iso_file.set_len(bytes.len() as u64 / 2).unwrap();
        iso_file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(
            IsoFs::from_file(iso_file).unwrap_err().to_string(),
            "ISO image is incomplete"
        );
    }

    #[test]
    fn test_primary_volume_descriptor() {
        let (iso, _f) = open_iso("rhcos-test-vol");
        let desc = iso.get_primary_volume_descriptor().unwrap();
        assert_eq!(desc.volume_id, "rhcos-test-vol");
        assert_eq!(desc.root.name, ".");
    }

    #[test]
    fn test_get_path() {
        let (mut iso, _f) = open_iso("TESTVOL");
        assert_eq!(iso.get_path("/").unwrap().try_into_dir().unwrap().name, ".");
        assert_eq!(
            iso.get_path("DIR").unwrap().try_into_dir().unwrap().name,
            "DIR"
        );
        iso.get_path("DIR").unwrap().try_into_file().unwrap_err();
        iso.get_path("FILE.TXT")
            .unwrap()
            .try_into_dir()
            .unwrap_err();
        assert!(iso.get_path("MISSING").unwrap_err().is::<NotFound>());
        assert!(iso
            .get_path("MISSING/STUFF.TXT")
            .unwrap_err()
            .is::<NotFound>());
        assert!(iso
            .get_path("FILE.TXT/STUFF.TXT")
            .unwrap_err()
            .is::<NotFound>());
    }

    #[test]
    fn test_list_dir() {
        let (mut iso, _f) = open_iso("TESTVOL");
        let root = iso.get_root_directory().unwrap();
        let mut names = iso
            .list_dir(&root)
            .unwrap()
            .map(|e| match e.unwrap() {
                DirectoryRecord::Directory(d) => d.name,
                DirectoryRecord::File(f) => f.name,
            })
            .collect::<Vec<String>>();
        names.sort();
        assert_eq!(names, vec!["DIR", "FILE.TXT"]);
    }

    #[test]
    fn test_read_file() {
        let (mut iso, _f) = open_iso("TESTVOL");
        let file = iso
            .get_path("DIR/SUB.TXT")
            .unwrap()
            .try_into_file()
            .unwrap();
        let mut data = String::new();
        iso.read_file(&file).unwrap().read_to_string(&mut data).unwrap();
        assert_eq!(data, "world\n");
    }

    #[test]
    fn test_walk() {
        let (mut iso, _f) = open_iso("TESTVOL");
        let mut names = iso
            .walk()
            .unwrap()
            .map(|v| v.unwrap().0)
            .collect::<Vec<String>>();
        names.sort();
        assert_eq!(names, vec!["DIR", "DIR/SUB.TXT", "FILE.TXT"]);
    }

    #[test]
    fn test_volume_identifier() {
        let bytes = synthetic::build("rhcos-test-vol");
        let dir = tempdir().unwrap();
        let iso_path = dir.path().join("test.iso");
        fs::write(&iso_path, &bytes).unwrap();
        assert_eq!(volume_identifier(&iso_path).unwrap(), "rhcos-test-vol");
    }

    #[test]
    fn test_extract() {
        let bytes = synthetic::build("TESTVOL");
        let dir = tempdir().unwrap();
        let iso_path = dir.path().join("test.iso");
        fs::write(&iso_path, &bytes).unwrap();
        let dest = dir.path().join("extracted");
        extract(&iso_path, &dest).unwrap();
        assert_eq!(fs::read(dest.join("FILE.TXT")).unwrap(), b"hello\n");
        assert_eq!(fs::read(dest.join("DIR/SUB.TXT")).unwrap(), b"world\n");
    }

    #[test]
    fn test_create_roundtrip() {
        if std::process::Command::new("xorriso")
            .arg("--version")
            .output()
            .is_err()
        {
            eprintln!("skipping test_create_roundtrip: xorriso not installed");
            return;
        }
        let src = tempdir().unwrap();
        fs::write(src.path().join("FILE.TXT"), b"hello\n").unwrap();
        let out_dir = tempdir().unwrap();
        let out_path = out_dir.path().join("out.iso");
        create(&out_path, src.path(), "rhcos-test-vol").unwrap();
        assert_eq!(volume_identifier(&out_path).unwrap(), "rhcos-test-vol");
    }

    #[test]
    fn test_path_components() {
        // basic
        assert_eq!(path_components("z"), vec!["z"]);
        // absolute path with . and ..
        assert_eq!(path_components("/a/./../b"), vec!["b"]);
        // relative path, traversal past root
        assert_eq!(path_components("./a/../../b"), vec!["b"]);
        // just the root
        assert_eq!(path_components("/"), Vec::new() as Vec<&str>);
        // empty string
        assert_eq!(path_components(""), Vec::new() as Vec<&str>);
    }
}
