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

//! Lazily composes a base `Read + Seek` stream with a byte-range overlay.
//!
//! Unlike [`crate::io::LimitWriter`], which adapts a single stream, an
//! [`OverlayReader`] stacks a second stream on top of a base one so that
//! reads falling inside `[offset, offset + length)` are transparently
//! satisfied from the overlay instead. No bytes of the base are ever
//! copied or rewritten; the overlay is purely a read-time splice.
//! Stacking several overlays (one composed reader becoming the base of the
//! next) embeds ignition, an auxiliary ramdisk, and kargs in a single
//! output stream without ever materializing it.

use std::io::{self, Read, Seek, SeekFrom};

/// Any stream a composed overlay chain can be built on or returned as:
/// `Read + Seek`, plus `Send` so a composer's output can cross the thread
/// boundary into whatever scheduling unit serves a request.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send + ?Sized> ReadSeek for T {}

/// A type-erased, arbitrarily-deep stack of [`OverlayReader`]s. Each overlay
/// region becomes the base of the next, so a composer can embed ignition,
/// an auxiliary ramdisk, and any number of kargs files in one output stream
/// without the stack depth appearing in the return type.
pub type BoxedReadSeek = Box<dyn ReadSeek>;

/// A byte-range overlay: bytes to substitute into `[offset, offset + bytes.len())`
/// of a base stream. If `offset` is at or beyond the base's length, the
/// overlay extends the stream (append mode).
pub struct Overlay {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl Overlay {
    pub fn new(offset: u64, bytes: Vec<u8>) -> Self {
        Self { offset, bytes }
    }

    fn end(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }
}

/// Composes `base` with a single [`Overlay`]. `B` may itself be another
/// `OverlayReader`, allowing overlays to stack.
pub struct OverlayReader<B: Read + Seek> {
    base: B,
    base_len: u64,
    overlay: Overlay,
    /// Logical read position.
    pos: u64,
}

impl<B: Read + Seek> OverlayReader<B> {
    /// Wrap `base` (whose total length is `base_len`) with `overlay`.
    /// `base` is left positioned at its current location; the first
    /// `read`/`seek` call will reposition it as needed.
    pub fn new(base: B, base_len: u64, overlay: Overlay) -> Self {
        Self {
            base,
            base_len,
            overlay,
            pos: 0,
        }
    }

    /// Total logical length of the composed stream.
    pub fn len(&self) -> u64 {
        self.base_len.max(self.overlay.end())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes remaining from the current position to the end of the stream.
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.pos)
    }

    fn read_from_overlay(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rel = (self.pos - self.overlay.offset) as usize;
        let avail = self.overlay.bytes.len() - rel;
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&self.overlay.bytes[rel..rel + n]);
        Ok(n)
    }

    fn read_from_base(&mut self, buf: &mut [u8], clamp: u64) -> io::Result<usize> {
        let avail = clamp.saturating_sub(self.pos);
        if avail == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(avail) as usize;
        self.base.seek(SeekFrom::Start(self.pos))?;
        // The base may be shorter than base_len reports if it is itself
        // another OverlayReader in append mode; tolerate a short read here
        // and let the caller see Ok(0) rather than propagating an error.
        self.base.read(&mut buf[..want])
    }
}

impl<B: Read + Seek> Read for OverlayReader<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len() {
            return Ok(0);
        }
        let n = if self.pos >= self.overlay.offset && self.pos < self.overlay.end() {
            self.read_from_overlay(buf)?
        } else if self.pos < self.overlay.offset {
            self.read_from_base(buf, self.overlay.offset)?
        } else {
            self.read_from_base(buf, self.base_len)?
        };
        self.pos += n as u64;
        Ok(n)
    }
}

impl<B: Read + Seek> Seek for OverlayReader<B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.len() as i64 + delta,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

/// Convenience constructor for an append overlay: `bytes` is placed
/// immediately after the end of `base`, extending the composed stream's
/// length by `bytes.len()`.
///
/// Some bases (notably a raw initrd stream whose final chunk arrives
/// together with EOF) would otherwise have their last read's EOF
/// misinterpreted as the end of the *composed* stream; because this
/// reader tracks length independently of the base's own EOF signal, the
/// overlay region is always reached and drained regardless of how the
/// base reports its own end.
pub fn append(base_len: u64, bytes: Vec<u8>) -> Overlay {
    Overlay::new(base_len, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read as _};

    fn read_all<R: Read>(r: &mut R) -> Vec<u8> {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn overlay_transparency() {
        let base: Vec<u8> = (0u8..20).collect();
        let base_len = base.len() as u64;
        let overlay = Overlay::new(5, vec![0xaa; 4]);
        let mut reader = OverlayReader::new(Cursor::new(base.clone()), base_len, overlay);
        let out = read_all(&mut reader);
        let mut expected = base[0..5].to_vec();
        expected.extend(std::iter::repeat(0xaa).take(4));
        expected.extend(&base[9..20]);
        assert_eq!(out, expected);
    }

    #[test]
    fn overlay_covering_tail() {
        let base: Vec<u8> = (0u8..10).collect();
        let overlay = Overlay::new(8, vec![0xff; 2]);
        let mut reader = OverlayReader::new(Cursor::new(base.clone()), 10, overlay);
        let out = read_all(&mut reader);
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5, 6, 7, 0xff, 0xff]);
    }

    #[test]
    fn append_composer() {
        let base: Vec<u8> = (0u8..5).collect();
        let base_len = base.len() as u64;
        let extra = vec![0x11, 0x22, 0x33];
        let mut reader = OverlayReader::new(Cursor::new(base.clone()), base_len, append(base_len, extra.clone()));
        assert_eq!(reader.len(), base_len + extra.len() as u64);
        let out = read_all(&mut reader);
        let mut expected = base;
        expected.extend(extra);
        assert_eq!(out, expected);
    }

    #[test]
    fn seek_into_overlay_region() {
        let base: Vec<u8> = (0u8..20).collect();
        let overlay = Overlay::new(5, vec![0xaa; 4]);
        let mut reader = OverlayReader::new(Cursor::new(base), 20, overlay);
        reader.seek(SeekFrom::Start(6)).unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xaa]);
    }

    #[test]
    fn stacked_overlays() {
        let base: Vec<u8> = vec![0u8; 20];
        let first = OverlayReader::new(Cursor::new(base), 20, Overlay::new(2, vec![1, 1]));
        let mut second = OverlayReader::new(first, 20, Overlay::new(10, vec![2, 2, 2]));
        let out = read_all(&mut second);
        let mut expected = vec![0u8; 20];
        expected[2] = 1;
        expected[3] = 1;
        expected[10] = 2;
        expected[11] = 2;
        expected[12] = 2;
        assert_eq!(out, expected);
    }
}
