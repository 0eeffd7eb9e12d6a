//! Decoder for the raw inotify record stream.
//!
//! Each record is a fixed 16-byte header (`wd: i32`, `mask: u32`,
//! `cookie: u32`, `len: u32`, native endian) followed by `len` bytes of
//! NUL-padded name.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use super::channel::WatchHandle;
use super::mask::EventMask;

/// Size of the fixed record header in bytes.
pub const HEADER_SIZE: usize = 16;

/// A single decoded change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Watch the notification was delivered for.
    pub handle: WatchHandle,
    /// Event bits, possibly several kinds plus [`EventMask::ISDIR`].
    pub mask: EventMask,
    /// Correlates the two halves of a rename; zero otherwise.
    pub cookie: u32,
    /// Trailing path component. Empty when the event concerns the watched
    /// directory itself.
    pub name: OsString,
}

impl ChangeRecord {
    /// Create a record.
    #[must_use]
    pub fn new(handle: WatchHandle, mask: EventMask, cookie: u32, name: impl Into<OsString>) -> Self {
        Self {
            handle,
            mask,
            cookie,
            name: name.into(),
        }
    }

    /// Encode the record in kernel layout, padding the name with NULs to a
    /// multiple of `align` bytes (the kernel uses 16). An empty name carries
    /// no payload.
    #[must_use]
    pub fn to_bytes(&self, align: usize) -> Vec<u8> {
        let name = self.name.as_bytes();
        let len = if name.is_empty() {
            0
        } else {
            let align = align.max(1);
            // Always keep at least one terminating NUL.
            (name.len() + 1).div_ceil(align) * align
        };
        let len_field = u32::try_from(len).unwrap_or(u32::MAX);

        let mut out = Vec::with_capacity(HEADER_SIZE + len);
        out.extend_from_slice(&self.handle.as_raw().to_ne_bytes());
        out.extend_from_slice(&self.mask.bits().to_ne_bytes());
        out.extend_from_slice(&self.cookie.to_ne_bytes());
        out.extend_from_slice(&len_field.to_ne_bytes());
        out.extend_from_slice(name);
        out.resize(HEADER_SIZE + len, 0);
        out
    }
}

/// Decode every complete record in `buffer`.
///
/// The returned iterator is lazy and single-pass. It stops, without error,
/// at the first point where fewer bytes remain than a full header, or where
/// a header announces more name bytes than the buffer holds.
#[must_use]
pub fn decode(buffer: &[u8]) -> Records<'_> {
    Records { buffer, offset: 0 }
}

/// Lazy iterator over the records of one buffer. See [`decode`].
#[derive(Debug)]
pub struct Records<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl Records<'_> {
    /// Bytes consumed so far.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether bytes remain that do not form a complete record.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.offset < self.buffer.len()
    }
}

impl Iterator for Records<'_> {
    type Item = ChangeRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.buffer.get(self.offset..)?;
        if rest.len() < HEADER_SIZE {
            return None;
        }

        let word = |at: usize| -> [u8; 4] { [rest[at], rest[at + 1], rest[at + 2], rest[at + 3]] };
        let handle = i32::from_ne_bytes(word(0));
        let mask = u32::from_ne_bytes(word(4));
        let cookie = u32::from_ne_bytes(word(8));
        let len = usize::try_from(u32::from_ne_bytes(word(12))).ok()?;

        let name_end = HEADER_SIZE.checked_add(len)?;
        let raw_name = rest.get(HEADER_SIZE..name_end)?;
        let trimmed = raw_name
            .iter()
            .rposition(|&b| b != 0)
            .map_or(&raw_name[..0], |last| &raw_name[..=last]);

        self.offset += name_end;

        Some(ChangeRecord {
            handle: WatchHandle::from_raw(handle),
            mask: EventMask::from_bits_retain(mask),
            cookie,
            name: OsStr::from_bytes(trimmed).to_os_string(),
        })
    }
}
