//! Path construction and name transcoding for the capture walk

use std::string::FromUtf16Error;
use unicode_normalization::UnicodeNormalization;

/// Separator between path segments inside a volume
pub const SEPARATOR: char = '/';

/// One growable path buffer shared by an entire recursive walk.
///
/// Each visit receives the length of its own path as a checkpoint and writes a
/// child segment by truncating back to that checkpoint first, so a sibling
/// always overwrites whatever the previous sibling's subtree left behind.
#[derive(Debug, Clone)]
pub struct PathBuffer {
    buf: String,
}

impl PathBuffer {
    /// Length of the root path `/`
    pub const ROOT_LEN: usize = 1;

    pub fn new() -> Self {
        let mut buf = String::with_capacity(256);
        buf.push(SEPARATOR);
        Self { buf }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Cut the buffer back to a checkpoint previously returned by this buffer.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Path up to a checkpoint
    pub fn prefix(&self, len: usize) -> &str {
        &self.buf[..len.min(self.buf.len())]
    }

    /// Write `name` as the segment following the first `prefix_len` bytes and
    /// return the checkpoint of the resulting path.
    pub fn push_segment(&mut self, prefix_len: usize, name: &str) -> usize {
        self.buf.truncate(prefix_len);
        if !self.buf.ends_with(SEPARATOR) {
            self.buf.push(SEPARATOR);
        }
        self.buf.push_str(name);
        self.buf.len()
    }
}

impl Default for PathBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Transcode a UTF-16 volume name into the manifest's UTF-8 form.
///
/// Unpaired surrogates are rejected rather than replaced. With `normalize`,
/// the result is additionally brought into Unicode NFC.
pub fn decode_name(units: &[u16], normalize: bool) -> Result<String, FromUtf16Error> {
    let name = String::from_utf16(units)?;
    if normalize {
        Ok(normalize_name(&name))
    } else {
        Ok(name)
    }
}

/// Normalize a name to NFC (Canonical Composition)
pub fn normalize_name(name: &str) -> String {
    name.nfc().collect()
}

/// Encode a UTF-8 name as the UTF-16 units a volume stores.
pub fn encode_name(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

/// Non-empty segments of a volume path; `/` yields nothing.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|segment| !segment.is_empty())
}
