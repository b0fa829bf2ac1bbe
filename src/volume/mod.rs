//! Volume collaborator interface
//!
//! The capture engine never touches a filesystem directly. Everything it knows
//! about a volume comes through the traits in this module: a [`VolumeSource`]
//! opens a [`Volume`], the volume hands out [`VolumeObject`]s for the root and
//! for enumerated children, and objects hand out [`StreamReader`]s for their
//! data and reparse-point streams. Dropping an object or a reader releases it.
//!
//! Two implementations ship with the crate: [`MemoryVolume`], a synthetic
//! volume with fault injection, and [`HostVolume`], which presents a local
//! directory tree read-only.

pub mod host;
pub mod memory;

pub use host::{HostVolume, HostVolumeSource};
pub use memory::{MemoryVolume, MemoryVolumeBuilder};

use crate::error::CaptureError;
use crate::types::ObjectRef;
use chrono::{DateTime, TimeZone, Utc};
use std::io;
use std::ops::{BitOr, Deref};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::error;

/// Object attribute flags, as stored by NTFS
pub mod attributes {
    pub const READONLY: u32 = 0x0000_0001;
    pub const HIDDEN: u32 = 0x0000_0002;
    pub const SYSTEM: u32 = 0x0000_0004;
    pub const DIRECTORY: u32 = 0x0000_0010;
    pub const ARCHIVE: u32 = 0x0000_0020;
    pub const DEVICE: u32 = 0x0000_0040;
    pub const NORMAL: u32 = 0x0000_0080;
    pub const SPARSE_FILE: u32 = 0x0000_0200;
    pub const REPARSE_POINT: u32 = 0x0000_0400;
    pub const COMPRESSED: u32 = 0x0000_0800;
}

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_EPOCH_SECS: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: i64 = 10_000_000;

/// Convert a wall-clock time to 100ns intervals since 1601-01-01 UTC.
///
/// Times before 1601 clamp to zero.
pub fn filetime_from_system_time(time: SystemTime) -> u64 {
    let datetime: DateTime<Utc> = time.into();
    let secs = datetime.timestamp() + FILETIME_UNIX_EPOCH_SECS;
    if secs < 0 {
        return 0;
    }
    secs as u64 * FILETIME_TICKS_PER_SEC as u64 + u64::from(datetime.timestamp_subsec_nanos() / 100)
}

/// Convert 100ns intervals since 1601-01-01 UTC back to a calendar time.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let ticks = i64::try_from(filetime).ok()?;
    let secs = ticks / FILETIME_TICKS_PER_SEC - FILETIME_UNIX_EPOCH_SECS;
    let nanos = (ticks % FILETIME_TICKS_PER_SEC) as u32 * 100;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Stream type selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Unnamed or named data stream
    Data,
    /// Reparse-point payload
    ReparsePoint,
}

/// One stream attached to an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    /// UTF-16 stream name; empty for the unnamed stream
    pub name: Vec<u16>,
    pub size: u64,
}

impl StreamDescriptor {
    pub fn is_unnamed(&self) -> bool {
        self.name.is_empty()
    }
}

/// Raw object metadata, already in host byte order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub creation_time: u64,
    pub last_write_time: u64,
    pub last_access_time: u64,
    pub attributes: u32,
    /// Hard-link identity (the MFT record number on NTFS)
    pub identity: u64,
    /// Security ID recorded in the object itself, if any
    pub security_id: Option<u32>,
}

/// Which parts of a security descriptor to retrieve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityInformation(u32);

impl SecurityInformation {
    pub const OWNER: Self = Self(0x1);
    pub const GROUP: Self = Self(0x2);
    pub const DACL: Self = Self(0x4);
    pub const SACL: Self = Self(0x8);
    pub const ALL: Self = Self(0xf);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SecurityInformation {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Why directory enumeration stopped early
#[derive(Debug)]
pub enum EnumerateError {
    /// The visitor returned an error; enumeration stopped and hands it back unchanged
    Callback(CaptureError),
    /// The enumeration primitive itself failed
    Failed(io::Error),
}

/// Visitor invoked once per directory entry with the entry's UTF-16 name and a
/// reference the volume can resolve with [`Volume::open_child`].
pub type ChildVisitor<'a> = dyn FnMut(&[u16], ObjectRef) -> Result<(), CaptureError> + 'a;

/// Random-access reader over one stream
pub trait StreamReader {
    /// Declared stream length in bytes
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`, returning how many were read.
    ///
    /// Fewer bytes than requested means the data ended early.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// An open filesystem object (file, directory, or reparse point)
pub trait VolumeObject {
    fn metadata(&self) -> io::Result<ObjectMetadata>;

    /// Invoke `visit` synchronously once per child. Must stop at the first
    /// visitor error and return it as [`EnumerateError::Callback`].
    fn enumerate_children(&self, visit: &mut ChildVisitor<'_>) -> Result<(), EnumerateError>;

    /// All streams of the given kind. Finite, in volume order.
    fn streams(&self, kind: StreamKind) -> io::Result<Vec<StreamDescriptor>>;

    fn open_stream(&self, kind: StreamKind, name: &[u16]) -> io::Result<Box<dyn StreamReader + '_>>;

    /// Size-then-fetch security query.
    ///
    /// Always returns the length the descriptor requires. The descriptor is
    /// copied into `buf` only when `buf` is at least that long, so an empty
    /// buffer asks for the length alone.
    fn security_descriptor(&self, info: SecurityInformation, buf: &mut [u8]) -> io::Result<usize>;
}

/// An open volume
pub trait Volume: Send + Sync {
    /// Name the volume was opened under
    fn device(&self) -> &str;

    fn open_root(&self) -> io::Result<Box<dyn VolumeObject + '_>>;

    fn open_child(&self, reference: ObjectRef) -> io::Result<Box<dyn VolumeObject + '_>>;

    /// Reopen a stream by object path, for reading captured streams back later.
    fn open_stream_at(
        &self,
        path: &str,
        kind: StreamKind,
        name: &[u16],
    ) -> io::Result<Box<dyn StreamReader + '_>>;

    fn close(&self) -> io::Result<()>;
}

/// Opens volumes by device name
pub trait VolumeSource {
    fn open_volume(&self, device: &str) -> io::Result<Box<dyn Volume>>;
}

/// Owner of an open volume, shared between the capture entry point and every
/// stream record that still has to be read from the volume.
///
/// The volume is closed exactly once: by [`VolumeHandle::release`] when the
/// releasing caller holds the last reference, or otherwise when the last
/// reference is dropped.
pub struct VolumeHandle {
    volume: Box<dyn Volume>,
    closed: bool,
}

/// Reference-counted volume handle
pub type SharedVolume = Arc<VolumeHandle>;

impl VolumeHandle {
    pub fn share(volume: Box<dyn Volume>) -> SharedVolume {
        Arc::new(Self {
            volume,
            closed: false,
        })
    }

    /// Give up one reference. Returns `Ok(true)` if this closed the volume and
    /// `Ok(false)` if other references keep it open.
    pub fn release(handle: SharedVolume) -> io::Result<bool> {
        match Arc::try_unwrap(handle) {
            Ok(mut handle) => {
                handle.closed = true;
                handle.volume.close().map(|()| true)
            }
            Err(_) => Ok(false),
        }
    }
}

impl Deref for VolumeHandle {
    type Target = dyn Volume;

    fn deref(&self) -> &Self::Target {
        self.volume.as_ref()
    }
}

impl std::fmt::Debug for VolumeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeHandle")
            .field("device", &self.volume.device())
            .finish()
    }
}

impl Drop for VolumeHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.volume.close() {
            error!(device = %self.volume.device(), "Failed to close volume: {}", e);
        }
    }
}

/// Reader over bytes already held in memory
#[derive(Debug, Clone)]
pub struct BufferReader {
    data: Arc<[u8]>,
}

impl BufferReader {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl StreamReader for BufferReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let end = start.saturating_add(buf.len()).min(self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(end - start)
    }
}
