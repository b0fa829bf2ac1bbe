//! Read-only view of a local directory tree as a volume
//!
//! Directories, regular files and symbolic links map onto their volume
//! counterparts; a symlink becomes a reparse point whose payload is the link
//! target. Anything else (sockets, FIFOs, device nodes) is reported with the
//! DEVICE attribute so the capture rejects it. Host permissions are folded
//! into a small synthesized security descriptor.

use super::{
    attributes, filetime_from_system_time, BufferReader, ChildVisitor, EnumerateError,
    ObjectMetadata, SecurityInformation, StreamDescriptor, StreamKind, StreamReader, Volume,
    VolumeObject, VolumeSource,
};
use crate::error::CaptureError;
use crate::tree::path;
use crate::types::ObjectRef;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Magic prefix of synthesized security descriptors
pub const HOST_DESCRIPTOR_MAGIC: &[u8; 4] = b"VCSD";

/// Opens local directories as volumes. The device name is the directory path.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostVolumeSource;

impl VolumeSource for HostVolumeSource {
    fn open_volume(&self, device: &str) -> io::Result<Box<dyn Volume>> {
        Ok(Box::new(HostVolume::open(device)?))
    }
}

/// Local directory presented as a volume
#[derive(Debug)]
pub struct HostVolume {
    device: String,
    root: PathBuf,
    refs: Mutex<RefTable>,
    closed: AtomicBool,
}

/// Paths handed out as object references. A reference opens its object
/// once; the slot is freed by that open.
#[derive(Debug, Default)]
struct RefTable {
    next: ObjectRef,
    paths: HashMap<ObjectRef, PathBuf>,
}

impl HostVolume {
    pub fn open(device: &str) -> io::Result<Self> {
        let root = dunce::canonicalize(device)?;
        if !fs::metadata(&root)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        debug!(device, root = %root.display(), "Opened host volume");
        Ok(Self {
            device: device.to_string(),
            root,
            refs: Mutex::new(RefTable::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// References handed out by enumeration and not yet opened
    pub fn pending_references(&self) -> usize {
        self.refs.lock().paths.len()
    }

    /// `/`-separated path of `path` relative to the volume root
    fn volume_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let mut out = String::from(path::SEPARATOR);
        for (i, component) in relative.components().enumerate() {
            if i > 0 {
                out.push(path::SEPARATOR);
            }
            out.push_str(&component.as_os_str().to_string_lossy());
        }
        out
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "volume is closed"));
        }
        Ok(())
    }

    fn object(&self, path: PathBuf) -> io::Result<Box<dyn VolumeObject + '_>> {
        self.ensure_open()?;
        let metadata = fs::symlink_metadata(&path)?;
        trace!(path = %path.display(), "Opened host object");
        Ok(Box::new(HostObject {
            volume: self,
            path,
            metadata,
        }))
    }

    fn register(&self, path: PathBuf) -> ObjectRef {
        let mut refs = self.refs.lock();
        let reference = refs.next;
        refs.next += 1;
        refs.paths.insert(reference, path);
        reference
    }
}

impl Volume for HostVolume {
    fn device(&self) -> &str {
        &self.device
    }

    fn open_root(&self) -> io::Result<Box<dyn VolumeObject + '_>> {
        self.object(self.root.clone())
    }

    fn open_child(&self, reference: ObjectRef) -> io::Result<Box<dyn VolumeObject + '_>> {
        let path = self
            .refs
            .lock()
            .paths
            .remove(&reference)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("unknown object reference {}", reference),
                )
            })?;
        self.object(path)
    }

    fn open_stream_at(
        &self,
        object_path: &str,
        kind: StreamKind,
        name: &[u16],
    ) -> io::Result<Box<dyn StreamReader + '_>> {
        self.ensure_open()?;
        let mut full = self.root.clone();
        full.extend(path::segments(object_path));
        let metadata = fs::symlink_metadata(&full)?;
        open_host_stream(&full, &metadata, kind, name)
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        self.refs.lock().paths.clear();
        debug!(device = %self.device, "Closed host volume");
        Ok(())
    }
}

struct HostObject<'v> {
    volume: &'v HostVolume,
    path: PathBuf,
    metadata: Metadata,
}

impl HostObject<'_> {
    fn attributes(&self) -> u32 {
        let file_type = self.metadata.file_type();
        let mut attrs = if file_type.is_symlink() {
            attributes::REPARSE_POINT
        } else if file_type.is_dir() {
            attributes::DIRECTORY
        } else if file_type.is_file() {
            attributes::ARCHIVE
        } else {
            attributes::DEVICE
        };
        if self.metadata.permissions().readonly() && !file_type.is_dir() {
            attrs |= attributes::READONLY;
        }
        let hidden = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if hidden && self.path != self.volume.root {
            attrs |= attributes::HIDDEN;
        }
        attrs
    }
}

impl VolumeObject for HostObject<'_> {
    fn metadata(&self) -> io::Result<ObjectMetadata> {
        let modified = self.metadata.modified()?;
        let accessed = self.metadata.accessed().unwrap_or(modified);
        let created = self.metadata.created().unwrap_or(modified);
        Ok(ObjectMetadata {
            creation_time: filetime_from_system_time(created),
            last_write_time: filetime_from_system_time(modified),
            last_access_time: filetime_from_system_time(accessed),
            attributes: self.attributes(),
            identity: identity(&self.metadata),
            security_id: None,
        })
    }

    fn enumerate_children(&self, visit: &mut ChildVisitor<'_>) -> Result<(), EnumerateError> {
        self.volume.ensure_open().map_err(EnumerateError::Failed)?;
        let entries = WalkDir::new(&self.path)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name();
        for entry in entries {
            let entry = entry.map_err(|e| EnumerateError::Failed(io::Error::from(e)))?;
            let Some(name) = entry.file_name().to_str() else {
                return Err(EnumerateError::Callback(CaptureError::InvalidName {
                    path: self.volume.volume_path(&self.path),
                    detail: format!(
                        "host name {:?} is not valid Unicode",
                        entry.file_name()
                    ),
                }));
            };
            let name = path::encode_name(name);
            let reference = self.volume.register(entry.into_path());
            visit(&name, reference).map_err(EnumerateError::Callback)?;
        }
        Ok(())
    }

    fn streams(&self, kind: StreamKind) -> io::Result<Vec<StreamDescriptor>> {
        let file_type = self.metadata.file_type();
        let size = match kind {
            StreamKind::Data if file_type.is_file() => self.metadata.len(),
            StreamKind::ReparsePoint if file_type.is_symlink() => {
                link_target(&self.path)?.len() as u64
            }
            _ => return Ok(Vec::new()),
        };
        Ok(vec![StreamDescriptor {
            kind,
            name: Vec::new(),
            size,
        }])
    }

    fn open_stream(&self, kind: StreamKind, name: &[u16]) -> io::Result<Box<dyn StreamReader + '_>> {
        open_host_stream(&self.path, &self.metadata, kind, name)
    }

    fn security_descriptor(&self, _info: SecurityInformation, buf: &mut [u8]) -> io::Result<usize> {
        let descriptor = synthesize_descriptor(&self.metadata);
        if buf.len() >= descriptor.len() {
            buf[..descriptor.len()].copy_from_slice(&descriptor);
        }
        Ok(descriptor.len())
    }
}

fn open_host_stream(
    path: &Path,
    metadata: &Metadata,
    kind: StreamKind,
    name: &[u16],
) -> io::Result<Box<dyn StreamReader + 'static>> {
    let file_type = metadata.file_type();
    match kind {
        _ if !name.is_empty() => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} has no named streams", path.display()),
        )),
        StreamKind::Data if file_type.is_file() => {
            let file = File::open(path)?;
            Ok(Box::new(HostFileReader {
                file,
                size: metadata.len(),
            }))
        }
        StreamKind::ReparsePoint if file_type.is_symlink() => {
            Ok(Box::new(BufferReader::new(Arc::<[u8]>::from(link_target(path)?))))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} has no {:?} stream", path.display(), kind),
        )),
    }
}

/// Raw bytes of a symlink's target
fn link_target(path: &Path) -> io::Result<Vec<u8>> {
    let target = fs::read_link(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Ok(target.as_os_str().as_bytes().to_vec())
    }
    #[cfg(not(unix))]
    {
        Ok(target.to_string_lossy().into_owned().into_bytes())
    }
}

#[cfg(unix)]
fn identity(metadata: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn identity(_metadata: &Metadata) -> u64 {
    0
}

/// `VCSD`, owner, group and permission bits, all little-endian u32
fn synthesize_descriptor(metadata: &Metadata) -> [u8; 16] {
    #[cfg(unix)]
    let (owner, group, mode) = {
        use std::os::unix::fs::MetadataExt;
        (metadata.uid(), metadata.gid(), metadata.mode() & 0o7777)
    };
    #[cfg(not(unix))]
    let (owner, group, mode) = if metadata.permissions().readonly() {
        (0u32, 0u32, 0o444u32)
    } else {
        (0, 0, 0o644)
    };

    let mut descriptor = [0u8; 16];
    descriptor[..4].copy_from_slice(HOST_DESCRIPTOR_MAGIC);
    descriptor[4..8].copy_from_slice(&owner.to_le_bytes());
    descriptor[8..12].copy_from_slice(&group.to_le_bytes());
    descriptor[12..].copy_from_slice(&mode.to_le_bytes());
    descriptor
}

/// Positional reader over a host file
struct HostFileReader {
    file: File,
    size: u64,
}

impl StreamReader for HostFileReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}
