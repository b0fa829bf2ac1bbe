//! Synthetic in-memory volume
//!
//! Built up front with [`MemoryVolumeBuilder`], then opened like any other
//! volume. Faults can be injected per object (failed open, failed
//! enumeration, short stream reads, a security descriptor whose length
//! changes between the size and fetch queries) and per volume (failed open,
//! failed root open, failed close). The volume also records what the capture
//! did to it: which objects were opened, how many handles are still live and
//! whether it was closed.

use super::{
    attributes, BufferReader, ChildVisitor, EnumerateError, ObjectMetadata, SecurityInformation,
    StreamDescriptor, StreamKind, StreamReader, Volume, VolumeObject, VolumeSource,
};
use crate::tree::path;
use crate::types::ObjectRef;
use parking_lot::Mutex;
use std::cell::Cell;
use std::io;
use std::sync::Arc;

/// Descriptor every object gets unless one is set explicitly
pub const DEFAULT_SECURITY_DESCRIPTOR: &[u8] = b"O:BAG:BAD:(A;;FA;;;WD)";

/// Record number of the root directory, as on NTFS
const ROOT_RECORD: u64 = 5;

/// Bytes a drifting descriptor grows by between two queries
const SECURITY_DRIFT: usize = 4;

#[derive(Debug, Clone)]
struct MemoryStream {
    name: Vec<u16>,
    data: Arc<[u8]>,
    fail_at: Option<u64>,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Directory(Vec<usize>),
    File,
    ReparsePoint(MemoryStream),
    Device,
}

#[derive(Debug, Clone)]
struct MemoryNode {
    name: Vec<u16>,
    path: String,
    kind: NodeKind,
    metadata: ObjectMetadata,
    streams: Vec<MemoryStream>,
    security: Vec<u8>,
    fail_open: bool,
    fail_enumeration: bool,
    security_drift: bool,
}

#[derive(Debug, Default)]
struct VolumeState {
    opened: Vec<String>,
    live_objects: usize,
    closed: bool,
    close_calls: usize,
}

#[derive(Debug)]
struct Inner {
    device: String,
    nodes: Vec<MemoryNode>,
    fail_open_volume: bool,
    fail_open_root: bool,
    fail_close: bool,
    state: Mutex<VolumeState>,
}

/// In-memory volume. Clones share the same contents and state.
#[derive(Debug, Clone)]
pub struct MemoryVolume {
    inner: Arc<Inner>,
}

/// Builder for [`MemoryVolume`]. Object references returned by the builder
/// are the same references the volume hands out during enumeration.
#[derive(Debug)]
pub struct MemoryVolumeBuilder {
    device: String,
    nodes: Vec<MemoryNode>,
    fail_open_volume: bool,
    fail_open_root: bool,
    fail_close: bool,
    clock: u64,
}

impl MemoryVolume {
    pub fn builder(device: impl Into<String>) -> MemoryVolumeBuilder {
        MemoryVolumeBuilder::new(device)
    }

    /// Paths of every object opened so far, in order
    pub fn opened_paths(&self) -> Vec<String> {
        self.inner.state.lock().opened.clone()
    }

    /// Object handles currently open
    pub fn live_objects(&self) -> usize {
        self.inner.state.lock().live_objects
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn close_calls(&self) -> usize {
        self.inner.state.lock().close_calls
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.inner.state.lock().closed {
            return Err(io::Error::new(io::ErrorKind::Other, "volume is closed"));
        }
        Ok(())
    }

    fn open_node(&self, index: usize) -> io::Result<Box<dyn VolumeObject + '_>> {
        self.ensure_open()?;
        let node = self.inner.nodes.get(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no object #{}", index))
        })?;
        if node.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot open {}", node.path),
            ));
        }

        let mut state = self.inner.state.lock();
        state.opened.push(node.path.clone());
        state.live_objects += 1;
        Ok(Box::new(MemoryObject {
            inner: self.inner.as_ref(),
            node,
            security_queries: Cell::new(0),
        }))
    }

    fn resolve(&self, object_path: &str) -> io::Result<&MemoryNode> {
        let mut index = 0;
        for segment in path::segments(object_path) {
            let wanted = path::encode_name(segment);
            let NodeKind::Directory(children) = &self.inner.nodes[index].kind else {
                return Err(io::Error::new(io::ErrorKind::NotFound, object_path.to_string()));
            };
            index = children
                .iter()
                .copied()
                .find(|&child| self.inner.nodes[child].name == wanted)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, object_path.to_string()))?;
        }
        Ok(&self.inner.nodes[index])
    }
}

impl VolumeSource for MemoryVolume {
    fn open_volume(&self, device: &str) -> io::Result<Box<dyn Volume>> {
        if self.inner.fail_open_volume || device != self.inner.device {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no volume named `{}`", device),
            ));
        }
        self.inner.state.lock().closed = false;
        Ok(Box::new(self.clone()))
    }
}

impl Volume for MemoryVolume {
    fn device(&self) -> &str {
        &self.inner.device
    }

    fn open_root(&self) -> io::Result<Box<dyn VolumeObject + '_>> {
        if self.inner.fail_open_root {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "root record is damaged"));
        }
        self.open_node(0)
    }

    fn open_child(&self, reference: ObjectRef) -> io::Result<Box<dyn VolumeObject + '_>> {
        let index = usize::try_from(reference).unwrap_or(usize::MAX);
        self.open_node(index)
    }

    fn open_stream_at(
        &self,
        object_path: &str,
        kind: StreamKind,
        name: &[u16],
    ) -> io::Result<Box<dyn StreamReader + '_>> {
        self.ensure_open()?;
        let node = self.resolve(object_path)?;
        node.open_stream(kind, name)
    }

    fn close(&self) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        state.close_calls += 1;
        if self.inner.fail_close {
            return Err(io::Error::new(io::ErrorKind::Other, "volume is busy"));
        }
        state.closed = true;
        Ok(())
    }
}

impl MemoryNode {
    fn open_stream(&self, kind: StreamKind, name: &[u16]) -> io::Result<Box<dyn StreamReader + 'static>> {
        let stream = match (kind, &self.kind) {
            (StreamKind::ReparsePoint, NodeKind::ReparsePoint(payload)) if name.is_empty() => {
                Some(payload)
            }
            (StreamKind::Data, _) => self.streams.iter().find(|s| s.name == name),
            _ => None,
        };
        let stream = stream.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} has no such {:?} stream", self.path, kind),
            )
        })?;
        Ok(Box::new(MemoryReader {
            data: BufferReader::new(Arc::clone(&stream.data)),
            size: stream.data.len() as u64,
            fail_at: stream.fail_at,
        }))
    }
}

struct MemoryObject<'v> {
    inner: &'v Inner,
    node: &'v MemoryNode,
    security_queries: Cell<u32>,
}

impl Drop for MemoryObject<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().live_objects -= 1;
    }
}

impl VolumeObject for MemoryObject<'_> {
    fn metadata(&self) -> io::Result<ObjectMetadata> {
        Ok(self.node.metadata.clone())
    }

    fn enumerate_children(&self, visit: &mut ChildVisitor<'_>) -> Result<(), EnumerateError> {
        let NodeKind::Directory(children) = &self.node.kind else {
            return Err(EnumerateError::Failed(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a directory", self.node.path),
            )));
        };
        if self.node.fail_enumeration {
            return Err(EnumerateError::Failed(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("index of {} is corrupt", self.node.path),
            )));
        }
        for &child in children {
            visit(&self.inner.nodes[child].name, child as ObjectRef)
                .map_err(EnumerateError::Callback)?;
        }
        Ok(())
    }

    fn streams(&self, kind: StreamKind) -> io::Result<Vec<StreamDescriptor>> {
        let descriptors = match (kind, &self.node.kind) {
            (StreamKind::ReparsePoint, NodeKind::ReparsePoint(payload)) => vec![StreamDescriptor {
                kind,
                name: payload.name.clone(),
                size: payload.data.len() as u64,
            }],
            (StreamKind::ReparsePoint, _) => Vec::new(),
            (StreamKind::Data, _) => self
                .node
                .streams
                .iter()
                .map(|stream| StreamDescriptor {
                    kind,
                    name: stream.name.clone(),
                    size: stream.data.len() as u64,
                })
                .collect(),
        };
        Ok(descriptors)
    }

    fn open_stream(&self, kind: StreamKind, name: &[u16]) -> io::Result<Box<dyn StreamReader + '_>> {
        self.node.open_stream(kind, name)
    }

    fn security_descriptor(&self, _info: SecurityInformation, buf: &mut [u8]) -> io::Result<usize> {
        let queries = self.security_queries.get();
        self.security_queries.set(queries + 1);

        let descriptor = &self.node.security;
        let mut required = descriptor.len();
        if self.node.security_drift && queries > 0 {
            required += SECURITY_DRIFT;
        }
        if buf.len() >= required {
            buf[..descriptor.len()].copy_from_slice(descriptor);
            buf[descriptor.len()..required].fill(0);
        }
        Ok(required)
    }
}

/// Stream reader that stops returning data at an injected offset
struct MemoryReader {
    data: BufferReader,
    size: u64,
    fail_at: Option<u64>,
}

impl StreamReader for MemoryReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut len = buf.len();
        if let Some(fail_at) = self.fail_at {
            let allowed = fail_at.saturating_sub(offset);
            len = len.min(usize::try_from(allowed).unwrap_or(usize::MAX));
        }
        self.data.read_at(offset, &mut buf[..len])
    }
}

impl MemoryVolumeBuilder {
    pub fn new(device: impl Into<String>) -> Self {
        let root = MemoryNode {
            name: Vec::new(),
            path: path::SEPARATOR.to_string(),
            kind: NodeKind::Directory(Vec::new()),
            metadata: ObjectMetadata {
                attributes: attributes::DIRECTORY,
                identity: ROOT_RECORD,
                ..ObjectMetadata::default()
            },
            streams: Vec::new(),
            security: DEFAULT_SECURITY_DESCRIPTOR.to_vec(),
            fail_open: false,
            fail_enumeration: false,
            security_drift: false,
        };
        let mut builder = Self {
            device: device.into(),
            nodes: vec![root],
            fail_open_volume: false,
            fail_open_root: false,
            fail_close: false,
            clock: 132_000_000_000_000_000,
        };
        builder.stamp(0);
        builder
    }

    pub fn root(&self) -> ObjectRef {
        0
    }

    pub fn directory(&mut self, parent: ObjectRef, name: &str) -> ObjectRef {
        self.add(
            parent,
            path::encode_name(name),
            NodeKind::Directory(Vec::new()),
            attributes::DIRECTORY,
        )
    }

    /// Regular file whose unnamed data stream holds `data`
    pub fn file(&mut self, parent: ObjectRef, name: &str, data: &[u8]) -> ObjectRef {
        self.file_utf16(parent, &path::encode_name(name), data)
    }

    /// Regular file named by raw UTF-16 units, which need not be valid
    pub fn file_utf16(&mut self, parent: ObjectRef, name: &[u16], data: &[u8]) -> ObjectRef {
        let file = self.add(parent, name.to_vec(), NodeKind::File, attributes::ARCHIVE);
        self.node(file).streams.push(MemoryStream {
            name: Vec::new(),
            data: Arc::from(data),
            fail_at: None,
        });
        file
    }

    /// Regular file without any data stream
    pub fn empty_file(&mut self, parent: ObjectRef, name: &str) -> ObjectRef {
        self.add(parent, path::encode_name(name), NodeKind::File, attributes::ARCHIVE)
    }

    pub fn reparse_point(&mut self, parent: ObjectRef, name: &str, payload: &[u8]) -> ObjectRef {
        let payload = MemoryStream {
            name: Vec::new(),
            data: Arc::from(payload),
            fail_at: None,
        };
        self.add(
            parent,
            path::encode_name(name),
            NodeKind::ReparsePoint(payload),
            attributes::REPARSE_POINT,
        )
    }

    pub fn device(&mut self, parent: ObjectRef, name: &str) -> ObjectRef {
        self.add(parent, path::encode_name(name), NodeKind::Device, attributes::DEVICE)
    }

    /// Attach a named data stream to any object
    pub fn named_stream(&mut self, object: ObjectRef, name: &str, data: &[u8]) -> &mut Self {
        self.node(object).streams.push(MemoryStream {
            name: path::encode_name(name),
            data: Arc::from(data),
            fail_at: None,
        });
        self
    }

    /// Attach another unnamed data stream, which no valid volume has
    pub fn extra_unnamed_stream(&mut self, object: ObjectRef, data: &[u8]) -> &mut Self {
        self.node(object).streams.push(MemoryStream {
            name: Vec::new(),
            data: Arc::from(data),
            fail_at: None,
        });
        self
    }

    pub fn security(&mut self, object: ObjectRef, descriptor: &[u8]) -> &mut Self {
        self.node(object).security = descriptor.to_vec();
        self
    }

    pub fn attributes(&mut self, object: ObjectRef, attributes: u32) -> &mut Self {
        self.node(object).metadata.attributes = attributes;
        self
    }

    pub fn times(&mut self, object: ObjectRef, creation: u64, write: u64, access: u64) -> &mut Self {
        let metadata = &mut self.node(object).metadata;
        metadata.creation_time = creation;
        metadata.last_write_time = write;
        metadata.last_access_time = access;
        self
    }

    /// Security ID stored in the object's own record
    pub fn raw_security_id(&mut self, object: ObjectRef, id: u32) -> &mut Self {
        self.node(object).metadata.security_id = Some(id);
        self
    }

    /// Make reads of the named stream (empty name = unnamed, reparse payload
    /// included) stop returning data at byte `offset`.
    pub fn fail_read_at(&mut self, object: ObjectRef, stream: &str, offset: u64) -> &mut Self {
        let wanted = path::encode_name(stream);
        let node = self.node(object);
        if let NodeKind::ReparsePoint(payload) = &mut node.kind {
            if payload.name == wanted {
                payload.fail_at = Some(offset);
            }
        }
        for data in node.streams.iter_mut().filter(|s| s.name == wanted) {
            data.fail_at = Some(offset);
        }
        self
    }

    pub fn fail_open(&mut self, object: ObjectRef) -> &mut Self {
        self.node(object).fail_open = true;
        self
    }

    pub fn fail_enumeration(&mut self, directory: ObjectRef) -> &mut Self {
        self.node(directory).fail_enumeration = true;
        self
    }

    /// Make the descriptor grow between the size query and the fetch
    pub fn security_drift(&mut self, object: ObjectRef) -> &mut Self {
        self.node(object).security_drift = true;
        self
    }

    pub fn fail_open_volume(&mut self) -> &mut Self {
        self.fail_open_volume = true;
        self
    }

    pub fn fail_open_root(&mut self) -> &mut Self {
        self.fail_open_root = true;
        self
    }

    pub fn fail_close(&mut self) -> &mut Self {
        self.fail_close = true;
        self
    }

    pub fn build(self) -> MemoryVolume {
        MemoryVolume {
            inner: Arc::new(Inner {
                device: self.device,
                nodes: self.nodes,
                fail_open_volume: self.fail_open_volume,
                fail_open_root: self.fail_open_root,
                fail_close: self.fail_close,
                state: Mutex::new(VolumeState::default()),
            }),
        }
    }

    fn node(&mut self, object: ObjectRef) -> &mut MemoryNode {
        let index = usize::try_from(object).unwrap_or(usize::MAX);
        assert!(index < self.nodes.len(), "unknown object #{}", object);
        &mut self.nodes[index]
    }

    fn stamp(&mut self, index: usize) {
        self.clock += 10_000_000;
        let metadata = &mut self.nodes[index].metadata;
        metadata.creation_time = self.clock;
        metadata.last_write_time = self.clock;
        metadata.last_access_time = self.clock;
    }

    fn add(&mut self, parent: ObjectRef, name: Vec<u16>, kind: NodeKind, attributes: u32) -> ObjectRef {
        let index = self.nodes.len();
        let parent_node = self.node(parent);
        let object_path = format!(
            "{}{}{}",
            parent_node.path.trim_end_matches(path::SEPARATOR),
            path::SEPARATOR,
            String::from_utf16_lossy(&name)
        );

        let NodeKind::Directory(children) = &mut parent_node.kind else {
            panic!("object {} is not a directory", parent_node.path);
        };
        children.push(index);

        self.nodes.push(MemoryNode {
            name,
            path: object_path,
            kind,
            metadata: ObjectMetadata {
                attributes,
                identity: ROOT_RECORD + index as u64,
                ..ObjectMetadata::default()
            },
            streams: Vec::new(),
            security: DEFAULT_SECURITY_DESCRIPTOR.to_vec(),
            fail_open: false,
            fail_enumeration: false,
            security_drift: false,
        });
        self.stamp(index);
        index as ObjectRef
    }
}
