//! Recursive capture of a volume's object tree
//!
//! The walker visits objects depth-first in enumeration order. Each object is
//! classified by its attributes (reparse point, then device, then directory,
//! otherwise regular file), its streams are hashed into the stream store, and
//! its security descriptor is registered with the security index. Every
//! failure aborts the current subtree and propagates to the top; whatever was
//! linked before the failure stays linked.

use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::security::{SecurityData, SecurityIndex};
use crate::store::{LinkError, StreamLocation, StreamStore, VolumeLocation};
use crate::tree::hasher;
use crate::tree::node::Dentry;
use crate::tree::path::{self, PathBuffer};
use crate::types::{Hash, ObjectRef};
use crate::volume::{
    attributes, EnumerateError, SecurityInformation, SharedVolume, StreamDescriptor, StreamKind,
    VolumeObject,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

/// Counters accumulated over one capture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Objects visited, the root included
    pub objects: u64,
    pub directories: u64,
    pub files: u64,
    pub reparse_points: u64,
    pub named_streams: u64,
    /// Streams that created a new store record
    pub unique_streams: u64,
    /// Streams that took a reference to an existing record
    pub shared_references: u64,
    /// Streams held in memory instead of on the volume
    pub inline_streams: u64,
    pub bytes_hashed: u64,
    /// Entries in the security descriptor table after the capture
    pub security_descriptors: u64,
    pub duration_ms: u64,
}

/// Capture state for one walk over one volume
pub struct TreeWalker<'c> {
    volume: &'c SharedVolume,
    store: &'c mut StreamStore,
    security: &'c mut SecurityData,
    index: SecurityIndex,
    path: PathBuffer,
    config: &'c CaptureConfig,
    stats: CaptureStats,
}

impl<'c> TreeWalker<'c> {
    pub fn new(
        volume: &'c SharedVolume,
        store: &'c mut StreamStore,
        security: &'c mut SecurityData,
        config: &'c CaptureConfig,
    ) -> Self {
        let index = SecurityIndex::from_table(security);
        Self {
            volume,
            store,
            security,
            index,
            path: PathBuffer::new(),
            config,
            stats: CaptureStats::default(),
        }
    }

    /// Capture the volume root into `root`
    pub fn capture_root(
        &mut self,
        root: &mut Dentry,
        object: &dyn VolumeObject,
    ) -> Result<(), CaptureError> {
        self.capture_object(root, object, PathBuffer::ROOT_LEN)
    }

    pub fn into_stats(self) -> CaptureStats {
        CaptureStats {
            security_descriptors: self.security.len() as u64,
            ..self.stats
        }
    }

    /// Capture one object whose path occupies the first `path_len` bytes of
    /// the path buffer.
    fn capture_object(
        &mut self,
        dentry: &mut Dentry,
        object: &dyn VolumeObject,
        path_len: usize,
    ) -> Result<(), CaptureError> {
        self.path.truncate(path_len);
        self.stats.objects += 1;

        let metadata = object
            .metadata()
            .map_err(|e| CaptureError::read(self.path.as_str(), e))?;
        dentry.apply_metadata(&metadata);

        let attrs = metadata.attributes;
        if attrs & attributes::REPARSE_POINT != 0 {
            self.capture_reparse_point(dentry, object, path_len)?;
        } else if attrs & attributes::DEVICE != 0 {
            return Err(CaptureError::unsupported(
                self.path.as_str(),
                "device objects cannot be captured",
            ));
        } else if attrs & attributes::DIRECTORY != 0 {
            self.capture_children(dentry, object, path_len)?;
        } else {
            self.capture_data_streams(dentry, object, path_len)?;
        }

        self.capture_security(dentry, object, path_len)
    }

    fn capture_children(
        &mut self,
        dentry: &mut Dentry,
        object: &dyn VolumeObject,
        path_len: usize,
    ) -> Result<(), CaptureError> {
        self.stats.directories += 1;

        let result = {
            let mut visit = |name: &[u16], reference: ObjectRef| {
                self.capture_child(dentry, name, reference, path_len)
            };
            object.enumerate_children(&mut visit)
        };

        self.path.truncate(path_len);
        match result {
            Ok(()) => {
                debug!(
                    path = self.path.as_str(),
                    children = dentry.children.len(),
                    "Captured directory"
                );
                Ok(())
            }
            Err(EnumerateError::Callback(e)) => Err(e),
            Err(EnumerateError::Failed(source)) => Err(CaptureError::Enumeration {
                path: self.path.as_str().to_string(),
                source,
            }),
        }
    }

    fn capture_child(
        &mut self,
        parent: &mut Dentry,
        name: &[u16],
        reference: ObjectRef,
        path_len: usize,
    ) -> Result<(), CaptureError> {
        let raw_name = path::decode_name(name, false).map_err(|e| CaptureError::InvalidName {
            path: self.path.prefix(path_len).to_string(),
            detail: e.to_string(),
        })?;
        // The path buffer addresses the volume, so it keeps the on-volume
        // spelling; only the manifest name is normalized.
        let child_len = self.path.push_segment(path_len, &raw_name);
        let name = if self.config.normalize_names {
            path::normalize_name(&raw_name)
        } else {
            raw_name
        };

        let volume = self.volume;
        let child_object = volume
            .open_child(reference)
            .map_err(|source| CaptureError::ObjectOpen {
                path: self.path.as_str().to_string(),
                source,
            })?;

        let mut child = Dentry::new(name);
        let result = self.capture_object(&mut child, child_object.as_ref(), child_len);
        drop(child_object);

        let linked = parent.link_child(child);
        result?;
        linked.map_err(|e| CaptureError::allocation(self.path.prefix(path_len), e))
    }

    fn capture_data_streams(
        &mut self,
        dentry: &mut Dentry,
        object: &dyn VolumeObject,
        path_len: usize,
    ) -> Result<(), CaptureError> {
        self.stats.files += 1;
        let path = self.path.prefix(path_len).to_string();
        let streams = object
            .streams(StreamKind::Data)
            .map_err(|e| CaptureError::read(&path, e))?;

        for descriptor in &streams {
            if descriptor.is_unnamed() {
                self.capture_stream(object, descriptor, &path, |hash| {
                    if dentry.stream.is_some() {
                        return Err(CaptureError::unsupported(
                            &path,
                            "more than one unnamed data stream",
                        ));
                    }
                    dentry.stream = Some(hash);
                    Ok(())
                })?;
            } else {
                let name = path::decode_name(&descriptor.name, self.config.normalize_names)
                    .map_err(|e| CaptureError::InvalidName {
                        path: path.clone(),
                        detail: format!("stream name: {}", e),
                    })?;
                self.capture_stream(object, descriptor, &path, |hash| {
                    dentry
                        .add_named_stream(name, hash)
                        .map_err(|e| CaptureError::allocation(&path, e))
                })?;
                self.stats.named_streams += 1;
            }
        }
        Ok(())
    }

    fn capture_reparse_point(
        &mut self,
        dentry: &mut Dentry,
        object: &dyn VolumeObject,
        path_len: usize,
    ) -> Result<(), CaptureError> {
        self.stats.reparse_points += 1;
        let path = self.path.prefix(path_len).to_string();
        let streams = object
            .streams(StreamKind::ReparsePoint)
            .map_err(|e| CaptureError::read(&path, e))?;

        for descriptor in &streams {
            if !descriptor.is_unnamed() {
                return Err(CaptureError::unsupported(
                    &path,
                    "named reparse-point stream",
                ));
            }
            self.capture_stream(object, descriptor, &path, |hash| {
                if dentry.stream.is_some() {
                    return Err(CaptureError::unsupported(
                        &path,
                        "more than one reparse-point stream",
                    ));
                }
                dentry.stream = Some(hash);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Hash one stream, take a store reference for it and run `link` to
    /// record the digest in its manifest slot.
    fn capture_stream(
        &mut self,
        object: &dyn VolumeObject,
        descriptor: &StreamDescriptor,
        path: &str,
        link: impl FnOnce(Hash) -> Result<(), CaptureError>,
    ) -> Result<(), CaptureError> {
        let mut reader = object
            .open_stream(descriptor.kind, &descriptor.name)
            .map_err(|e| CaptureError::read(path, e))?;
        let size = reader.size();

        let inline = size == 0 || size <= self.config.inline_limit;
        let (hash, location) = if inline {
            let mut data = Vec::new();
            let capacity = usize::try_from(size).unwrap_or(usize::MAX);
            data.try_reserve_exact(capacity)
                .map_err(|e| CaptureError::allocation(path, e))?;
            let hash = hasher::hash_stream_into(reader.as_mut(), &mut data)
                .map_err(|e| CaptureError::read(path, e))?;
            (hash, StreamLocation::Buffer(Arc::from(data)))
        } else {
            let hash =
                hasher::hash_stream(reader.as_mut()).map_err(|e| CaptureError::read(path, e))?;
            let location = VolumeLocation {
                volume: Arc::clone(self.volume),
                path: path.to_string(),
                kind: descriptor.kind,
                name: descriptor.name.clone(),
            };
            (hash, StreamLocation::Volume(location))
        };
        drop(reader);
        self.stats.bytes_hashed += size;

        let is_new = match self.store.share_and_link(hash, size, location, link) {
            Ok(is_new) => is_new,
            Err(LinkError::Resource(e)) => return Err(CaptureError::allocation(path, e)),
            Err(LinkError::Link(e)) => return Err(e),
        };
        if is_new {
            self.stats.unique_streams += 1;
        } else {
            self.stats.shared_references += 1;
        }
        if inline {
            self.stats.inline_streams += 1;
        }

        trace!(
            path,
            stream = %String::from_utf16_lossy(&descriptor.name),
            size,
            hash = %hex::encode(hash),
            shared = !is_new,
            "Captured stream"
        );
        Ok(())
    }

    /// Size-then-fetch descriptor query; registers the descriptor and stores
    /// its ID in `dentry`. An object without a descriptor gets no ID.
    fn capture_security(
        &mut self,
        dentry: &mut Dentry,
        object: &dyn VolumeObject,
        path_len: usize,
    ) -> Result<(), CaptureError> {
        let path = self.path.prefix(path_len);
        let query_error = |detail: String| CaptureError::SecurityQuery {
            path: path.to_string(),
            detail,
        };

        let required = object
            .security_descriptor(SecurityInformation::ALL, &mut [])
            .map_err(|e| query_error(e.to_string()))?;
        if required == 0 {
            dentry.security_id = None;
            return Ok(());
        }

        let mut descriptor = Vec::new();
        descriptor
            .try_reserve_exact(required)
            .map_err(|e| CaptureError::allocation(path, e))?;
        descriptor.resize(required, 0);

        let fetched = object
            .security_descriptor(SecurityInformation::ALL, &mut descriptor)
            .map_err(|e| query_error(e.to_string()))?;
        if fetched != required {
            return Err(query_error(format!(
                "descriptor length changed from {} to {} bytes between queries",
                required, fetched
            )));
        }

        let id = self
            .index
            .add(self.security, &descriptor)
            .map_err(|e| CaptureError::allocation(path, e))?;
        dentry.security_id = Some(id);
        Ok(())
    }
}
