//! Stream Store
//!
//! Content-addressed table of every stream captured from a volume. Records are
//! keyed by digest and shared between manifest slots by reference count, so
//! each distinct byte sequence is stored once no matter how many files,
//! named streams or reparse points carry it.
//!
//! Equal digests are taken as proof of equal content; the store never
//! compares bytes.

use crate::error::ResourceError;
use crate::tree::hasher::{self, HASH_CHUNK_SIZE};
use crate::types::Hash;
use crate::volume::{SharedVolume, StreamKind};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

/// Where a stream's bytes can be obtained when the archive is written
#[derive(Debug, Clone)]
pub enum StreamLocation {
    /// Still on the volume; read back through the shared volume handle
    Volume(VolumeLocation),
    /// Already materialized in memory
    Buffer(Arc<[u8]>),
}

/// Deferred read of one stream of one object on an open volume
#[derive(Debug, Clone)]
pub struct VolumeLocation {
    pub volume: SharedVolume,
    /// Object path inside the volume
    pub path: String,
    pub kind: StreamKind,
    /// UTF-16 stream name; empty for the unnamed stream
    pub name: Vec<u16>,
}

/// One deduplicated stream
#[derive(Debug, Clone)]
pub struct StreamRecord {
    hash: Hash,
    size: u64,
    refcount: u32,
    location: StreamLocation,
}

impl StreamRecord {
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Declared size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of manifest slots referencing this record
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn location(&self) -> &StreamLocation {
        &self.location
    }

    /// Write the stream's bytes to `out`, verifying size and digest.
    ///
    /// Deferred records are read back from the volume, so the volume must
    /// still hold the content that was hashed at capture time.
    pub fn copy_to(&self, out: &mut dyn Write) -> io::Result<u64> {
        match &self.location {
            StreamLocation::Buffer(data) => {
                out.write_all(data)?;
                Ok(data.len() as u64)
            }
            StreamLocation::Volume(location) => {
                let mut reader =
                    location
                        .volume
                        .open_stream_at(&location.path, location.kind, &location.name)?;
                let mut verifier = blake3::Hasher::new();
                let mut buf = [0u8; HASH_CHUNK_SIZE];
                let mut offset = 0u64;
                while offset < self.size {
                    let to_read = (self.size - offset).min(HASH_CHUNK_SIZE as u64) as usize;
                    let read = reader.read_at(offset, &mut buf[..to_read])?;
                    if read != to_read {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "{} ended at {} of {} bytes",
                                location.path,
                                offset + read as u64,
                                self.size
                            ),
                        ));
                    }
                    verifier.update(&buf[..read]);
                    out.write_all(&buf[..read])?;
                    offset += read as u64;
                }
                if *verifier.finalize().as_bytes() != self.hash {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{} changed since it was captured", location.path),
                    ));
                }
                Ok(offset)
            }
        }
    }
}

/// Failure of [`StreamStore::share_and_link`]
#[derive(Debug)]
pub enum LinkError<E> {
    /// The store could not grow
    Resource(ResourceError),
    /// The caller's link step failed; the reference was released again
    Link(E),
}

/// Digest-keyed store of stream records
#[derive(Debug, Default)]
pub struct StreamStore {
    records: HashMap<Hash, StreamRecord>,
}

impl StreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference to the record for `hash`, creating it if needed.
    ///
    /// For an existing record the refcount is incremented and `size` and
    /// `location` are ignored. Returns the record and whether it was created.
    pub fn insert_or_share(
        &mut self,
        hash: Hash,
        size: u64,
        location: StreamLocation,
    ) -> Result<(&StreamRecord, bool), ResourceError> {
        self.records.try_reserve(1)?;
        match self.records.entry(hash) {
            Entry::Occupied(entry) => {
                let record = entry.into_mut();
                debug_assert_eq!(
                    record.size,
                    size,
                    "equal digests with different sizes for {}",
                    hex::encode(hash)
                );
                record.refcount += 1;
                Ok((record, false))
            }
            Entry::Vacant(entry) => {
                let record = entry.insert(StreamRecord {
                    hash,
                    size,
                    refcount: 1,
                    location,
                });
                Ok((record, true))
            }
        }
    }

    /// Reference a stream and link it into a manifest slot as one step.
    ///
    /// `link` receives the digest once the reference is taken. If it fails,
    /// the reference is released again, so refcounts never count slots that
    /// were not linked.
    pub fn share_and_link<E>(
        &mut self,
        hash: Hash,
        size: u64,
        location: StreamLocation,
        link: impl FnOnce(Hash) -> Result<(), E>,
    ) -> Result<bool, LinkError<E>> {
        let (_, is_new) = self
            .insert_or_share(hash, size, location)
            .map_err(LinkError::Resource)?;
        if let Err(e) = link(hash) {
            self.release(&hash);
            return Err(LinkError::Link(e));
        }
        Ok(is_new)
    }

    /// Hash an in-memory buffer and take a reference to its record.
    pub fn insert_buffer(&mut self, data: impl Into<Arc<[u8]>>) -> Result<Hash, ResourceError> {
        let data = data.into();
        let hash = hasher::compute_hash(&data);
        let size = data.len() as u64;
        self.insert_or_share(hash, size, StreamLocation::Buffer(data))?;
        Ok(hash)
    }

    /// Drop one reference. Returns `true` if the record was removed.
    pub fn release(&mut self, hash: &Hash) -> bool {
        let Some(record) = self.records.get_mut(hash) else {
            return false;
        };
        record.refcount -= 1;
        if record.refcount == 0 {
            self.records.remove(hash);
            return true;
        }
        false
    }

    pub fn get(&self, hash: &Hash) -> Option<&StreamRecord> {
        self.records.get(hash)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamRecord> {
        self.records.values()
    }

    /// Sum of all refcounts, i.e. the number of linked manifest slots
    pub fn total_refcount(&self) -> u64 {
        self.records.values().map(|r| u64::from(r.refcount)).sum()
    }

    /// Sum of the sizes of all distinct streams
    pub fn unique_bytes(&self) -> u64 {
        self.records.values().map(|r| r.size).sum()
    }
}
