//! Security descriptor deduplication
//!
//! [`SecurityData`] is the append-only descriptor table the archive manifest
//! serializes; manifest nodes refer to entries by their [`SecurityId`].
//! [`SecurityIndex`] maps descriptor digests to IDs so that byte-identical
//! descriptors share one table entry. The index is only needed while a
//! capture runs and is dropped with it.

use crate::error::ResourceError;
use crate::tree::hasher;
use crate::types::{Hash, SecurityId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Size of the per-entry length field in the serialized table
const ENTRY_SIZE_FIELD: u64 = 8;

/// Append-only table of unique security descriptors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityData {
    descriptors: Vec<Vec<u8>>,
    total_length: u64,
}

impl SecurityData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn get(&self, id: SecurityId) -> Option<&[u8]> {
        self.descriptors.get(id as usize).map(Vec::as_slice)
    }

    /// Entries in ID order
    pub fn iter(&self) -> impl Iterator<Item = (SecurityId, &[u8])> {
        self.descriptors
            .iter()
            .enumerate()
            .map(|(id, descriptor)| (id as SecurityId, descriptor.as_slice()))
    }

    /// Bytes the table occupies once serialized: every descriptor plus one
    /// length field per entry.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    fn push(&mut self, descriptor: &[u8]) -> Result<SecurityId, ResourceError> {
        let id = SecurityId::try_from(self.descriptors.len())
            .map_err(|_| ResourceError::SecurityIds(self.descriptors.len()))?;
        let mut copy = Vec::new();
        copy.try_reserve_exact(descriptor.len())?;
        copy.extend_from_slice(descriptor);
        self.descriptors.try_reserve(1)?;
        self.descriptors.push(copy);
        self.total_length += descriptor.len() as u64 + ENTRY_SIZE_FIELD;
        Ok(id)
    }
}

/// Digest index over a [`SecurityData`] table
#[derive(Debug, Default)]
pub struct SecurityIndex {
    ids: HashMap<Hash, SecurityId>,
}

impl SecurityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every entry already present in `table`, so that adding one of
    /// them again returns its existing ID.
    pub fn from_table(table: &SecurityData) -> Self {
        let mut ids = HashMap::with_capacity(table.len());
        for (id, descriptor) in table.iter() {
            ids.entry(hasher::compute_hash(descriptor)).or_insert(id);
        }
        Self { ids }
    }

    /// Return the ID of `descriptor`, appending it to `table` if no
    /// byte-identical descriptor was added before.
    pub fn add(
        &mut self,
        table: &mut SecurityData,
        descriptor: &[u8],
    ) -> Result<SecurityId, ResourceError> {
        let hash = hasher::compute_hash(descriptor);
        if let Some(&id) = self.ids.get(&hash) {
            return Ok(id);
        }

        self.ids.try_reserve(1)?;
        let id = table.push(descriptor)?;
        self.insert(hash, id);
        Ok(id)
    }

    fn insert(&mut self, hash: Hash, id: SecurityId) {
        match self.ids.entry(hash) {
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
            Entry::Occupied(_) => {
                panic!("security descriptor {} indexed twice", hex::encode(hash))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
