//! Manifest nodes

use crate::tree::path::{self, PathBuffer};
use crate::types::{Hash, SecurityId};
use crate::volume::{attributes, ObjectMetadata};
use std::collections::TryReserveError;

/// Named (alternate) data stream attached to a manifest node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStream {
    pub name: String,
    pub stream: Hash,
}

/// One captured filesystem object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dentry {
    pub name: String,
    pub creation_time: u64,
    pub last_write_time: u64,
    pub last_access_time: u64,
    pub attributes: u32,
    /// Hard-link identity of the underlying object
    pub hard_link: u64,
    pub security_id: Option<SecurityId>,
    /// Primary (unnamed data or reparse-point) stream
    pub stream: Option<Hash>,
    pub named_streams: Vec<NamedStream>,
    /// Children in enumeration order; always empty for non-directories
    pub children: Vec<Dentry>,
}

impl Dentry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Nameless node for the root of an image
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & attributes::DIRECTORY != 0 && !self.is_reparse_point()
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes & attributes::REPARSE_POINT != 0
    }

    pub fn apply_metadata(&mut self, metadata: &ObjectMetadata) {
        self.creation_time = metadata.creation_time;
        self.last_write_time = metadata.last_write_time;
        self.last_access_time = metadata.last_access_time;
        self.attributes = metadata.attributes;
        self.hard_link = metadata.identity;
        self.security_id = metadata.security_id;
    }

    pub fn link_child(&mut self, child: Dentry) -> Result<(), TryReserveError> {
        self.children.try_reserve(1)?;
        self.children.push(child);
        Ok(())
    }

    pub fn add_named_stream(&mut self, name: String, stream: Hash) -> Result<(), TryReserveError> {
        self.named_streams.try_reserve(1)?;
        self.named_streams.push(NamedStream { name, stream });
        Ok(())
    }

    pub fn child(&self, name: &str) -> Option<&Dentry> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Look up a descendant by `/`-separated path relative to this node
    pub fn find(&self, path: &str) -> Option<&Dentry> {
        path::segments(path).try_fold(self, |node, segment| node.child(segment))
    }

    /// Stream references held by this node alone
    pub fn stream_refs(&self) -> impl Iterator<Item = &Hash> {
        self.stream
            .iter()
            .chain(self.named_streams.iter().map(|named| &named.stream))
    }

    /// Visit this node and every descendant depth-first, parents first, with
    /// each node's path. The node this is called on gets `/`.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&str, &'a Dentry)) {
        let mut path = PathBuffer::new();
        self.walk_inner(&mut path, PathBuffer::ROOT_LEN, visit);
    }

    fn walk_inner<'a>(
        &'a self,
        path: &mut PathBuffer,
        len: usize,
        visit: &mut dyn FnMut(&str, &'a Dentry),
    ) {
        path.truncate(len);
        visit(path.as_str(), self);
        for child in &self.children {
            let child_len = path.push_segment(len, &child.name);
            child.walk_inner(path, child_len, visit);
        }
    }

    /// Number of nodes in this subtree, including this one
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Dentry::node_count).sum::<usize>()
    }
}
