//! Volume tree capture
//!
//! Walks a volume from its root into a tree of manifest nodes, feeding every
//! stream through the hasher into the stream store and every security
//! descriptor into the security index.

pub mod builder;
pub mod hasher;
pub mod node;
pub mod path;
pub mod walker;

pub use builder::{capture, CapturedImage, ImageCapture};
pub use node::{Dentry, NamedStream};
pub use walker::{CaptureStats, TreeWalker};
