//! Core identifier types shared across the capture engine.

/// 32-byte BLAKE3 digest used as the content identity of streams and
/// security descriptors.
pub type Hash = [u8; 32];

/// Dense index into the security descriptor table.
pub type SecurityId = u32;

/// Opaque reference handed out by directory enumeration and resolvable by the
/// volume that issued it.
pub type ObjectRef = u64;
