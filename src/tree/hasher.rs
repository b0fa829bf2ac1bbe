//! Streaming content hashing using BLAKE3

use crate::types::Hash;
use crate::volume::StreamReader;
use blake3::Hasher;
use std::io;

/// Bytes requested from a stream per read
pub const HASH_CHUNK_SIZE: usize = 4096;

/// Hash a stream in one pass over bounded chunks.
///
/// Reads exactly `reader.size()` bytes. A read that returns fewer bytes than
/// requested aborts with `UnexpectedEof`; no partial digest is produced.
pub fn hash_stream(reader: &mut dyn StreamReader) -> io::Result<Hash> {
    hash_chunks(reader, |_| {})
}

/// Like [`hash_stream`], also appending every byte read to `out`.
pub fn hash_stream_into(reader: &mut dyn StreamReader, out: &mut Vec<u8>) -> io::Result<Hash> {
    hash_chunks(reader, |chunk| out.extend_from_slice(chunk))
}

fn hash_chunks(reader: &mut dyn StreamReader, mut sink: impl FnMut(&[u8])) -> io::Result<Hash> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    let mut offset = 0u64;
    let mut remaining = reader.size();

    while remaining > 0 {
        let to_read = remaining.min(HASH_CHUNK_SIZE as u64) as usize;
        let read = reader.read_at(offset, &mut buf[..to_read])?;
        if read != to_read {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "short read at offset {}: got {} of {} bytes",
                    offset, read, to_read
                ),
            ));
        }
        hasher.update(&buf[..read]);
        sink(&buf[..read]);
        offset += read as u64;
        remaining -= read as u64;
    }

    Ok(*hasher.finalize().as_bytes())
}

/// Compute a hash of an in-memory buffer
pub fn compute_hash(data: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(data);
    *hasher.finalize().as_bytes()
}
