//! Content hashing for AnchorSync.
//!
//! Digests are computed incrementally over bounded chunks so that large
//! blobs never have to be held in memory at once.

pub mod digest;

pub use digest::{ContentHasher, DigestWriter, DEFAULT_CHUNK_SIZE};
