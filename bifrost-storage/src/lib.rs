pub mod blob;
pub mod cache;
pub mod text_index;

pub use blob::{BlobStore, BlobStoreError, InMemoryBlobStore, S3BlobStore};
pub use cache::{InMemoryModuleCache, ModuleCache};
pub use text_index::{InMemoryTextIndex, SqlTextIndex, TextIndex, TextIndexError};

#[cfg(test)]
test_r::enable!();

/// SHA-256 content hash, hex-encoded, as used uniformly by C1/C2/C3.
pub fn content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
