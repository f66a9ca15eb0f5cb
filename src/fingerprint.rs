//! Content fingerprints.
//!
//! A fingerprint is the hex SHA-256 of the concatenated SHA-256 digests of
//! each 4 MiB block of content. Hashing block-by-block lets the fetch path
//! fingerprint a download incrementally while streaming it to disk, and lets
//! verification re-hash multi-gigabyte files without buffering them.

use std::fmt::Write as _;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Block length the provider hashes over.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Incremental block hasher. Feed arbitrary chunk sizes; block boundaries
/// are handled internally.
pub struct BlockHasher {
    block: Sha256,
    block_len: usize,
    digests: Sha256,
}

impl BlockHasher {
    pub fn new() -> Self {
        Self {
            block: Sha256::new(),
            block_len: 0,
            digests: Sha256::new(),
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (BLOCK_SIZE - self.block_len).min(data.len());
            self.block.update(&data[..take]);
            self.block_len += take;
            data = &data[take..];

            if self.block_len == BLOCK_SIZE {
                let digest = std::mem::replace(&mut self.block, Sha256::new()).finalize();
                self.digests.update(digest);
                self.block_len = 0;
            }
        }
    }

    /// Finish and return the hex fingerprint.
    pub fn finalize(mut self) -> String {
        if self.block_len > 0 {
            let digest = self.block.finalize();
            self.digests.update(digest);
        }
        to_hex(&self.digests.finalize())
    }
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Fingerprint an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut hasher = BlockHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Fingerprint a file on disk. Blocking; callers on the async runtime wrap
/// this in `spawn_blocking`.
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = BlockHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

fn to_hex(digest: &[u8]) -> String {
    digest.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}
