//! Content digests used as version markers

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest
pub const DIGEST_LEN: usize = 16;

/// SHA-256 of `content`, truncated to [`DIGEST_LEN`] lowercase hex characters
pub fn content_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    hex::encode(&result[..DIGEST_LEN / 2])
}
