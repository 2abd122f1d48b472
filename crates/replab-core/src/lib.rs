use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};

mod store;

pub use store::{is_temp_name, FsStore, MemStore, Store};

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest of a JSON value with object keys in sorted order.
pub fn canonical_json_digest(value: &Value) -> Result<String> {
    // serde_json::Map is a BTreeMap without `preserve_order`, so serialization is canonical.
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_bytes(&bytes))
}

/// Hashes a sequence of byte chunks with length prefixes so that chunk
/// boundaries are part of the digest.
pub fn sha256_chunks<'a, I>(chunks: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update((chunk.len() as u64).to_le_bytes());
        hasher.update(chunk);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
