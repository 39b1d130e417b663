use sha2::{Digest, Sha256};

/// Stable identifier for an item whose source did not provide one.
///
/// Derived from the item URL so the same document maps to the same id across
/// runs, which is what keeps the dedup ledger effective.
#[must_use]
pub(crate) fn stable_item_id(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    digest[..16].to_string()
}

/// Hex SHA-256 of a raw payload, as bound into relay signatures.
#[must_use]
pub(crate) fn body_digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}
