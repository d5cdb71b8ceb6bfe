//! Cache key derivation for proxied requests
//!
//! The key is `request.{sha256}` where the digest covers the method, URL,
//! normalized headers and body. Every field is length-prefixed so that moving
//! bytes between adjacent fields always changes the digest.

use sha2::{Digest, Sha256};

use crate::request::ProxyRequest;

/// Namespace prepended to every request key in the backing store
pub const KEY_PREFIX: &str = "request.";

/// Derive the store key for `request`.
///
/// Header names are lowercased and headers are sorted by name (stable, so
/// repeated headers keep their relative order). The method is uppercased.
#[must_use]
pub fn derive_key(request: &ProxyRequest) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, request.method.to_ascii_uppercase().as_bytes());
    update_field(&mut hasher, request.url.as_bytes());

    let mut headers: Vec<(String, &str)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    hasher.update((headers.len() as u64).to_be_bytes());
    for (name, value) in &headers {
        update_field(&mut hasher, name.as_bytes());
        update_field(&mut hasher, value.as_bytes());
    }
    update_field(&mut hasher, &request.body);

    format!("{KEY_PREFIX}{}", hex::encode(hasher.finalize()))
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
