//! Hashing and row encoding helpers

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest as _, Sha256};

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash of the `|`-joined parts
pub(crate) fn joined_hex(parts: &[&str]) -> String {
    sha256_hex(parts.join("|").as_bytes())
}

pub(crate) fn encode_row<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub(crate) fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_joined_hex_is_separator_sensitive() {
        assert_ne!(joined_hex(&["ab", "c"]), joined_hex(&["a", "bc"]));
    }
}
