//! Payload hashing and generation.
//!
//! The wire protocol is fixed-size in both directions:
//! - Client sends exactly `PAYLOAD_SIZE` bytes of random data
//! - Server answers with the SHA-1 of that data, hex-encoded as ASCII

use rand::RngCore;
use sha1::{Digest, Sha1};

/// Size of one client payload in bytes.
pub const PAYLOAD_SIZE: usize = 8 * 1024;

/// Size of one hash response: 160-bit digest as lowercase hex.
pub const HASH_RESPONSE_LEN: usize = 40;

/// Function used to hash payloads. Injectable so tests can corrupt responses.
pub type HashFn = fn(&[u8]) -> String;

/// SHA-1 of `data` as a 40 character lowercase hex string.
///
/// Leading zero nibbles are kept so every response has the same length.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Generate `size` bytes of random payload.
pub fn generate_payload(size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_sha1_keeps_leading_zeros() {
        // Every digest encodes to the full width, whatever its value.
        for i in 0..256u32 {
            let hash = sha1_hex(&i.to_le_bytes());
            assert_eq!(hash.len(), HASH_RESPONSE_LEN);
        }
    }

    #[test]
    fn test_generate_payload() {
        let a = generate_payload(PAYLOAD_SIZE);
        let b = generate_payload(PAYLOAD_SIZE);
        assert_eq!(a.len(), PAYLOAD_SIZE);
        assert_ne!(a, b);
        assert!(generate_payload(0).is_empty());
    }
}
