//! Resource-name hash functions.
//!
//! The hash function is part of the wire contract: two processes configured
//! with the same algorithm and ring size must map every resource name to the
//! same ring position, so both algorithms are pinned here with fixed test
//! vectors rather than delegated to `std::hash`.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Selectable hash algorithm for ring placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// 32-bit FNV-1a.
    Fnv1a32,
    /// Low-order 32 bits of the MD5 digest.
    Md5Low32,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        Self::Fnv1a32
    }
}

impl HashAlgorithm {
    /// Hash a resource name to a 32-bit value. The caller reduces this
    /// modulo the ring size.
    pub fn hash(&self, resource: &str) -> u32 {
        match self {
            Self::Fnv1a32 => fnv1a32(resource.as_bytes()),
            Self::Md5Low32 => md5_low32(resource.as_bytes()),
        }
    }
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 16_777_619;

fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// The digest is read as a 128-bit big-endian number; the low 32 bits are
/// its last four bytes.
fn md5_low32(bytes: &[u8]) -> u32 {
    let digest = Md5::digest(bytes);
    u32::from_be_bytes([digest[12], digest[13], digest[14], digest[15]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a32_reference_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn md5_low32_reference_vectors() {
        // MD5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(md5_low32(b""), 0xecf8_427e);
        // MD5("abc") = 900150983cd24fb0d6963f7d28e17f72
        assert_eq!(md5_low32(b"abc"), 0x28e1_7f72);
    }

    #[test]
    fn algorithms_disagree_on_typical_input() {
        let fnv = HashAlgorithm::Fnv1a32.hash("resource-42");
        let md5 = HashAlgorithm::Md5Low32.hash("resource-42");
        assert_ne!(fnv, md5);
    }

    #[test]
    fn serde_names_are_stable() {
        let fnv: HashAlgorithm = serde_json::from_str("\"fnv1a32\"").unwrap();
        let md5: HashAlgorithm = serde_json::from_str("\"md5_low32\"").unwrap();
        assert_eq!(fnv, HashAlgorithm::Fnv1a32);
        assert_eq!(md5, HashAlgorithm::Md5Low32);
    }
}
