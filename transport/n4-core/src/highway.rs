//! HighwayHash-128 digests, used purely for duplicate-packet detection
//! across paths — not a security boundary, just a fast, well-distributed
//! fingerprint.

use highway::{HighwayHash, HighwayHasher, Key};

/// The zero key, matching the reference implementation's
/// `highwayhash.Sum128(body, 32-zero-byte key)`. The dedup window is
/// session-local and short-lived, so a static key is fine: we only need
/// collision resistance against accidental collisions, not against an
/// adversary choosing packets to collide.
const DEDUP_KEY: Key = Key([0u64; 4]);

pub type Digest = u128;

/// Computes the 128-bit HighwayHash digest of `data`.
pub fn digest128(data: &[u8]) -> Digest {
    let mut hasher = HighwayHasher::new(DEDUP_KEY);
    hasher.append(data);
    let [lo, hi] = hasher.finalize128();
    ((hi as u128) << 64) | lo as u128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_digest() {
        assert_eq!(digest128(b"hello"), digest128(b"hello"));
    }

    #[test]
    fn different_input_different_digest() {
        assert_ne!(digest128(b"hello"), digest128(b"world"));
    }
}
