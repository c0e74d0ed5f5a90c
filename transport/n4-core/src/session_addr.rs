//! The 16-byte opaque identifier that names an end-to-end multipath session.
//!
//! A `SessionAddr` is chosen once by the dialing side and carried in every
//! `E2ePacket` sent over every path belonging to that session. It lets the
//! listening side demultiplex datagrams arriving on several different UDP
//! sockets (one per path) back into a single logical session.

use std::fmt;

use n4_wire::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use rand::RngCore;

/// Opaque 16-byte session identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionAddr([u8; 16]);

impl SessionAddr {
    /// Draws a fresh, randomly generated session address.
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut buf = [0u8; 16];
        rng.fill_bytes(&mut buf);
        Self(buf)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for SessionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for SessionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Encodable for SessionAddr {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl Decodable for SessionAddr {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let bytes: Vec<u8> = rlp.as_val()?;
        if bytes.len() != 16 {
            return Err(DecoderError::RlpInvalidLength);
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(&bytes);
        Ok(Self(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn roundtrips_through_wire_encoding() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let addr = SessionAddr::random(&mut rng);
        let bytes = n4_wire::encode(&addr);
        let decoded: SessionAddr = n4_wire::decode(&bytes).unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn two_draws_differ() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let a = SessionAddr::random(&mut rng);
        let b = SessionAddr::random(&mut rng);
        assert_ne!(a, b);
    }
}
