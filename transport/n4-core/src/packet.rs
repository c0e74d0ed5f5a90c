//! The wire packet carried inside every obfuscated UDP datagram belonging to
//! an end-to-end multipath session.

use n4_wire::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::session_addr::SessionAddr;

/// A single datagram's worth of payload, tagged with the session it belongs
/// to and a per-session sequence number used purely for duplicate-path
/// telemetry (RTT sampling), not for ordering — ordering and reliability are
/// handled by the ARQ layer riding on top of this session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct E2ePacket {
    pub session: SessionAddr,
    pub sn: u64,
    pub ack: u64,
    pub body: Vec<u8>,
    /// Random padding appended by the sender to defeat size-based traffic
    /// analysis. Carried on the wire but otherwise ignored by the receiver.
    pub padding: Vec<u8>,
}

impl Encodable for E2ePacket {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.session);
        s.append(&self.sn);
        s.append(&self.ack);
        s.append(&self.body);
        s.append(&self.padding);
    }
}

impl Decodable for E2ePacket {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            session: rlp.val_at(0)?,
            sn: rlp.val_at(1)?,
            ack: rlp.val_at(2)?,
            body: rlp.val_at(3)?,
            padding: rlp.val_at(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn roundtrips_through_wire_encoding() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let pkt = E2ePacket {
            session: SessionAddr::random(&mut rng),
            sn: 42,
            ack: 41,
            body: vec![1, 2, 3, 4],
            padding: vec![0; 16],
        };
        let bytes = n4_wire::encode(&pkt);
        let decoded: E2ePacket = n4_wire::decode(&bytes).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn rejects_wrong_arity() {
        let mut s = RlpStream::new_list(3);
        s.append(&1u64).append(&2u64).append(&3u64);
        let bytes = s.out();
        let result: Result<E2ePacket, _> = n4_wire::decode(&bytes);
        assert!(result.is_err());
    }
}
