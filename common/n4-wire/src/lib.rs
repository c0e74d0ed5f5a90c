//! Self-describing, length-prefixed structural encoding for control messages.
//!
//! Every value that crosses the wire in niaucchi4 — the `E2ePacket` header,
//! command argument lists, handshake frames — is encoded with the same
//! recursive scheme: integers are big-endian and variable-length, byte
//! strings are length-prefixed, and lists are length-prefixed lists of
//! encodings. This is exactly RLP (as used by the reference implementation's
//! `go-ethereum/rlp` package), so we build directly on the `rlp` crate rather
//! than inventing a parallel format.

pub use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

mod stream;

pub use stream::{read_value, write_value};

/// Encodes a single value using the structural encoding.
pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    rlp::encode(value).to_vec()
}

/// Decodes a single value, requiring the entire input to be consumed.
pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecoderError> {
    rlp::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_primitives() {
        assert_eq!(decode::<u64>(&encode(&1234u64)).unwrap(), 1234u64);
        assert_eq!(
            decode::<Vec<u8>>(&encode(&vec![1u8, 2, 3])).unwrap(),
            vec![1u8, 2, 3]
        );
        let strings = vec!["proxy".to_string(), "1.2.3.4:443".to_string()];
        assert_eq!(decode::<Vec<String>>(&encode(&strings)).unwrap(), strings);
    }
}
