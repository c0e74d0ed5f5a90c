//! Reading and writing single RLP items on an async byte stream.
//!
//! RLP items are self-delimiting: the first one to nine bytes of any
//! encoding tell you exactly how many more bytes the item occupies. That
//! lets us frame a stream of commands/packets without an extra length
//! envelope — we just have to parse that header by hand before we know how
//! much to read.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{decode, encode, Decodable, Encodable};

/// Encodes `value` and writes it to `w`.
pub async fn write_value<W, T>(w: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Encodable,
{
    let bytes = encode(value);
    w.write_all(&bytes).await
}

/// Reads a single self-delimiting RLP item from `r` and decodes it.
///
/// Returns `UnexpectedEof` if the stream closes mid-item.
pub async fn read_value<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: Decodable,
{
    let bytes = read_item(r).await?;
    decode::<T>(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Reads exactly one RLP-encoded item's worth of bytes off `r`, without
/// decoding it.
async fn read_item<R>(r: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let prefix = r.read_u8().await?;
    let mut buf = vec![prefix];

    let payload_len: usize = match prefix {
        0x00..=0x7f => 0,
        0x80..=0xb7 => (prefix - 0x80) as usize,
        0xb8..=0xbf => {
            let len_of_len = (prefix - 0xb7) as usize;
            read_length(r, &mut buf, len_of_len).await?
        }
        0xc0..=0xf7 => (prefix - 0xc0) as usize,
        0xf8..=0xff => {
            let len_of_len = (prefix - 0xf7) as usize;
            read_length(r, &mut buf, len_of_len).await?
        }
    };

    if payload_len > 0 {
        let start = buf.len();
        buf.resize(start + payload_len, 0);
        r.read_exact(&mut buf[start..]).await?;
    }

    Ok(buf)
}

/// Reads `len_of_len` big-endian length bytes, appends them to `buf`, and
/// returns the decoded payload length.
async fn read_length<R>(r: &mut R, buf: &mut Vec<u8>, len_of_len: usize) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 8];
    if len_of_len > len_bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "rlp length-of-length too large",
        ));
    }
    r.read_exact(&mut len_bytes[8 - len_of_len..]).await?;
    buf.extend_from_slice(&len_bytes[8 - len_of_len..]);
    Ok(u64::from_be_bytes(len_bytes) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn roundtrips_a_command_list() {
        let cmds = vec!["proxy".to_string(), "example.com:443".to_string()];
        let mut buf = Vec::new();
        write_value(&mut buf, &cmds).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: Vec<String> = read_value(&mut cursor).await.unwrap();
        assert_eq!(decoded, cmds);
    }

    #[tokio::test]
    async fn roundtrips_a_large_byte_string() {
        let body = vec![0xabu8; 5000];
        let mut buf = Vec::new();
        write_value(&mut buf, &body).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: Vec<u8> = read_value(&mut cursor).await.unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn two_values_back_to_back() {
        let mut buf = Vec::new();
        write_value(&mut buf, &"ping".to_string()).await.unwrap();
        write_value(&mut buf, &42u64).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let a: String = read_value(&mut cursor).await.unwrap();
        let b: u64 = read_value(&mut cursor).await.unwrap();
        assert_eq!(a, "ping");
        assert_eq!(b, 42);
    }
}
