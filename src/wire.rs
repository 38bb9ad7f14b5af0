//! Length-prefixed framing shared by the networked-KV backend client and
//! the replication layer: each message is a 4-byte big-endian payload
//! length followed by a `bincode`-encoded body, kept consistent with
//! the rest of the crate's on-disk/on-wire encoding.

use std::io::{Read, Write};

use crate::error::{StoreError, StoreResult};

/// Maximum frame payload accepted, guarding against a malformed length
/// prefix causing an unbounded allocation.
pub const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> StoreResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::BackendIO("frame payload too large".into()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame<R: Read>(reader: &mut R) -> StoreResult<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(StoreError::Corruption(format!(
            "frame length {len} exceeds maximum {MAX_FRAME_BYTES}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn encode<T: bincode::Encode>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> StoreResult<T> {
    Ok(bincode::decode_from_slice(bytes, bincode::config::standard())?.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello world").unwrap();
        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor).unwrap();
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }
}
