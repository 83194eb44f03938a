//! Message framing codec.
//!
//! Every message travels in a Bitcoin wire frame:
//!
//! ```text
//! +----------+-----------+----------+----------+
//! |  Magic   |  Command  |  Length  | Checksum |
//! | 4 bytes  | 12 bytes  | 4 bytes  | 4 bytes  |
//! +----------+-----------+----------+----------+
//! |                 Payload                    |
//! |              (Length bytes)                |
//! +--------------------------------------------+
//! ```
//!
//! - Magic: network identifier
//! - Command: NUL-padded ASCII message name
//! - Length: payload length in bytes (little-endian)
//! - Checksum: first 4 bytes of SHA256(SHA256(payload))

use crate::{Message, NetworkError, NetworkResult, MAINNET_MAGIC, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use tokio_util::codec::{Decoder, Encoder};

/// Header size: magic (4) + command (12) + length (4) + checksum (4).
const HEADER_SIZE: usize = 24;

/// Codec for Bitcoin P2P frames.
pub struct MessageCodec {
    /// Network magic bytes.
    magic: [u8; 4],
    /// Maximum allowed payload size.
    max_size: usize,
}

impl MessageCodec {
    /// Create a new codec with mainnet magic.
    pub fn new() -> Self {
        Self {
            magic: MAINNET_MAGIC,
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with custom magic bytes.
    pub fn with_magic(magic: [u8; 4]) -> Self {
        Self {
            magic,
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Double-SHA256 checksum over the payload, truncated to 4 bytes.
    fn checksum(payload: &[u8]) -> [u8; 4] {
        let hash = Sha256::digest(Sha256::digest(payload));
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash[0..4]);
        checksum
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_command(name: &str) -> NetworkResult<[u8; 12]> {
    let bytes = name.as_bytes();
    if bytes.len() > 12 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
        return Err(NetworkError::InvalidMessage(format!(
            "Bad command name: {:?}",
            name
        )));
    }
    let mut command = [0u8; 12];
    command[..bytes.len()].copy_from_slice(bytes);
    Ok(command)
}

fn decode_command(raw: &[u8]) -> NetworkResult<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    // Everything after the first NUL must be NUL padding.
    if raw[end..].iter().any(|&b| b != 0) {
        return Err(NetworkError::InvalidMessage(format!(
            "Bad command padding: {}",
            hex::encode(raw)
        )));
    }
    let name = &raw[..end];
    if !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(NetworkError::InvalidMessage(format!(
            "Non-ASCII command: {}",
            hex::encode(raw)
        )));
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming.
        if src[0..4] != self.magic {
            return Err(NetworkError::MagicMismatch);
        }

        let command = decode_command(&src[4..16])?;
        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        let checksum: [u8; 4] = [src[20], src[21], src[22], src[23]];

        if length > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total_size = HEADER_SIZE + length;
        if src.len() < total_size {
            src.reserve(total_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        if Self::checksum(&payload) != checksum {
            return Err(NetworkError::ChecksumMismatch);
        }

        Message::decode(&command, payload).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = encode_command(item.command())?;
        let payload = item.encode_payload();

        if payload.len() > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&Self::checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }
}
