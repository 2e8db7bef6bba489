use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::ErrorCondition;

/// Opcode and block number.
pub const TFTP_HEADER_LEN: usize = 4;
pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard block size
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348 minimum block size
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum block size
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + TFTP_HEADER_LEN;
/// Classic RFC 1350 packet size; ERROR messages are truncated to fit it.
pub const SEGMENT_PACKET_SIZE: usize = DEFAULT_BLOCK_SIZE + TFTP_HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = PacketError;

    fn try_from(value: u16) -> Result<Self, PacketError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(PacketError::UnknownOpcode(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("invalid opcode: {0}")]
    UnknownOpcode(u16),
}

/// A datagram seen after the transfer is under way.
///
/// Requests and OACKs are only classified; their bodies are not interesting
/// to a receiver mid-transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Request(Opcode),
    Data { block: u16, payload: &'a [u8] },
    Ack { block: u16 },
    Error { code: u16, message: String },
    Oack,
}

impl<'a> Packet<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, PacketError> {
        let opcode = Opcode::try_from(read_u16(buf, 0).ok_or(PacketError::TooShort(buf.len()))?)?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => Ok(Packet::Request(opcode)),
            Opcode::Oack => Ok(Packet::Oack),
            Opcode::Data => {
                let block = read_u16(buf, 2).ok_or(PacketError::TooShort(buf.len()))?;
                Ok(Packet::Data {
                    block,
                    payload: &buf[TFTP_HEADER_LEN..],
                })
            }
            Opcode::Ack => {
                let block = read_u16(buf, 2).ok_or(PacketError::TooShort(buf.len()))?;
                Ok(Packet::Ack { block })
            }
            Opcode::Error => {
                let code = read_u16(buf, 2).ok_or(PacketError::TooShort(buf.len()))?;
                let text = &buf[TFTP_HEADER_LEN..];
                let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
                Ok(Packet::Error {
                    code,
                    message: String::from_utf8_lossy(&text[..end]).into_owned(),
                })
            }
        }
    }
}

pub(crate) fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn encode_ack(block: u16) -> Bytes {
    let mut packet = BytesMut::with_capacity(TFTP_HEADER_LEN);
    packet.put_u16(Opcode::Ack as u16);
    packet.put_u16(block);
    packet.freeze()
}

pub fn encode_data(block: u16, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(TFTP_HEADER_LEN + payload.len());
    packet.put_u16(Opcode::Data as u16);
    packet.put_u16(block);
    packet.put_slice(payload);
    packet.freeze()
}

// RFC 2347: opcode followed by name\0value\0 pairs
pub fn encode_oack(options: &[(String, String)]) -> Bytes {
    let mut packet = BytesMut::new();
    packet.put_u16(Opcode::Oack as u16);

    for (name, value) in options {
        packet.put_slice(name.as_bytes());
        packet.put_u8(0);
        packet.put_slice(value.as_bytes());
        packet.put_u8(0);
    }

    packet.freeze()
}

pub fn encode_request(
    opcode: Opcode,
    filename: &str,
    mode: &str,
    options: &[(&str, &str)],
) -> Bytes {
    let mut packet = BytesMut::new();
    packet.put_u16(opcode as u16);
    packet.put_slice(filename.as_bytes());
    packet.put_u8(0);
    packet.put_slice(mode.as_bytes());
    packet.put_u8(0);

    for (name, value) in options {
        packet.put_slice(name.as_bytes());
        packet.put_u8(0);
        packet.put_slice(value.as_bytes());
        packet.put_u8(0);
    }

    packet.freeze()
}

/// Build an ERROR packet for `condition`.
///
/// The message is cut at a character boundary so the whole packet fits in
/// `SEGMENT_PACKET_SIZE` bytes including the terminating NUL.
pub fn encode_error(condition: &ErrorCondition) -> Bytes {
    let message = condition.message();
    let mut len = message.len().min(SEGMENT_PACKET_SIZE - TFTP_HEADER_LEN - 1);
    while !message.is_char_boundary(len) {
        len -= 1;
    }

    let mut packet = BytesMut::with_capacity(TFTP_HEADER_LEN + len + 1);
    packet.put_u16(Opcode::Error as u16);
    packet.put_u16(condition.wire_code());
    packet.put_slice(&message.as_bytes()[..len]);
    packet.put_u8(0);
    packet.freeze()
}
