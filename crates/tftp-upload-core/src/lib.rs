//! Wire-level pieces of the upload receiver: packet codec, request decoding,
//! option negotiation and the error taxonomy. Nothing in here touches a
//! socket or a file.

pub mod error;
pub mod options;
pub mod packet;
pub mod request;

pub use error::{ERRNO_OFFSET, ErrorCode, ErrorCondition};
pub use options::{DEFAULT_TIMEOUT, NegotiatedOptions, Negotiation, OptionNegotiator};
pub use packet::{
    DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MAX_PACKET_SIZE, MIN_BLOCK_SIZE, Opcode, Packet,
    PacketError, SEGMENT_PACKET_SIZE, TFTP_HEADER_LEN, encode_ack, encode_data, encode_error,
    encode_oack, encode_request,
};
pub use request::{Request, RequestKind, TransferMode};
