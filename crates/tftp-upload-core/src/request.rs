use crate::error::ErrorCode;
use crate::packet::{Opcode, TFTP_HEADER_LEN, read_u16};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Read => "RRQ",
            RequestKind::Write => "WRQ",
        }
    }
}

// RFC 1350 - Transfer modes. Only binary transfers are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Octet,
}

impl TransferMode {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("octet") {
            Some(TransferMode::Octet)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Octet => "octet",
        }
    }
}

/// A decoded RRQ/WRQ.
///
/// RFC 1350: opcode | filename\0 | mode\0, followed by the RFC 2347
/// option/value pairs in the order the client sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub filename: String,
    pub mode: TransferMode,
    pub options: Vec<(String, String)>,
}

impl Request {
    pub fn decode(buf: &[u8]) -> Result<Self, ErrorCode> {
        if buf.len() < TFTP_HEADER_LEN {
            return Err(ErrorCode::IllegalOperation);
        }

        let kind = match read_u16(buf, 0).map(Opcode::try_from) {
            Some(Ok(Opcode::Rrq)) => RequestKind::Read,
            Some(Ok(Opcode::Wrq)) => RequestKind::Write,
            _ => return Err(ErrorCode::UnknownTid),
        };

        let mut rest = &buf[2..];

        let filename = next_field(&mut rest).ok_or(ErrorCode::IllegalOperation)?;
        if filename.is_empty() {
            return Err(ErrorCode::IllegalOperation);
        }
        let filename =
            String::from_utf8(filename.to_vec()).map_err(|_| ErrorCode::IllegalOperation)?;

        let mode = next_field(&mut rest).ok_or(ErrorCode::IllegalOperation)?;
        let mode = std::str::from_utf8(mode)
            .ok()
            .and_then(TransferMode::parse)
            .ok_or(ErrorCode::IllegalOperation)?;

        let mut options = Vec::new();
        while !rest.is_empty() {
            let name = next_field(&mut rest).ok_or(ErrorCode::IllegalOperation)?;
            // An empty name ends the list; only NUL padding may follow.
            if name.is_empty() {
                if rest.iter().any(|&b| b != 0) {
                    return Err(ErrorCode::IllegalOperation);
                }
                break;
            }
            let value = next_field(&mut rest).ok_or(ErrorCode::IllegalOperation)?;
            options.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ));
        }

        Ok(Request {
            kind,
            filename,
            mode,
            options,
        })
    }
}

/// Split off the next NUL-terminated field, or `None` when the terminator is missing.
fn next_field<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    let end = rest.iter().position(|&b| b == 0)?;
    let field = &rest[..end];
    *rest = &rest[end + 1..];
    Some(field)
}
