use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Host errno values are reported as `errno + ERRNO_OFFSET` in logs so they
/// never collide with the RFC 1350 codes.
pub const ERRNO_OFFSET: u32 = 100;

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,        // Not defined, see error message
    FileNotFound = 1,      // File not found
    AccessViolation = 2,   // Access violation
    DiskFull = 3,          // Disk full or allocation exceeded
    IllegalOperation = 4,  // Illegal TFTP operation
    UnknownTid = 5,        // Unknown transfer ID
    FileExists = 6,        // File already exists
    NoSuchUser = 7,        // No such user
    OptionNegotiation = 8, // RFC 2347 - Option negotiation failure
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTid),
            6 => Some(ErrorCode::FileExists),
            7 => Some(ErrorCode::NoSuchUser),
            8 => Some(ErrorCode::OptionNegotiation),
            _ => None,
        }
    }

    /// Fixed text sent on the wire for this code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Undefined error code",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiation => "Option negotiation failed",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code as u16
    }
}

/// Reason for ending a transfer with an ERROR packet.
///
/// Protocol conditions carry one of the RFC codes. Local filesystem failures
/// keep the platform error text and go out on the wire as code 0.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorCondition {
    #[error("{}", .0.message())]
    Protocol(ErrorCode),

    #[error("{message}")]
    Host { errno: Option<i32>, message: String },
}

impl ErrorCondition {
    /// Translate a local I/O failure.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return ErrorCondition::Host {
                errno: Some(errno),
                message: platform_message(errno),
            };
        }

        match err.kind() {
            io::ErrorKind::NotFound => ErrorCondition::Protocol(ErrorCode::FileNotFound),
            io::ErrorKind::PermissionDenied => ErrorCondition::Protocol(ErrorCode::AccessViolation),
            io::ErrorKind::AlreadyExists => ErrorCondition::Protocol(ErrorCode::FileExists),
            io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => {
                ErrorCondition::Protocol(ErrorCode::DiskFull)
            }
            _ => ErrorCondition::Host {
                errno: None,
                message: err.to_string(),
            },
        }
    }

    /// Numeric code carried in the ERROR packet.
    pub fn wire_code(&self) -> u16 {
        match self {
            ErrorCondition::Protocol(code) => u16::from(*code),
            ErrorCondition::Host { .. } => u16::from(ErrorCode::NotDefined),
        }
    }

    /// Code used when reporting locally; host errors are offset past the RFC range.
    pub fn report_code(&self) -> u32 {
        match self {
            ErrorCondition::Protocol(code) => u32::from(u16::from(*code)),
            ErrorCondition::Host { errno: Some(errno), .. } => {
                ERRNO_OFFSET + u32::try_from(*errno).unwrap_or(0)
            }
            ErrorCondition::Host { errno: None, .. } => ERRNO_OFFSET,
        }
    }

    /// Human readable text carried in the ERROR packet.
    pub fn message(&self) -> &str {
        match self {
            ErrorCondition::Protocol(code) => code.message(),
            ErrorCondition::Host { message, .. } => message,
        }
    }
}

impl From<ErrorCode> for ErrorCondition {
    fn from(code: ErrorCode) -> Self {
        ErrorCondition::Protocol(code)
    }
}

fn platform_message(errno: i32) -> String {
    let text = io::Error::from_raw_os_error(errno).to_string();
    match text.rsplit_once(" (os error ") {
        Some((message, _)) => message.to_string(),
        None => text,
    }
}
