use tftp_upload_core::ErrorCondition;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The transfer was refused or ended locally with an ERROR packet.
    #[error("Transfer aborted (code {code}): {0}", code = .0.report_code())]
    Aborted(ErrorCondition),

    #[error("Peer sent error {code}: {message}")]
    PeerError { code: u16, message: String },

    #[error("Transfer timed out after {retries} retransmissions")]
    TimedOut { retries: u32 },

    #[error("No request received within {0} seconds")]
    Idle(u64),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
