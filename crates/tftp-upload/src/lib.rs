//! Single-upload TFTP receiver (RFC 1350 with the RFC 2347/2348/2349 options).
//!
//! [`UploadServer`] waits on a rendezvous port for one write request, moves
//! the conversation to an ephemeral port and stores the upload under the
//! configured root directory. [`receive_file`] wraps that for the common case.

pub mod access;
pub mod audit;
pub mod config;
pub mod error;
pub mod machine;
pub mod progress;
pub mod session;
pub mod sink;
pub mod timer;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub use access::{AccessPolicy, UploadPath, Violation};
pub use audit::{AuditEvent, AuditLogger};
pub use config::{LogFormat, LoggingConfig, TftpConfig, TransferConfig, WriteConfig};
pub use error::{Result, TftpError};
pub use machine::{AbortReason, State, Step, TransferMachine};
pub use progress::{ProgressFn, ProgressTracker};
pub use session::{UploadOutcome, UploadServer, bind_rendezvous};
pub use sink::{BlockSink, StagedFile};
pub use timer::{Expiry, RetransmitTimer};

/// Receive one file on `port` into `root_dir` and return where it was stored.
///
/// `root_dir` is created when missing. `progress` is called with the
/// completion percentage whenever the client declared a size.
pub async fn receive_file(
    root_dir: impl AsRef<Path>,
    port: u16,
    progress: Option<ProgressFn>,
) -> Result<PathBuf> {
    let root_dir = root_dir.as_ref();
    std::fs::create_dir_all(root_dir)?;

    let config = TftpConfig {
        root_dir: root_dir.to_path_buf(),
        bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
        ..TftpConfig::default()
    };

    let outcome = UploadServer::new(config)?.serve_one(progress).await?;
    Ok(outcome.path)
}
