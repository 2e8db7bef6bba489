use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant as StdInstant;
use tftp_upload_core::{
    ErrorCode, ErrorCondition, MAX_PACKET_SIZE, NegotiatedOptions, Negotiation, OptionNegotiator,
    Request, RequestKind, encode_error,
};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::access::{AccessPolicy, UploadPath};
use crate::audit::AuditLogger;
use crate::config::TftpConfig;
use crate::error::{Result, TftpError};
use crate::machine::{AbortReason, Step, TransferMachine};
use crate::progress::ProgressFn;
use crate::sink::StagedFile;

// One byte past the largest legal packet so oversized DATA is seen as such
// instead of being silently truncated.
const RECV_BUFFER_SIZE: usize = MAX_PACKET_SIZE + 1;

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub path: PathBuf,
    pub peer: SocketAddr,
    pub bytes: u64,
    pub blocks: u64,
}

/// A write request that passed validation and negotiation.
struct AcceptedRequest {
    peer: SocketAddr,
    filename: String,
    upload: UploadPath,
    negotiation: Negotiation,
    sink: StagedFile,
    correlation_id: String,
}

/// Bind the well-known request port with `SO_REUSEADDR`.
pub fn bind_rendezvous(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Serves exactly one upload: waits on the rendezvous port for a write
/// request, then runs the transfer from an ephemeral port.
#[derive(Debug)]
pub struct UploadServer {
    config: TftpConfig,
    policy: AccessPolicy,
    negotiator: OptionNegotiator,
    audit: AuditLogger,
}

impl UploadServer {
    pub fn new(config: TftpConfig) -> Result<Self> {
        let policy = AccessPolicy::new(&config.root_dir, &config.write_config)?;
        let negotiator = OptionNegotiator::new(NegotiatedOptions {
            timeout: config.transfer.retransmit_timeout(),
            ..NegotiatedOptions::default()
        });
        let audit = AuditLogger::new(config.logging.audit_enabled);

        Ok(Self {
            config,
            policy,
            negotiator,
            audit,
        })
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Bind the configured address and serve one upload.
    pub async fn serve_one(&self, progress: Option<ProgressFn>) -> Result<UploadOutcome> {
        let socket = bind_rendezvous(self.config.bind_addr)?;
        self.serve_on(socket, progress).await
    }

    /// Serve one upload on an already bound rendezvous socket.
    ///
    /// Rejected requests are answered from the rendezvous socket and the
    /// wait continues. The socket is closed once a request is accepted.
    pub async fn serve_on(
        &self,
        socket: UdpSocket,
        progress: Option<ProgressFn>,
    ) -> Result<UploadOutcome> {
        let local_addr = socket.local_addr()?;
        info!("Waiting for an upload on {}", local_addr);
        self.audit.server_started(local_addr, self.policy.root_dir());

        let idle_deadline = self
            .config
            .transfer
            .idle_timeout()
            .map(|idle| Instant::now() + idle);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        let accepted = loop {
            let received = match idle_deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                    .await
                    .map_err(|_| TftpError::Idle(self.config.transfer.idle_timeout_secs))?,
                None => socket.recv_from(&mut buf).await,
            };

            let (len, peer) = match received {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving TFTP packet: {}", e);
                    continue;
                }
            };

            match self.accept(&buf[..len], peer) {
                Ok(accepted) => break accepted,
                Err(condition) => {
                    let packet = encode_error(&condition);
                    if let Err(e) = socket.send_to(&packet, peer).await {
                        warn!("Failed to send ERROR to {}: {}", peer, e);
                    }
                }
            }
        };

        drop(socket);
        self.run_transfer(accepted, local_addr, progress).await
    }

    fn accept(
        &self,
        buf: &[u8],
        peer: SocketAddr,
    ) -> std::result::Result<AcceptedRequest, ErrorCondition> {
        let request = match Request::decode(buf) {
            Ok(request) => request,
            Err(code) => {
                warn!("Malformed request from {}: {}", peer, code.message());
                self.audit.protocol_violation(peer, code.message());
                self.audit
                    .request_rejected(peer, None, u32::from(u16::from(code)), code.message());
                return Err(code.into());
            }
        };

        if request.kind == RequestKind::Read {
            info!("Refusing {} for {} from {}", request.kind.as_str(), request.filename, peer);
            let code = ErrorCode::IllegalOperation;
            self.audit.request_rejected(
                peer,
                Some(&request.filename),
                u32::from(u16::from(code)),
                "only uploads are served",
            );
            return Err(code.into());
        }

        let correlation_id = AuditLogger::generate_correlation_id(peer, &request.filename);
        info!(
            "Write request from {}: {} ({})",
            peer,
            request.filename,
            request.mode.as_str()
        );
        self.audit.write_request(
            peer,
            &request.filename,
            request.mode.as_str(),
            &request.options,
            &correlation_id,
        );

        let upload = self.policy.resolve(&request.filename).map_err(|violation| {
            warn!(
                "Refusing upload of {} from {}: {}",
                request.filename,
                peer,
                violation.as_str()
            );
            if violation.is_escape() {
                self.audit
                    .path_traversal_attempt(peer, &request.filename, violation.as_str());
            }
            let code = violation.error_code();
            self.audit.request_rejected(
                peer,
                Some(&request.filename),
                u32::from(u16::from(code)),
                violation.as_str(),
            );
            ErrorCondition::from(code)
        })?;

        let negotiation = self.negotiator.negotiate(&request.options, 0);

        let keep_partial = self.config.transfer.keep_partial_uploads;
        let sink = StagedFile::create(upload.target.clone(), keep_partial).map_err(|e| {
            let condition = ErrorCondition::from_io(&e);
            warn!("Cannot create {}: {}", upload.staging.display(), e);
            self.audit.request_rejected(
                peer,
                Some(&request.filename),
                condition.report_code(),
                condition.message(),
            );
            condition
        })?;

        Ok(AcceptedRequest {
            peer,
            filename: request.filename,
            upload,
            negotiation,
            sink,
            correlation_id,
        })
    }

    async fn run_transfer(
        &self,
        accepted: AcceptedRequest,
        local_addr: SocketAddr,
        progress: Option<ProgressFn>,
    ) -> Result<UploadOutcome> {
        let AcceptedRequest {
            peer,
            filename,
            upload,
            negotiation,
            sink,
            correlation_id,
        } = accepted;
        let options = negotiation.options;

        let socket = UdpSocket::bind(SocketAddr::new(local_addr.ip(), 0)).await?;
        debug!(
            "Transfer socket {} for {}",
            socket.local_addr()?,
            peer
        );

        self.audit.write_started(
            peer,
            &filename,
            options.block_size,
            options.timeout.as_millis() as u64,
            options.transfer_size,
            &correlation_id,
        );

        let started = StdInstant::now();
        let mut machine = TransferMachine::new(
            sink,
            options,
            negotiation.oack(),
            self.config.transfer.max_retries,
            progress,
        );
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut step = machine.start();

        loop {
            match step {
                Step::SendAndAwait(packet) => {
                    socket.send_to(&packet, peer).await?;
                }
                Step::HoldOpen(packet) => {
                    send_final_ack(&socket, &packet, peer).await;
                }
                Step::Resync(packet) => {
                    let drained = drain_pending(&socket, &mut buf);
                    if drained > 0 {
                        warn!("Dropped {} queued packets after a duplicate block", drained);
                    }
                    socket.send_to(&packet, peer).await?;
                }
                Step::Ignore => {}
                Step::Done => break,
                Step::Abort(reason) => {
                    if let AbortReason::Local(ref condition) = reason
                        && let Err(e) = socket.send_to(&encode_error(condition), peer).await
                    {
                        debug!("Failed to send ERROR to {}: {}", peer, e);
                    }
                    let err = TftpError::from(reason);
                    warn!("Upload of {} from {} failed: {}", filename, peer, err);
                    self.audit.write_failed(
                        peer,
                        &filename,
                        &err.to_string(),
                        machine.blocks_written(),
                        &correlation_id,
                    );
                    return Err(err);
                }
            }

            step = loop {
                let Some(deadline) = machine.deadline() else {
                    break machine.on_timeout();
                };

                match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Err(_) => break machine.on_timeout(),
                    Ok(Err(e)) => {
                        debug!("Error receiving on transfer socket: {}", e);
                    }
                    Ok(Ok((_, from))) if from != peer => {
                        warn!("Packet from unknown transfer ID {}", from);
                        self.audit
                            .protocol_violation(from, "packet from unknown transfer ID");
                        let packet = encode_error(&ErrorCode::UnknownTid.into());
                        if let Err(e) = socket.send_to(&packet, from).await {
                            debug!("Failed to send ERROR to {}: {}", from, e);
                        }
                    }
                    Ok(Ok((len, _))) => break machine.on_datagram(&buf[..len]),
                }
            };
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Received {} ({} bytes) from {} in {} ms",
            upload.target.display(),
            machine.bytes_written(),
            peer,
            duration_ms
        );
        self.audit.write_completed(
            peer,
            &filename,
            machine.bytes_written(),
            machine.blocks_written(),
            duration_ms,
            &correlation_id,
        );

        Ok(UploadOutcome {
            path: upload.target,
            peer,
            bytes: machine.bytes_written(),
            blocks: machine.blocks_written(),
        })
    }
}

/// Discard everything already queued on the socket.
/// The file is already published, so a failed send only leaves the peer to retry.
async fn send_final_ack(socket: &UdpSocket, packet: &[u8], peer: SocketAddr) -> bool {
    match socket.send_to(packet, peer).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to send final ACK to {}: {}", peer, e);
            false
        }
    }
}

fn drain_pending(socket: &UdpSocket, buf: &mut [u8]) -> usize {
    let mut drained = 0;
    loop {
        match socket.try_recv_from(buf) {
            Ok(_) => drained += 1,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("Error while draining socket: {}", e);
                break;
            }
        }
    }
    drained
}
