use bytes::Bytes;
use std::io;
use tftp_upload_core::{
    ErrorCode, ErrorCondition, NegotiatedOptions, Packet, PacketError, encode_ack,
};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::TftpError;
use crate::progress::{ProgressFn, ProgressTracker};
use crate::sink::BlockSink;
use crate::timer::{Expiry, RetransmitTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Negotiated, first ACK/OACK not sent yet.
    AwaitingFirstAck,
    AwaitingData { block: u16 },
    /// Final block acknowledged and published; answering a lost last ACK.
    FinalHoldOpen { block: u16 },
    Done,
    Aborted,
}

/// Why a transfer ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Ended on our side; the peer gets an ERROR packet.
    Local(ErrorCondition),
    /// The peer sent an ERROR; nothing is sent back.
    Peer { code: u16, message: String },
    /// Retry budget spent; nothing is sent.
    TimedOut { retries: u32 },
}

impl From<AbortReason> for TftpError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Local(condition) => TftpError::Aborted(condition),
            AbortReason::Peer { code, message } => TftpError::PeerError { code, message },
            AbortReason::TimedOut { retries } => TftpError::TimedOut { retries },
        }
    }
}

/// What the caller has to do after feeding the machine an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send the packet to the peer and wait for the next datagram or the deadline.
    SendAndAwait(Bytes),
    /// Duplicate of the previous block: drain queued input, then resend the packet.
    Resync(Bytes),
    /// Send the final ACK; the upload is committed, keep listening until the deadline.
    HoldOpen(Bytes),
    /// Nothing to send, keep waiting on the current deadline.
    Ignore,
    /// Transfer finished.
    Done,
    Abort(AbortReason),
}

/// Write side of one transfer, independent of sockets and clocks.
///
/// The caller owns the I/O: it sends whatever a [`Step`] carries, feeds
/// datagrams from the pinned peer to [`on_datagram`](Self::on_datagram)
/// and calls [`on_timeout`](Self::on_timeout) once [`deadline`](Self::deadline)
/// passes.
#[derive(Debug)]
pub struct TransferMachine<S: BlockSink> {
    state: State,
    sink: S,
    block_size: usize,
    first_packet: Bytes,
    last_sent: Bytes,
    timer: RetransmitTimer,
    progress: ProgressTracker,
    bytes_written: u64,
    blocks_written: u64,
}

impl<S: BlockSink> TransferMachine<S> {
    /// `oack` is the negotiated option acknowledgement, or `None` for a plain ACK(0).
    pub fn new(
        sink: S,
        options: NegotiatedOptions,
        oack: Option<Bytes>,
        max_retries: u32,
        progress: Option<ProgressFn>,
    ) -> Self {
        let first_packet = oack.unwrap_or_else(|| encode_ack(0));
        Self {
            state: State::AwaitingFirstAck,
            sink,
            block_size: options.block_size,
            last_sent: first_packet.clone(),
            first_packet,
            timer: RetransmitTimer::new(options.timeout, max_retries),
            progress: ProgressTracker::new(options.transfer_size, options.block_size, progress),
            bytes_written: 0,
            blocks_written: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn retries(&self) -> u32 {
        self.timer.retries()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Done | State::Aborted)
    }

    /// Emit the OACK or ACK(0) and wait for block 1.
    pub fn start(&mut self) -> Step {
        if self.state != State::AwaitingFirstAck {
            return Step::Ignore;
        }
        self.progress.update(0);
        self.state = State::AwaitingData { block: 1 };
        self.send(self.first_packet.clone())
    }

    pub fn on_datagram(&mut self, buf: &[u8]) -> Step {
        match self.state {
            State::AwaitingData { block } => {
                self.timer.cancel();
                self.on_awaited_datagram(block, buf)
            }
            State::FinalHoldOpen { block } => self.on_hold_open_datagram(block, buf),
            State::AwaitingFirstAck | State::Done | State::Aborted => Step::Ignore,
        }
    }

    pub fn on_timeout(&mut self) -> Step {
        match self.state {
            State::AwaitingData { block } => match self.timer.record_retry() {
                Expiry::Retry(n) => {
                    debug!("Timeout waiting for block {}, retransmit #{}", block, n);
                    self.send(self.last_sent.clone())
                }
                Expiry::Exhausted(n) => {
                    warn!("Giving up on block {} after {} timeouts", block, n - 1);
                    self.abort(AbortReason::TimedOut { retries: n - 1 })
                }
            },
            State::FinalHoldOpen { .. } => {
                self.timer.cancel();
                self.state = State::Done;
                Step::Done
            }
            State::AwaitingFirstAck | State::Done | State::Aborted => Step::Ignore,
        }
    }

    fn on_awaited_datagram(&mut self, expected: u16, buf: &[u8]) -> Step {
        let packet = match Packet::decode(buf) {
            Ok(packet) => packet,
            Err(PacketError::TooShort(len)) => {
                debug!("Short packet of {} bytes", len);
                return self.abort_with(ErrorCode::IllegalOperation);
            }
            Err(PacketError::UnknownOpcode(op)) => {
                debug!("Unexpected opcode {}", op);
                return self.abort_with(ErrorCode::UnknownTid);
            }
        };

        match packet {
            Packet::Data { block, payload } if block == expected => {
                self.accept_block(block, payload)
            }
            Packet::Data { block, .. } if block == expected.wrapping_sub(1) => {
                trace!("Duplicate block {}, resending last packet", block);
                self.resync()
            }
            Packet::Data { block, .. } => {
                debug!("Got block {} while waiting for {}", block, expected);
                self.abort_with(ErrorCode::UnknownTid)
            }
            Packet::Error { code, message } => {
                debug!("Peer aborted with error {}: {}", code, message);
                self.abort(AbortReason::Peer { code, message })
            }
            other => {
                debug!("Unexpected packet {:?} during transfer", other);
                self.abort_with(ErrorCode::UnknownTid)
            }
        }
    }

    fn on_hold_open_datagram(&mut self, final_block: u16, buf: &[u8]) -> Step {
        match Packet::decode(buf) {
            Ok(Packet::Data { block, .. }) if block == final_block => {
                match self.timer.record_retry() {
                    Expiry::Retry(_) => {
                        debug!("Final block {} repeated, resending ACK", block);
                        self.hold_open(self.last_sent.clone())
                    }
                    Expiry::Exhausted(_) => {
                        self.state = State::Done;
                        Step::Done
                    }
                }
            }
            Ok(Packet::Error { code, message }) => {
                debug!("Peer sent error {} after completion: {}", code, message);
                self.timer.cancel();
                self.state = State::Done;
                Step::Done
            }
            _ => Step::Ignore,
        }
    }

    fn accept_block(&mut self, block: u16, payload: &[u8]) -> Step {
        if payload.len() > self.block_size {
            debug!(
                "Block {} carries {} bytes, more than the negotiated {}",
                block,
                payload.len(),
                self.block_size
            );
            return self.abort_with(ErrorCode::IllegalOperation);
        }

        if !payload.is_empty() {
            match self.sink.write_block(payload) {
                Ok(n) if n == payload.len() => {}
                Ok(n) => {
                    warn!("Short write: {} of {} bytes", n, payload.len());
                    return self.abort_with(ErrorCode::DiskFull);
                }
                Err(e) => return self.abort_io(&e),
            }
        }
        self.bytes_written += payload.len() as u64;
        self.blocks_written += 1;

        let ack = encode_ack(block);

        if payload.len() == self.block_size {
            self.progress.update(self.blocks_written);
            self.state = State::AwaitingData {
                block: block.wrapping_add(1),
            };
            return self.send(ack);
        }

        if let Err(e) = self.sink.flush().and_then(|()| self.sink.publish()) {
            return self.abort_io(&e);
        }
        self.progress.update(self.blocks_written);
        debug!(
            "Final block {} received, {} bytes total",
            block, self.bytes_written
        );
        self.state = State::FinalHoldOpen { block };
        self.timer.reset_retries();
        self.hold_open(ack)
    }

    fn send(&mut self, packet: Bytes) -> Step {
        self.last_sent = packet.clone();
        self.timer.arm();
        Step::SendAndAwait(packet)
    }

    fn resync(&mut self) -> Step {
        self.timer.arm();
        Step::Resync(self.last_sent.clone())
    }

    fn hold_open(&mut self, packet: Bytes) -> Step {
        self.last_sent = packet.clone();
        self.timer.arm();
        Step::HoldOpen(packet)
    }

    fn abort_with(&mut self, code: ErrorCode) -> Step {
        self.abort(AbortReason::Local(code.into()))
    }

    fn abort_io(&mut self, err: &io::Error) -> Step {
        warn!("Write failed: {}", err);
        self.abort(AbortReason::Local(ErrorCondition::from_io(err)))
    }

    fn abort(&mut self, reason: AbortReason) -> Step {
        self.timer.cancel();
        self.state = State::Aborted;
        if let Err(e) = self.sink.discard() {
            warn!("Failed to discard partial upload: {}", e);
        }
        Step::Abort(reason)
    }
}
