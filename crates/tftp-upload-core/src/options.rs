use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

use crate::packet::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, encode_oack};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 255; // RFC 2349
const MIN_UTIMEOUT_MS: u64 = MIN_TIMEOUT_SECS * 1000;
const MAX_UTIMEOUT_MS: u64 = MAX_TIMEOUT_SECS * 1000;

// RFC 2347/2348/2349 - TFTP Options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedOptions {
    pub block_size: usize,   // RFC 2348 - Block Size Option
    pub timeout: Duration,   // RFC 2349 - Timeout Interval Option
    pub transfer_size: u64,  // RFC 2349 - Transfer Size Option, 0 when unknown
}

impl Default for NegotiatedOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            transfer_size: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionName {
    BlockSize,
    BlockSize2,
    TransferSize,
    Timeout,
    MilliTimeout,
}

impl OptionName {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "blksize" => Some(OptionName::BlockSize),
            "blksize2" => Some(OptionName::BlockSize2),
            "tsize" => Some(OptionName::TransferSize),
            "timeout" => Some(OptionName::Timeout),
            "utimeout" => Some(OptionName::MilliTimeout),
            _ => None,
        }
    }
}

/// Result of negotiating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub options: NegotiatedOptions,
    /// Accepted options in request order, as echoed in the OACK.
    pub accepted: Vec<(String, String)>,
}

impl Negotiation {
    /// The OACK to send, or `None` when the peer gets a plain ACK(0).
    pub fn oack(&self) -> Option<Bytes> {
        if self.accepted.is_empty() {
            None
        } else {
            Some(encode_oack(&self.accepted))
        }
    }
}

/// Applies RFC 2347 negotiation on top of a fixed set of defaults.
#[derive(Debug, Clone, Default)]
pub struct OptionNegotiator {
    defaults: NegotiatedOptions,
}

impl OptionNegotiator {
    pub fn new(defaults: NegotiatedOptions) -> Self {
        Self { defaults }
    }

    /// Negotiate the options of one request.
    ///
    /// Every call starts from the defaults. `known_size` is what a `tsize` of 0
    /// is answered with. Options that are unknown, malformed or out of range
    /// are dropped without failing the request.
    pub fn negotiate(&self, requested: &[(String, String)], known_size: u64) -> Negotiation {
        let mut options = self.defaults;
        let mut accepted = Vec::new();
        let mut block_size_set = false;

        for (name, value) in requested {
            if name.is_empty() || value.is_empty() {
                continue;
            }

            let Some(option) = OptionName::parse(name) else {
                debug!("Ignoring unknown option: {}", name);
                continue;
            };

            let Ok(requested_value) = value.parse::<u64>() else {
                debug!("Ignoring option {} with invalid value {:?}", name, value);
                continue;
            };

            let negotiated = match option {
                OptionName::BlockSize | OptionName::BlockSize2 => {
                    if block_size_set {
                        debug!("Ignoring {}: block size already negotiated", name);
                        None
                    } else {
                        let size = block_size(requested_value, option == OptionName::BlockSize2);
                        if let Some(size) = size {
                            options.block_size = size;
                            block_size_set = true;
                        }
                        size.map(|s| s as u64)
                    }
                }
                OptionName::TransferSize => {
                    if requested_value == 0 {
                        Some(known_size)
                    } else {
                        options.transfer_size = requested_value;
                        Some(requested_value)
                    }
                }
                OptionName::Timeout => (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS)
                    .contains(&requested_value)
                    .then(|| {
                        options.timeout = Duration::from_secs(requested_value);
                        requested_value
                    }),
                OptionName::MilliTimeout => (MIN_UTIMEOUT_MS..=MAX_UTIMEOUT_MS)
                    .contains(&requested_value)
                    .then(|| {
                        options.timeout = Duration::from_millis(requested_value);
                        requested_value
                    }),
            };

            match negotiated {
                Some(v) => accepted.push((name.clone(), v.to_string())),
                None => debug!("Unsupported option value {}={}", name, value),
            }
        }

        Negotiation { options, accepted }
    }
}

/// RFC 2348 bounds. The `blksize2` variant rounds an in-range request down to a
/// power of two; an oversized one is clamped like `blksize`.
fn block_size(requested: u64, power_of_two: bool) -> Option<usize> {
    if requested < MIN_BLOCK_SIZE as u64 {
        return None;
    }

    let size = if requested > MAX_BLOCK_SIZE as u64 {
        MAX_BLOCK_SIZE as u64
    } else if power_of_two {
        1u64 << (63 - requested.leading_zeros())
    } else {
        requested
    };

    usize::try_from(size).ok()
}
