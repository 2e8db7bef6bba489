use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{Level, event};

/// Security relevant events of the upload receiver.
///
/// Each event serialises to a single JSON object tagged with `event_type`
/// and is emitted through `tracing` under the `audit_event` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Rendezvous socket bound
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    /// Write request received
    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    /// Request answered with an ERROR before any transfer started
    RequestRejected {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: Option<String>,
        error_code: u32,
        reason: String,
    },

    /// Negotiation done, first ACK/OACK about to go out
    WriteStarted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        block_size: usize,
        timeout_ms: u64,
        /// Size declared through `tsize`, 0 when unknown
        declared_size: u64,
    },

    /// Final block written and the file renamed into place
    WriteCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_received: u64,
        blocks_received: u64,
        duration_ms: u64,
        /// Transfer throughput in bytes per second
        throughput_bps: u64,
    },

    /// Transfer aborted after it started
    WriteFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
        blocks_received: u64,
    },

    /// Packet that does not fit the conversation
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },

    /// Filename escaping the root directory
    PathTraversalAttempt {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        requested_path: String,
        violation_type: String,
    },

    ConfigurationLoaded {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
    },

    ConfigurationError {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
        error: String,
    },
}

/// Fields shared by every audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    /// Ties together the events of one transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "tftp-upload".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, correlation_id: Option<&str>) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = correlation_id.map(str::to_string);
        fields
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });

        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    pub fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::RequestRejected { common, .. }
            | AuditEvent::WriteStarted { common, .. }
            | AuditEvent::WriteCompleted { common, .. }
            | AuditEvent::WriteFailed { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::PathTraversalAttempt { common, .. }
            | AuditEvent::ConfigurationLoaded { common, .. }
            | AuditEvent::ConfigurationError { common, .. } => common,
        }
    }
}

/// Emits audit events when enabled in `[logging]`; a disabled logger drops them.
#[derive(Debug, Clone, Copy)]
pub struct AuditLogger {
    enabled: bool,
}

impl AuditLogger {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn emit(&self, event: AuditEvent) {
        if self.enabled {
            event.log();
        }
    }

    /// Format: <millis>-<client_addr>-<filename_hash>
    pub fn generate_correlation_id(client_addr: SocketAddr, filename: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        filename.hash(&mut hasher);
        let hash = hasher.finish();

        format!(
            "{:x}-{}-{:x}",
            chrono::Utc::now().timestamp_millis(),
            client_addr.to_string().replace(':', "-"),
            hash
        )
    }

    pub fn server_started(&self, bind_addr: SocketAddr, root_dir: &Path) {
        self.emit(AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.display().to_string(),
        });
    }

    pub fn write_request(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        mode: &str,
        options: &[(String, String)],
        correlation_id: &str,
    ) {
        let options = options
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
            .collect::<serde_json::Map<_, _>>();

        self.emit(AuditEvent::WriteRequest {
            common: CommonFields::with_correlation("info", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: serde_json::Value::Object(options),
        });
    }

    pub fn request_rejected(
        &self,
        client_addr: SocketAddr,
        filename: Option<&str>,
        error_code: u32,
        reason: &str,
    ) {
        self.emit(AuditEvent::RequestRejected {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.map(str::to_string),
            error_code,
            reason: reason.to_string(),
        });
    }

    pub fn write_started(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        block_size: usize,
        timeout_ms: u64,
        declared_size: u64,
        correlation_id: &str,
    ) {
        self.emit(AuditEvent::WriteStarted {
            common: CommonFields::with_correlation("info", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            block_size,
            timeout_ms,
            declared_size,
        });
    }

    pub fn write_completed(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        bytes_received: u64,
        blocks_received: u64,
        duration_ms: u64,
        correlation_id: &str,
    ) {
        let throughput_bps = if duration_ms > 0 {
            (bytes_received * 1000) / duration_ms
        } else {
            0
        };

        self.emit(AuditEvent::WriteCompleted {
            common: CommonFields::with_correlation("info", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_received,
            blocks_received,
            duration_ms,
            throughput_bps,
        });
    }

    pub fn write_failed(
        &self,
        client_addr: SocketAddr,
        filename: &str,
        error: &str,
        blocks_received: u64,
        correlation_id: &str,
    ) {
        self.emit(AuditEvent::WriteFailed {
            common: CommonFields::with_correlation("error", Some(correlation_id)),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
            blocks_received,
        });
    }

    pub fn protocol_violation(&self, client_addr: SocketAddr, violation: &str) {
        self.emit(AuditEvent::ProtocolViolation {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        });
    }

    pub fn path_traversal_attempt(
        &self,
        client_addr: SocketAddr,
        requested_path: &str,
        violation_type: &str,
    ) {
        self.emit(AuditEvent::PathTraversalAttempt {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            requested_path: requested_path.to_string(),
            violation_type: violation_type.to_string(),
        });
    }

    pub fn configuration_loaded(&self, config_file: &Path) {
        self.emit(AuditEvent::ConfigurationLoaded {
            common: CommonFields::new("info"),
            config_file: config_file.display().to_string(),
        });
    }

    pub fn configuration_error(&self, config_file: &Path, error: &str) {
        self.emit(AuditEvent::ConfigurationError {
            common: CommonFields::new("error"),
            config_file: config_file.display().to_string(),
            error: error.to_string(),
        });
    }
}
