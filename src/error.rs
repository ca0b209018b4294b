use std::path::PathBuf;
use thiserror::Error;

/// Every failure the bridge distinguishes. Expected failures travel as
/// `Result`s; the caller decides whether they are fatal (config, MQTT auth)
/// or transient (everything else).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to open CAN interface {interface}: {source}")]
    BusOpenFailed {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CAN send failed on {interface}: {source}")]
    BusSendFailed {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed frame {arb_id:#010x}: {reason}")]
    BusFrameMalformed { arb_id: u32, reason: &'static str },

    #[error("unknown arbitration id {0:#010x}")]
    UnknownArbitrationId(u32),

    #[error("unparseable MQTT command on {topic}: {reason}")]
    MqttParseFailed { topic: String, reason: String },

    #[error("stale retained command (age {age_secs:.0}s)")]
    StaleRetainedCommand { age_secs: f64 },

    #[error("failed to persist state to {path}: {source}")]
    StatePersistIoFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("MQTT authentication failed: {0}")]
    MqttAuthFailed(String),
}

impl BridgeError {
    /// Fatal errors abort startup; everything else is logged and swallowed
    /// at the point of occurrence.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ConfigInvalid(_)
                | BridgeError::BusOpenFailed { .. }
                | BridgeError::MqttAuthFailed(_)
        )
    }
}
