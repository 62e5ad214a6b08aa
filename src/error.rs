//! Error types for safety-io

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// safety-io error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket connect/send/receive failure (already retried once)
    #[error("network error: {0}")]
    Network(String),

    /// Malformed, short or mismatched response, or a device exception code
    #[error("protocol error: {message}{}", code.map(|c| format!(" (code {:#04x})", c)).unwrap_or_default())]
    Protocol {
        /// Exception code reported by the device, when one was present
        code: Option<u8>,
        /// Human readable description
        message: String,
    },

    /// Malformed command arguments, rejected before any I/O
    #[error("format error: {0}")]
    Format(String),

    /// No adapter registered under this name
    #[error("sensor not enabled or unknown sensor: {0}")]
    UnknownSensor(String),

    /// Adapter does not understand the sub-command
    #[error("unknown {sensor} command: {command}")]
    UnknownCommand {
        /// Sensor the command was addressed to
        sensor: String,
        /// Offending sub-command
        command: String,
    },

    /// Operator declined a risky write
    #[error("write to {address:#06x} cancelled by operator")]
    WriteCancelled {
        /// Target register address
        address: u16,
    },

    /// A driver failed during orchestrator init
    #[error("init failed on {name}: {message}")]
    DriverInit {
        /// Sensor name of the failing driver
        name: String,
        /// Failure reason
        message: String,
    },

    /// Orchestrator or driver used before `init()`
    #[error("not initialized")]
    NotInitialized,

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// A background worker panicked
    #[error("thread panic")]
    ThreadPanic,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Protocol error without a device exception code
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            code: None,
            message: message.into(),
        }
    }

    /// Device returned an exception code
    pub fn exception(code: u8) -> Self {
        Error::Protocol {
            code: Some(code),
            message: "device exception".to_string(),
        }
    }

    /// Whether this error came from socket I/O (the only retryable class)
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}
