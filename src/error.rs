use crate::types::TransportKind;
use thiserror::Error;

/// Result type for cremalink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the device facade
#[derive(Error, Debug)]
pub enum Error {
    /// Device profile could not be loaded
    #[error(transparent)]
    Profile(#[from] ProfileError),

    /// Command parameters were rejected before transmission
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Transport could not be established or was lost
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    /// Command did not complete
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Device configuration is unusable
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// A device profile is malformed or inconsistent
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("failed to read profile {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("profile is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown built-in profile '{0}'")]
    UnknownBuiltin(String),

    #[error("duplicate field '{0}'")]
    DuplicateField(String),

    #[error("duplicate command '{0}'")]
    DuplicateCommand(String),

    #[error("duplicate parameter '{param}' in command '{command}'")]
    DuplicateParam { command: String, param: String },

    #[error("'{name}' spans bytes {start}..{end}, outside the {limit}-byte frame")]
    OutOfBounds {
        name: String,
        start: usize,
        end: usize,
        limit: usize,
    },

    #[error("enumeration '{0}' does not label every raw value and is not marked open")]
    IncompleteEnumeration(String),

    #[error("command '{command}' targets unknown field '{field}'")]
    UnknownTarget { command: String, field: String },

    #[error("alias '{alias}' points at unknown field '{field}'")]
    UnknownAlias { alias: String, field: String },

    #[error("invalid descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("invalid hex in '{name}': {source}")]
    Hex {
        name: String,
        #[source]
        source: hex::FromHexError,
    },
}

impl ProfileError {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// An inbound frame could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("frame does not start with the telemetry prefix")]
    Prefix,

    #[error("frame terminator missing")]
    Terminator,

    #[error("checksum mismatch: frame carries {found:#06x}, computed {computed:#06x}")]
    Checksum { found: u32, computed: u32 },
}

/// Command parameters were rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("command '{command}' requires parameter '{param}'")]
    MissingParameter { command: String, param: String },

    #[error("command '{command}' has no parameter '{param}'")]
    UnexpectedParameter { command: String, param: String },

    #[error("parameter '{param}' expects {expected}")]
    TypeMismatch { param: String, expected: &'static str },

    #[error("parameter '{param}' value {value} is out of range")]
    OutOfRange { param: String, value: String },

    #[error("'{value}' is not a valid value for parameter '{param}'")]
    NotInEnumeration { param: String, value: String },
}

/// Transport-level failure. Drives reconnect backoff rather than failing calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("no transport configured")]
    NoTransport,

    #[error("{transport} transport unreachable: {reason}")]
    Unreachable {
        transport: TransportKind,
        reason: String,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("relay protocol error: {0}")]
    Relay(String),

    #[error("liveness probe timed out")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("gave up after {attempts} failed connection attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl From<std::io::Error> for ConnectivityError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectivityError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A submitted command did not complete successfully
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("command '{command}' was not acknowledged after {attempts} attempts")]
    Timeout { command: String, attempts: u32 },

    #[error("command '{command}' was cancelled")]
    Cancelled { command: String },

    #[error("command '{command}' was superseded by command #{by}")]
    Superseded { command: String, by: u64 },

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
}
