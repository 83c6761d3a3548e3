use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Correlation identifier assigned to each submitted command
pub type CorrelationId = u64;

/// Decoded values keyed by field name
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Command parameters keyed by parameter name
pub type Params = BTreeMap<String, FieldValue>;

/// A decoded telemetry value or a command parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    /// Label of a known enumeration value
    Enum(String),
    /// Labels of the set bits in a flag field
    Flags(BTreeSet<String>),
    /// Raw value with no label in an open enumeration
    Unrecognized(u64),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Decimal(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_label(&self) -> Option<&str> {
        match self {
            Self::Enum(label) => Some(label),
            _ => None,
        }
    }

    /// Whether this is an enumeration value the profile has no label for
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Self::Unrecognized(_))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Enum(label) => f.write_str(label),
            Self::Flags(set) => {
                let labels: Vec<&str> = set.iter().map(String::as_str).collect();
                write!(f, "[{}]", labels.join(", "))
            }
            Self::Unrecognized(raw) => write!(f, "unrecognized({raw})"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Decimal(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(label: &str) -> Self {
        Self::Enum(label.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(label: String) -> Self {
        Self::Enum(label)
    }
}

/// Which backend carries the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Direct socket on the local network
    Local,
    /// Vendor cloud relay
    Cloud,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Cloud => f.write_str("cloud"),
        }
    }
}

/// Session liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Disconnected,
    Handshaking,
    Connected,
    /// Keepalive probes are going unanswered but the session is still open
    Degraded,
}

impl Liveness {
    /// Whether frames can be sent in this state
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

/// Snapshot of the session as seen by callers (the connectivity-quality signal)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub liveness: Liveness,
    /// Active backend, `None` when disconnected
    pub transport: Option<TransportKind>,
    pub connection_id: Option<Uuid>,
}

impl SessionStatus {
    pub fn disconnected() -> Self {
        Self {
            liveness: Liveness::Disconnected,
            transport: None,
            connection_id: None,
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// What to do when a command targets a field that already has a command in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Wait for the in-flight command to finish
    #[default]
    Queue,
    /// Cancel the in-flight command and take its place
    Supersede,
}
