//! Rust library for monitoring and commanding networked coffee machines
//!
//! Appliances are described by declarative device profiles rather than
//! per-model drivers. A profile says where each telemetry field lives in a
//! frame, what bytes each command produces and how a session is opened; one
//! generic codec does the rest. It supports:
//!
//! - JSON device profiles, built-in or loaded from disk, validated up front
//! - Telemetry decoding (integers, booleans, enumerations, flag sets, scaled decimals)
//! - Command encoding with length bytes, sequence bytes and checksums
//! - Local LAN sessions with a cloud relay fallback
//! - Keepalive, degraded-session detection and reconnect with backoff
//! - Acknowledgement tracking with retries, timeouts and conflict policies
//! - Real-time state and connectivity subscriptions
//!
//! # Quick Start
//!
//! ```no_run
//! use cremalink::{Device, DeviceConfig, FieldValue, Params, ProfileRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profiles = ProfileRepository::with_builtin()?;
//!     let device = Device::from_repository(
//!         &profiles,
//!         DeviceConfig::local("ecam-espresso", "192.168.1.40"),
//!     )?;
//!     device.connect().await?;
//!
//!     let mut params = Params::new();
//!     params.insert("beverage".into(), FieldValue::from("espresso"));
//!     device.send_command("start_brew", &params).await?;
//!
//!     println!("Boiler: {:?}", device.resolve_alias("temperature"));
//!     device.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Profile**: device profile schema and loader
//! - **Registry**: shared profiles, one per model
//! - **Codec**: frame decoding and encoding driven by a profile
//! - **Transport**: LAN socket and cloud relay backends
//! - **Connection**: session state machine, keepalive and reconnect
//! - **Dispatcher**: pending commands and acknowledgement matching
//! - **Subscription**: state store and change notification
//! - **Device**: the per-appliance facade

mod codec;
mod config;
mod connection;
mod device;
mod dispatcher;
mod error;
mod profile;
mod protocol;
mod registry;
mod subscription;
mod transport;
mod types;

// Public exports
pub use codec::{
    decode, decode_params, encode, encode_sequenced, frame, sequence_of, Codec, FrameSplitter,
};
pub use config::{CloudConfig, DeviceConfig, DispatchConfig, LocalConfig, ReconnectConfig, SessionConfig};
pub use connection::{ConnectionManager, ConnectivityEvent};
pub use device::{Device, HealthReport};
pub use dispatcher::{CommandDispatcher, CommandOutcome, FrameSink, PendingHandle, PendingInfo};
pub use error::{
    CommandError, ConnectivityError, EncodeError, Error, FrameError, ProfileError, Result,
};
pub use profile::{
    load, AckPattern, BitLayout, Bounds, Checksum, ChecksumAlgorithm, CommandDescriptor,
    DeviceProfile, Endian, Enumeration, FieldDescriptor, FieldKind, Framing, Handshake,
    LengthByte, ParamDescriptor, ProfileSource, SessionSettings, Telemetry, Transform,
    MAX_DECIMAL_WIDTH, MAX_FRAME_SIZE,
};
pub use protocol::RelayMessage;
pub use registry::{builtin_models, ProfileRepository};
pub use subscription::{DeviceEvent, DeviceState, StateChange, StateReceiver, StateStore, Subscription};
pub use transport::{CloudTransport, Inbound, LanTransport, Link, Transport};
pub use types::{
    ConflictPolicy, CorrelationId, FieldMap, FieldValue, Liveness, Params, SessionStatus,
    TransportKind,
};
