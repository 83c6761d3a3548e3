//! Interchangeable byte-stream backends
//!
//! A [`Transport`] knows how to reach an appliance; each successful
//! [`Transport::open`] yields a [`Link`] carrying whole frames. The
//! connection manager only ever talks to these two traits.

use crate::codec::{self, FrameSplitter};
use crate::config::{CloudConfig, DeviceConfig, LocalConfig};
use crate::error::{ConnectivityError, Error, Result};
use crate::profile::{DeviceProfile, Handshake};
use crate::protocol::RelayMessage;
use crate::types::TransportKind;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const READ_CHUNK: usize = 1024;

/// Something received on a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete appliance frame
    Frame(Vec<u8>),
    /// Transport-level sign of life with no frame attached
    Alive,
}

/// One open connection to an appliance
#[async_trait]
pub trait Link: Send {
    /// Transport-specific capability/version exchange
    async fn handshake(&mut self) -> std::result::Result<(), ConnectivityError>;

    async fn send(&mut self, frame: &[u8]) -> std::result::Result<(), ConnectivityError>;

    /// Next inbound item; `Ok(None)` once the peer has closed.
    ///
    /// Must be cancel-safe: it is raced against the outbound queue and timers.
    async fn recv(&mut self) -> std::result::Result<Option<Inbound>, ConnectivityError>;

    /// Send a liveness probe. Returns `false` when the link has no probe.
    async fn probe(&mut self) -> std::result::Result<bool, ConnectivityError>;

    async fn close(&mut self);
}

/// A way of reaching an appliance
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;

    async fn open(&self) -> std::result::Result<Box<dyn Link>, ConnectivityError>;
}

/// Build the transports named in `config`, in the order they should be tried
pub fn from_config(
    config: &DeviceConfig,
    profile: &Arc<DeviceProfile>,
) -> Result<Vec<Arc<dyn Transport>>> {
    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    if let Some(local) = &config.local {
        transports.push(Arc::new(LanTransport::from_config(local, profile.clone())?));
    }
    if let Some(cloud) = &config.cloud {
        transports.push(Arc::new(CloudTransport::from_config(cloud)));
    }
    if config.prefer_cloud {
        transports.reverse();
    }
    Ok(transports)
}

// ========== Local LAN socket ==========

/// Direct TCP connection on the local network
#[derive(Debug, Clone)]
pub struct LanTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    profile: Arc<DeviceProfile>,
}

impl LanTransport {
    pub fn new(host: impl Into<String>, port: u16, profile: Arc<DeviceProfile>) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_millis(3000),
            profile,
        }
    }

    /// Port comes from the config, or else from the profile's session block
    pub fn from_config(config: &LocalConfig, profile: Arc<DeviceProfile>) -> Result<Self> {
        let port = config.port.or(profile.session.port).ok_or_else(|| {
            Error::Config(format!(
                "no port for {}: set local.port or declare session.port in profile '{}'",
                config.host, profile.model
            ))
        })?;
        Ok(Self::new(config.host.clone(), port, profile).with_connect_timeout(config.connect_timeout()))
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Transport for LanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(&self) -> std::result::Result<Box<dyn Link>, ConnectivityError> {
        let unreachable = |reason: String| ConnectivityError::Unreachable {
            transport: TransportKind::Local,
            reason,
        };

        let stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => return Err(unreachable(format!("no answer within {:?}", self.connect_timeout))),
        };
        let _ = stream.set_nodelay(true);

        Ok(Box::new(LanLink {
            stream,
            splitter: FrameSplitter::new(&self.profile),
            handshake: self.profile.session.handshake.clone(),
            probe: self
                .profile
                .session
                .probe
                .as_deref()
                .map(|body| codec::frame(&self.profile, body)),
        }))
    }
}

struct LanLink {
    stream: TcpStream,
    splitter: FrameSplitter,
    handshake: Option<Handshake>,
    /// Fully framed probe
    probe: Option<Vec<u8>>,
}

#[async_trait]
impl Link for LanLink {
    async fn handshake(&mut self) -> std::result::Result<(), ConnectivityError> {
        let Some(handshake) = &self.handshake else {
            return Ok(());
        };
        self.stream.write_all(&handshake.request).await?;

        let expected = handshake.response.len();
        let mut reply = Vec::with_capacity(expected);
        let mut chunk = [0u8; READ_CHUNK];
        while reply.len() < expected {
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ConnectivityError::Handshake(
                    "appliance closed the socket during handshake".into(),
                ));
            }
            reply.extend_from_slice(&chunk[..n]);
        }

        if !reply.starts_with(&handshake.response) {
            return Err(ConnectivityError::Handshake(format!(
                "unexpected reply {}",
                hex::encode(&reply)
            )));
        }
        // Anything after the expected reply is already frame traffic
        self.splitter.push(&reply[expected..]);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> std::result::Result<(), ConnectivityError> {
        self.stream.write_all(frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> std::result::Result<Option<Inbound>, ConnectivityError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.splitter.next_frame() {
                return Ok(Some(Inbound::Frame(frame)));
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.splitter.push(&chunk[..n]);
        }
    }

    async fn probe(&mut self) -> std::result::Result<bool, ConnectivityError> {
        match &self.probe {
            Some(frame) => {
                self.stream.write_all(frame).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

// ========== Cloud relay ==========

/// WebSocket connection to the vendor relay
#[derive(Debug, Clone)]
pub struct CloudTransport {
    url: String,
    device_id: String,
    token: Option<String>,
    connect_timeout: Duration,
}

impl CloudTransport {
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            url: config.url.clone(),
            device_id: config.device_id.clone(),
            token: config.token.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
impl Transport for CloudTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Cloud
    }

    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn open(&self) -> std::result::Result<Box<dyn Link>, ConnectivityError> {
        let unreachable = |reason: String| ConnectivityError::Unreachable {
            transport: TransportKind::Cloud,
            reason,
        };

        let ws = match timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => return Err(unreachable(format!("no answer within {:?}", self.connect_timeout))),
        };

        Ok(Box::new(CloudLink {
            ws,
            device_id: self.device_id.clone(),
            token: self.token.clone(),
        }))
    }
}

struct CloudLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    device_id: String,
    token: Option<String>,
}

impl CloudLink {
    async fn send_envelope(&mut self, msg: &RelayMessage) -> std::result::Result<(), ConnectivityError> {
        let json = serde_json::to_string(msg).map_err(|e| ConnectivityError::Relay(e.to_string()))?;
        tracing::trace!("Relay send: {}", json);
        self.ws.send(Message::Text(json)).await?;
        Ok(())
    }
}

#[async_trait]
impl Link for CloudLink {
    async fn handshake(&mut self) -> std::result::Result<(), ConnectivityError> {
        let hello = RelayMessage::hello(self.device_id.clone(), self.token.clone());
        self.send_envelope(&hello).await?;

        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(RelayMessage::Welcome { session, capabilities }) => {
                        tracing::debug!(session = %session, ?capabilities, "Relay session accepted");
                        return Ok(());
                    }
                    Ok(RelayMessage::Error { detail }) => {
                        return Err(ConnectivityError::Handshake(detail));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(ConnectivityError::Handshake(format!("malformed reply: {e}")));
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(ConnectivityError::Handshake("relay closed before welcome".into()))
    }

    async fn send(&mut self, frame: &[u8]) -> std::result::Result<(), ConnectivityError> {
        self.send_envelope(&RelayMessage::frame(frame)).await
    }

    async fn recv(&mut self) -> std::result::Result<Option<Inbound>, ConnectivityError> {
        loop {
            let Some(msg) = self.ws.next().await else {
                return Ok(None);
            };
            match msg? {
                Message::Text(text) => {
                    let envelope: RelayMessage = match serde_json::from_str(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::warn!("Dropping malformed relay message: {}", e);
                            continue;
                        }
                    };
                    match envelope.frame_bytes() {
                        Some(Ok(bytes)) => return Ok(Some(Inbound::Frame(bytes))),
                        Some(Err(e)) => {
                            tracing::warn!("Dropping relay frame with bad payload: {}", e);
                            continue;
                        }
                        None => {}
                    }
                    if let RelayMessage::Error { detail } = envelope {
                        return Err(ConnectivityError::Relay(detail));
                    }
                    return Ok(Some(Inbound::Alive));
                }
                Message::Binary(bytes) => return Ok(Some(Inbound::Frame(bytes))),
                Message::Ping(_) | Message::Pong(_) => return Ok(Some(Inbound::Alive)),
                Message::Close(_) => return Ok(None),
                Message::Frame(_) => {}
            }
        }
    }

    async fn probe(&mut self) -> std::result::Result<bool, ConnectivityError> {
        self.ws.send(Message::Ping(Vec::new())).await?;
        Ok(true)
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}
