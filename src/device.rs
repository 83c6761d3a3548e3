use crate::codec::Codec;
use crate::config::DeviceConfig;
use crate::connection::ConnectionManager;
use crate::dispatcher::{CommandDispatcher, CommandOutcome, FrameSink, PendingHandle, PendingInfo};
use crate::error::{ConnectivityError, Error, Result};
use crate::profile::DeviceProfile;
use crate::registry::ProfileRepository;
use crate::subscription::{DeviceState, StateChange, StateReceiver, StateStore, Subscription};
use crate::transport::{self, Transport};
use crate::types::{ConflictPolicy, FieldValue, Liveness, Params, SessionStatus, TransportKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Snapshot of a device's health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub model: String,
    pub liveness: Liveness,
    pub transport: Option<TransportKind>,
    pub connection_id: Option<Uuid>,
    /// Sequence number of the current state snapshot
    pub state_sequence: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub pending_commands: usize,
}

struct Inner {
    config: DeviceConfig,
    profile: Arc<DeviceProfile>,
    codec: Codec,
    connection: Arc<ConnectionManager>,
    dispatcher: CommandDispatcher,
    store: Arc<StateStore>,
    /// Taken by the router on first connect
    inbound: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let router = self
            .router
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(router) = router {
            router.abort();
        }
    }
}

/// One appliance
///
/// Combines the profile, the codec, the connection, the command dispatcher and
/// the state store behind one handle. Callers never see which transport is
/// active except through [`connectivity`](Device::connectivity).
///
/// # Example
///
/// ```no_run
/// use cremalink::{Device, DeviceConfig, ProfileRepository};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let profiles = ProfileRepository::with_builtin()?;
///     let config = DeviceConfig::local("ecam-espresso", "192.168.1.40");
///     let device = Device::from_repository(&profiles, config)?;
///
///     device.connect().await?;
///     device.send_command("power_on", &Default::default()).await?;
///
///     let mut updates = device.subscribe();
///     while let Ok(event) = updates.recv().await {
///         println!("{:?}", event);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

impl Device {
    /// Create a device using the transports named in `config`
    pub fn new(profile: Arc<DeviceProfile>, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        if config.model != profile.model {
            return Err(Error::Config(format!(
                "config is for model '{}' but profile is '{}'",
                config.model, profile.model
            )));
        }
        let transports = transport::from_config(&config, &profile)?;
        Ok(Self::with_transports(profile, config, transports))
    }

    /// Create a device with the profile for `config.model` from `profiles`
    pub fn from_repository(profiles: &ProfileRepository, config: DeviceConfig) -> Result<Self> {
        let profile = profiles.get(&config.model).ok_or_else(|| {
            Error::Config(format!("no profile loaded for model '{}'", config.model))
        })?;
        Self::new(profile, config)
    }

    /// Create a device over explicit transports, tried in the given order
    pub fn with_transports(
        profile: Arc<DeviceProfile>,
        config: DeviceConfig,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        let codec = Codec::new(profile.clone());
        let (connection, inbound) = ConnectionManager::new(transports, config.session.clone());
        let connection = Arc::new(connection);
        let sink: Arc<dyn FrameSink> = connection.clone();
        let dispatcher = CommandDispatcher::new(codec.clone(), sink, config.commands.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                profile,
                codec,
                connection,
                dispatcher,
                store: Arc::new(StateStore::new()),
                inbound: Mutex::new(Some(inbound)),
                router: Mutex::new(None),
            }),
        }
    }

    /// Connect, falling back across transports and retrying per the config
    ///
    /// Once connected the profile's refresh request, if any, is sent so the
    /// state fills without waiting for the next unsolicited frame.
    pub async fn connect(&self) -> Result<SessionStatus> {
        self.ensure_router();
        let status = self.inner.connection.connect().await?;
        tracing::info!(
            device = self.inner.config.display_name(),
            transport = ?status.transport,
            "Device connected"
        );
        if self.inner.profile.session.refresh.is_some() {
            if let Err(e) = self.refresh().await {
                tracing::warn!("Initial refresh failed: {}", e);
            }
        }
        Ok(status)
    }

    /// Drop the session and cancel in-flight commands
    pub async fn disconnect(&self) {
        let cancelled = self.inner.dispatcher.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "Cancelled in-flight commands on disconnect");
        }
        self.inner.connection.close().await;
    }

    /// Latest decoded state
    pub fn current_state(&self) -> Arc<DeviceState> {
        self.inner.store.snapshot()
    }

    /// Current value of one field
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        self.current_state().get(name).cloned()
    }

    /// Current value of a field, by name or profile alias
    pub fn resolve_alias(&self, name_or_alias: &str) -> Option<FieldValue> {
        let field = self.inner.profile.resolve(name_or_alias)?;
        self.field(&field.name)
    }

    /// Receive state changes and connectivity events
    pub fn subscribe(&self) -> StateReceiver {
        StateReceiver::new(
            self.inner.store.subscribe(),
            self.inner.connection.subscribe_events(),
        )
    }

    /// Call `callback` on every state change until the subscription is dropped
    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&StateChange) + Send + 'static,
    {
        Subscription::spawn(self.inner.store.subscribe(), callback)
    }

    /// Send a command with the configured conflict policy and wait for it
    pub async fn send_command(&self, name: &str, params: &Params) -> Result<CommandOutcome> {
        let handle = self
            .submit_command(name, params, self.inner.config.commands.conflict)
            .await?;
        Ok(handle.wait().await?)
    }

    /// Submit a command and return its pending handle
    ///
    /// Invalid parameters are rejected before the session is consulted.
    pub async fn submit_command(
        &self,
        name: &str,
        params: &Params,
        policy: ConflictPolicy,
    ) -> Result<PendingHandle> {
        self.inner.codec.encode(name, params)?;
        if !self.connectivity().liveness.is_usable() {
            return Err(ConnectivityError::NotConnected.into());
        }
        Ok(self.inner.dispatcher.submit(name, params, policy).await?)
    }

    /// Command names from the profile
    pub fn commands(&self) -> Vec<&str> {
        self.inner.profile.command_names()
    }

    /// In-flight commands, oldest first
    pub fn pending_commands(&self) -> Vec<PendingInfo> {
        self.inner.dispatcher.pending()
    }

    /// Ask the appliance for a fresh telemetry frame
    pub async fn refresh(&self) -> Result<()> {
        let body = self.inner.profile.session.refresh.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "profile '{}' declares no refresh request",
                self.inner.profile.model
            ))
        })?;
        let frame = self.inner.codec.frame(body);
        self.inner.connection.send(frame).await?;
        Ok(())
    }

    /// Connectivity-quality signal
    pub fn connectivity(&self) -> SessionStatus {
        self.inner.connection.status()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<SessionStatus> {
        self.inner.connection.subscribe_status()
    }

    pub fn health(&self) -> HealthReport {
        let status = self.connectivity();
        let state = self.current_state();
        HealthReport {
            model: self.inner.profile.model.clone(),
            liveness: status.liveness,
            transport: status.transport,
            connection_id: status.connection_id,
            state_sequence: state.sequence,
            last_update: state.updated_at,
            pending_commands: self.inner.dispatcher.pending_count(),
        }
    }

    pub fn profile(&self) -> &Arc<DeviceProfile> {
        &self.inner.profile
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Start the inbound router once, inside the runtime
    fn ensure_router(&self) {
        let mut router = self
            .inner
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if router.is_some() {
            return;
        }
        let inbound = self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(inbound) = inbound {
            *router = Some(tokio::spawn(route(
                inbound,
                self.inner.codec.clone(),
                self.inner.dispatcher.clone(),
                self.inner.store.clone(),
            )));
        }
    }
}

/// Hand each inbound frame to the dispatcher, or decode it into state
///
/// A frame that does neither is logged and dropped; the loop never stops on
/// bad input.
async fn route(
    mut inbound: mpsc::Receiver<Vec<u8>>,
    codec: Codec,
    dispatcher: CommandDispatcher,
    store: Arc<StateStore>,
) {
    while let Some(frame) = inbound.recv().await {
        if dispatcher.on_frame(&frame) {
            continue;
        }
        match codec.decode(&frame) {
            Ok(values) => {
                store.apply(values);
            }
            Err(e) => {
                tracing::warn!(error = %e, frame = %hex::encode(&frame), "Dropping undecodable frame");
            }
        }
    }
    tracing::debug!("Inbound router exiting");
}
