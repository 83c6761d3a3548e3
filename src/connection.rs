use crate::config::SessionConfig;
use crate::dispatcher::FrameSink;
use crate::error::ConnectivityError;
use crate::transport::{Inbound, Link, Transport};
use crate::types::{Liveness, SessionStatus, TransportKind};
use async_trait::async_trait;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const INBOUND_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Connectivity notifications for subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectivityEvent {
    /// Liveness, transport or session id changed
    StatusChanged(SessionStatus),
    /// Retry budget exhausted; no further automatic attempts
    Failed(ConnectivityError),
    /// `close()` was called
    Closed,
}

/// A frame waiting for the session writer
struct Outbound {
    frame: Vec<u8>,
    done: oneshot::Sender<Result<(), ConnectivityError>>,
}

/// State shared between the manager handle and its supervisor task
struct Shared {
    transports: Vec<Arc<dyn Transport>>,
    config: SessionConfig,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: broadcast::Sender<ConnectivityEvent>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    /// Writer queue of the live session, if any
    outbound: std::sync::Mutex<Option<mpsc::Sender<Outbound>>>,
}

impl Shared {
    fn set_status(&self, status: SessionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            tracing::debug!(liveness = ?status.liveness, transport = ?status.transport, "Session status changed");
            let _ = self.events_tx.send(ConnectivityEvent::StatusChanged(status));
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::Sender<Outbound>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    fn outbound(&self) -> Option<mpsc::Sender<Outbound>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the one live session to an appliance
///
/// Transports are tried in order on every attempt. While a session is up the
/// manager probes it, flags it degraded when probes go unanswered, and drops
/// it when they keep going unanswered. Lost sessions are re-established with
/// exponential backoff until the retry budget runs out or [`close`] is
/// called.
///
/// Frames received on the session are delivered on the channel returned by
/// [`ConnectionManager::new`]. Nothing above this type sees a socket.
///
/// [`close`]: ConnectionManager::close
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    /// Create a manager and the receiver for inbound frames
    pub fn new(
        transports: Vec<Arc<dyn Transport>>,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (status_tx, _) = watch::channel(SessionStatus::disconnected());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let manager = Self {
            shared: Arc::new(Shared {
                transports,
                config,
                status_tx,
                events_tx,
                inbound_tx,
                outbound: std::sync::Mutex::new(None),
            }),
            supervisor: Mutex::new(None),
        };
        (manager, inbound_rx)
    }

    /// Current session snapshot
    pub fn status(&self) -> SessionStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Watch the session snapshot
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Subscribe to connectivity events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Establish the session
    ///
    /// Starts the supervisor if it is not running and waits until the session
    /// is usable. Failed attempts are retried with backoff; this returns an
    /// error only once the retry budget is exhausted or the manager is closed.
    /// Dropping the returned future does not stop the supervisor.
    pub async fn connect(&self) -> Result<SessionStatus, ConnectivityError> {
        if self.shared.transports.is_empty() {
            return Err(ConnectivityError::NoTransport);
        }

        // Subscribe before spawning so no transition is missed
        let mut events = self.shared.events_tx.subscribe();
        let mut status_rx = self.shared.status_tx.subscribe();

        {
            let mut supervisor = self.supervisor.lock().await;
            let running = supervisor
                .as_ref()
                .is_some_and(|s| !s.handle.is_finished());
            if !running {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(supervise(self.shared.clone(), cancel.clone()));
                *supervisor = Some(Supervisor { cancel, handle });
            }
        }

        loop {
            let status = status_rx.borrow_and_update().clone();
            if status.liveness.is_usable() {
                return Ok(status);
            }

            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Err(ConnectivityError::Closed);
                    }
                }
                event = events.recv() => match event {
                    Ok(ConnectivityEvent::Failed(error)) => return Err(error),
                    Ok(ConnectivityEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(ConnectivityError::Closed);
                    }
                    Ok(ConnectivityEvent::StatusChanged(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
            }
        }
    }

    /// Queue a frame on the live session and wait until it is written
    ///
    /// Writes are serialized per session, in call order.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectivityError> {
        let tx = self.shared.outbound().ok_or(ConnectivityError::NotConnected)?;
        let (done, rx) = oneshot::channel();
        tx.send(Outbound { frame, done })
            .await
            .map_err(|_| ConnectivityError::NotConnected)?;
        rx.await.map_err(|_| ConnectivityError::NotConnected)?
    }

    /// Stop the supervisor and drop the session
    pub async fn close(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(Supervisor { cancel, handle }) = supervisor {
            cancel.cancel();
            let abort = handle.abort_handle();
            if timeout(CLOSE_GRACE, handle).await.is_err() {
                tracing::warn!("Connection supervisor did not stop in time, aborting");
                abort.abort();
            }
        }
        self.shared.set_outbound(None);
        self.shared.set_status(SessionStatus::disconnected());
        let _ = self.shared.events_tx.send(ConnectivityEvent::Closed);
        tracing::info!("Connection closed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.cancel.cancel();
        }
    }
}

#[async_trait]
impl FrameSink for ConnectionManager {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ConnectivityError> {
        self.send(frame).await
    }
}

// ========== Supervisor task ==========

enum SessionEnd {
    Cancelled,
    Lost(ConnectivityError),
}

/// Connect, run the session, back off, repeat
async fn supervise(shared: Arc<Shared>, cancel: CancellationToken) {
    let reconnect = shared.config.reconnect.clone();
    let mut failures: u32 = 0;

    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = open_session(&shared) => result,
        };

        let delay = match attempt {
            Ok((link, kind)) => {
                failures = 0;
                match run_session(&shared, link, kind, &cancel).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(error) => {
                        tracing::warn!(transport = %kind, error = %error, "Session lost");
                        shared.set_status(SessionStatus::disconnected());
                        reconnect.initial_delay()
                    }
                }
            }
            Err(error) => {
                failures += 1;
                shared.set_status(SessionStatus::disconnected());
                tracing::warn!(attempt = failures, error = %error, "Connection attempt failed");

                if let Some(budget) = reconnect.retry_budget {
                    if failures >= budget {
                        tracing::error!(attempts = failures, "Retry budget exhausted, giving up");
                        let _ = shared.events_tx.send(ConnectivityEvent::Failed(
                            ConnectivityError::RetriesExhausted {
                                attempts: failures,
                                last: error.to_string(),
                            },
                        ));
                        return;
                    }
                }
                reconnect.backoff(failures - 1)
            }
        };

        tracing::info!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }

    shared.set_outbound(None);
    shared.set_status(SessionStatus::disconnected());
    tracing::debug!("Connection supervisor exiting");
}

/// Try each transport in order; first one through the handshake wins
async fn open_session(
    shared: &Shared,
) -> Result<(Box<dyn Link>, TransportKind), ConnectivityError> {
    let mut last = ConnectivityError::NoTransport;

    for transport in &shared.transports {
        let kind = transport.kind();
        shared.set_status(SessionStatus {
            liveness: Liveness::Handshaking,
            transport: Some(kind),
            connection_id: None,
        });
        tracing::info!(transport = %kind, endpoint = %transport.describe(), "Connecting");

        let mut link = match transport.open().await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(transport = %kind, error = %e, "Transport unavailable");
                last = e;
                continue;
            }
        };

        match timeout(shared.config.handshake_timeout(), link.handshake()).await {
            Ok(Ok(())) => return Ok((link, kind)),
            Ok(Err(e)) => {
                tracing::warn!(transport = %kind, error = %e, "Handshake failed");
                last = e;
            }
            Err(_) => {
                tracing::warn!(transport = %kind, "Handshake timed out");
                last = ConnectivityError::Handshake("timed out".into());
            }
        }
        link.close().await;
    }

    Err(last)
}

/// Pump one session until it is lost or cancelled
async fn run_session(
    shared: &Shared,
    mut link: Box<dyn Link>,
    kind: TransportKind,
    cancel: &CancellationToken,
) -> SessionEnd {
    let connection_id = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CHANNEL_CAPACITY);
    shared.set_outbound(Some(outbound_tx));

    let connected = SessionStatus {
        liveness: Liveness::Connected,
        transport: Some(kind),
        connection_id: Some(connection_id),
    };
    shared.set_status(connected.clone());
    tracing::info!(transport = %kind, %connection_id, "Session established");

    let period = shared.config.keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_reply = false;
    let mut missed: u32 = 0;

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break SessionEnd::Cancelled,
            inbound = link.recv() => match inbound {
                Ok(Some(item)) => {
                    awaiting_reply = false;
                    if missed > 0 {
                        missed = 0;
                        shared.set_status(connected.clone());
                    }
                    if let Inbound::Frame(frame) = item {
                        tracing::trace!(len = frame.len(), "Frame received");
                        if let Err(mpsc::error::TrySendError::Full(_)) = shared.inbound_tx.try_send(frame) {
                            tracing::warn!("Inbound queue full, dropping frame");
                        }
                    }
                }
                Ok(None) => break SessionEnd::Lost(ConnectivityError::Closed),
                Err(e) => break SessionEnd::Lost(e),
            },
            Some(out) = outbound_rx.recv() => {
                let result = link.send(&out.frame).await;
                let failure = result.as_ref().err().cloned();
                let _ = out.done.send(result);
                if let Some(e) = failure {
                    break SessionEnd::Lost(e);
                }
            }
            _ = keepalive.tick() => {
                if awaiting_reply {
                    missed += 1;
                    if missed >= shared.config.disconnect_after {
                        break SessionEnd::Lost(ConnectivityError::Timeout);
                    }
                    if missed >= shared.config.degraded_after {
                        tracing::warn!(transport = %kind, missed, "Keepalive unanswered, session degraded");
                        shared.set_status(SessionStatus {
                            liveness: Liveness::Degraded,
                            ..connected.clone()
                        });
                    }
                }
                match link.probe().await {
                    Ok(sent) => awaiting_reply = sent,
                    Err(e) => break SessionEnd::Lost(e),
                }
            }
        }
    };

    // Fail queued writes rather than leaving their callers waiting
    shared.set_outbound(None);
    outbound_rx.close();
    while let Ok(out) = outbound_rx.try_recv() {
        let _ = out.done.send(Err(ConnectivityError::NotConnected));
    }
    link.close().await;
    end
}
