use crate::connection::ConnectivityEvent;
use crate::error::{ConnectivityError, Error, Result};
use crate::types::{FieldMap, FieldValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const STATE_CHANNEL_CAPACITY: usize = 128;

/// Last decoded telemetry snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    /// Value per field name
    pub values: FieldMap,
    /// Bumped on every applied frame
    pub sequence: u64,
    /// `None` until the first frame decodes
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeviceState {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    /// Whether no frame has been applied yet
    pub fn is_empty(&self) -> bool {
        self.sequence == 0
    }
}

/// One state update as delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// New values of the fields that differ from the previous snapshot
    pub changed: FieldMap,
    pub snapshot: Arc<DeviceState>,
}

/// Holds the current [`DeviceState`] and fans out changes
///
/// Snapshots are immutable; readers get an `Arc` and never block the writer
/// for longer than a pointer swap.
pub struct StateStore {
    state: RwLock<Arc<DeviceState>>,
    tx: broadcast::Sender<Arc<StateChange>>,
}

impl StateStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(Arc::new(DeviceState::default())),
            tx,
        }
    }

    pub fn snapshot(&self) -> Arc<DeviceState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the snapshot with a freshly decoded frame and notify
    pub fn apply(&self, values: FieldMap) -> Arc<StateChange> {
        let change = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let changed: FieldMap = values
                .iter()
                .filter(|(name, value)| state.values.get(*name) != Some(*value))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();

            let next = Arc::new(DeviceState {
                values,
                sequence: state.sequence + 1,
                updated_at: Some(Utc::now()),
            });
            *state = next.clone();
            Arc::new(StateChange {
                changed,
                snapshot: next,
            })
        };

        tracing::trace!(
            sequence = change.snapshot.sequence,
            changed = change.changed.len(),
            "State applied"
        );
        // No receivers is fine
        let _ = self.tx.send(change.clone());
        change
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StateChange>> {
        self.tx.subscribe()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Event delivered to a [`StateReceiver`]
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Telemetry was applied
    State(Arc<StateChange>),
    /// Session quality changed, or the connection failed or closed
    Connectivity(ConnectivityEvent),
}

/// Receiver for state and connectivity updates
pub struct StateReceiver {
    state_rx: broadcast::Receiver<Arc<StateChange>>,
    connectivity_rx: broadcast::Receiver<ConnectivityEvent>,
}

impl StateReceiver {
    pub(crate) fn new(
        state_rx: broadcast::Receiver<Arc<StateChange>>,
        connectivity_rx: broadcast::Receiver<ConnectivityEvent>,
    ) -> Self {
        Self {
            state_rx,
            connectivity_rx,
        }
    }

    /// Receive the next event
    ///
    /// A receiver that falls behind gets a `ChannelError` and then resumes with
    /// the oldest update still buffered; other receivers are unaffected.
    pub async fn recv(&mut self) -> Result<DeviceEvent> {
        tokio::select! {
            state = self.state_rx.recv() => state.map(DeviceEvent::State).map_err(recv_error),
            event = self.connectivity_rx.recv() => event.map(DeviceEvent::Connectivity).map_err(recv_error),
        }
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<DeviceEvent>> {
        match self.state_rx.try_recv() {
            Ok(change) => return Ok(Some(DeviceEvent::State(change))),
            Err(broadcast::error::TryRecvError::Empty) => {}
            Err(e) => return Err(try_recv_error(e)),
        }
        match self.connectivity_rx.try_recv() {
            Ok(event) => Ok(Some(DeviceEvent::Connectivity(event))),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(e) => Err(try_recv_error(e)),
        }
    }
}

fn recv_error(e: broadcast::error::RecvError) -> Error {
    match e {
        broadcast::error::RecvError::Closed => Error::Connectivity(ConnectivityError::Closed),
        broadcast::error::RecvError::Lagged(n) => {
            Error::ChannelError(format!("Lagged by {} messages", n))
        }
    }
}

fn try_recv_error(e: broadcast::error::TryRecvError) -> Error {
    match e {
        broadcast::error::TryRecvError::Lagged(n) => {
            Error::ChannelError(format!("Lagged by {} messages", n))
        }
        _ => Error::Connectivity(ConnectivityError::Closed),
    }
}

/// Callback subscription; stops when unsubscribed or dropped
///
/// Each callback runs on its own task, so a slow callback only delays itself.
/// A panicking callback is logged and keeps receiving later updates.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn<F>(mut rx: broadcast::Receiver<Arc<StateChange>>, mut callback: F) -> Self
    where
        F: FnMut(&StateChange) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if catch_unwind(AssertUnwindSafe(|| callback(&change))).is_err() {
                            tracing::warn!(sequence = change.snapshot.sequence, "State callback panicked");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("State callback lagged by {} updates", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { handle }
    }

    /// Whether the callback is still receiving updates
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn frame(temp: f64, state: &str) -> FieldMap {
        let mut values = FieldMap::new();
        values.insert("temperature".into(), FieldValue::Decimal(temp));
        values.insert("state".into(), FieldValue::Enum(state.into()));
        values
    }

    #[test]
    fn test_apply_replaces_and_diffs() {
        let store = StateStore::new();
        assert!(store.snapshot().is_empty());

        let first = store.apply(frame(92.5, "brewing"));
        assert_eq!(first.changed.len(), 2);
        assert_eq!(first.snapshot.sequence, 1);

        let second = store.apply(frame(92.5, "ready"));
        assert_eq!(second.snapshot.sequence, 2);
        assert_eq!(second.changed.len(), 1);
        assert_eq!(second.changed["state"], FieldValue::Enum("ready".into()));

        let mut partial = FieldMap::new();
        partial.insert("state".into(), FieldValue::Enum("ready".into()));
        let third = store.apply(partial);
        assert!(third.changed.is_empty());
        assert_eq!(store.snapshot().get("temperature"), None);
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_starve_others() {
        let store = StateStore::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        let _panicky = Subscription::spawn(store.subscribe(), |_| panic!("boom"));
        let counter = delivered.clone();
        let _counting = Subscription::spawn(store.subscribe(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..3 {
            store.apply(frame(90.0 + f64::from(i), "heating"));
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while delivered.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let store = StateStore::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let sub = Subscription::spawn(store.subscribe(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        tokio::task::yield_now().await;

        store.apply(frame(90.0, "ready"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }
}
