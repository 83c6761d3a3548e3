use crate::codec::Codec;
use crate::config::DispatchConfig;
use crate::error::{CommandError, ConnectivityError, EncodeError};
use crate::profile::AckPattern;
use crate::types::{ConflictPolicy, CorrelationId, Params};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Where encoded command frames go
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ConnectivityError>;
}

/// A command that completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub id: CorrelationId,
    pub command: String,
    /// Transmissions made, retries included
    pub attempts: u32,
    /// The acknowledgement frame, for commands that expect one
    pub ack: Option<Vec<u8>>,
}

/// Read-only view of an in-flight command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: CorrelationId,
    pub command: String,
    pub targets: Vec<String>,
    pub attempts: u32,
    /// When the current attempt times out
    pub deadline: Instant,
}

type Completion = Result<CommandOutcome, CommandError>;

struct PendingCommand {
    id: CorrelationId,
    command: String,
    targets: Vec<String>,
    deadline: Instant,
    attempts: u32,
    sequence: Option<u8>,
    ack: Option<AckPattern>,
    result_tx: oneshot::Sender<Completion>,
    /// Stops the retry driver
    cancel: CancellationToken,
    /// Fired on removal; queued submissions wait on it
    done: CancellationToken,
}

impl PendingCommand {
    fn info(&self) -> PendingInfo {
        PendingInfo {
            id: self.id,
            command: self.command.clone(),
            targets: self.targets.clone(),
            attempts: self.attempts,
            deadline: self.deadline,
        }
    }

    fn conflicts_with(&self, targets: &[String]) -> bool {
        self.targets.iter().any(|t| targets.contains(t))
    }

    fn resolve(self, result: Completion) {
        self.cancel.cancel();
        self.done.cancel();
        let _ = self.result_tx.send(result);
    }
}

type Table = BTreeMap<CorrelationId, PendingCommand>;

/// A queued submission that has not claimed its fields yet
struct Waiter {
    targets: Vec<String>,
    /// Fired once the waiter leaves the queue
    left: CancellationToken,
}

/// Queued submissions keyed by id, so iteration is submission order
type WaitQueue = BTreeMap<CorrelationId, Waiter>;

struct Inner {
    codec: Codec,
    sink: Arc<dyn FrameSink>,
    config: DispatchConfig,
    /// Lock before `queue` when both are needed
    table: Mutex<Table>,
    queue: Mutex<WaitQueue>,
    next_id: AtomicU64,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, WaitQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove an entry and resolve its handle; `false` if it was already gone
    fn finish(&self, id: CorrelationId, result: impl FnOnce(&PendingCommand) -> Completion) -> bool {
        let Some(pending) = self.table().remove(&id) else {
            return false;
        };
        let result = result(&pending);
        pending.resolve(result);
        true
    }

    fn cancel(&self, id: CorrelationId) -> bool {
        let cancelled = self.finish(id, |p| {
            Err(CommandError::Cancelled {
                command: p.command.clone(),
            })
        });
        if cancelled {
            tracing::debug!(correlation_id = id, "Command cancelled");
        }
        cancelled
    }
}

/// Turns command intents into frames and correlates their acknowledgements
///
/// At most one in-flight command targets any given field. Acknowledgements
/// are matched by the profile's sequence byte when it has one, and otherwise
/// in submission order.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Inner>,
}

impl CommandDispatcher {
    pub fn new(codec: Codec, sink: Arc<dyn FrameSink>, config: DispatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                codec,
                sink,
                config,
                table: Mutex::new(BTreeMap::new()),
                queue: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Encode and send a command
    ///
    /// Parameter errors are returned before anything is queued or sent. With
    /// [`ConflictPolicy::Queue`] this waits until no other command targets the
    /// same fields, and queued commands on a field go out in submission order.
    /// With [`ConflictPolicy::Supersede`] the conflicting in-flight commands
    /// are resolved as superseded and the new one skips the queue.
    pub async fn submit(
        &self,
        command: &str,
        params: &Params,
        policy: ConflictPolicy,
    ) -> Result<PendingHandle, CommandError> {
        let inner = &self.inner;
        let profile = inner.codec.profile().clone();
        let descriptor = profile
            .command(command)
            .ok_or_else(|| EncodeError::UnknownCommand(command.to_string()))?;

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sequence = profile.framing.sequence_offset.map(|_| id as u8);
        let frame = inner.codec.encode_sequenced(descriptor, params, sequence)?;
        let targets = descriptor.targets.clone();

        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let mut place: Option<QueuePlace> = None;
        loop {
            let blocker = {
                let mut table = inner.table();
                let mut queue = inner.queue();
                let conflicting: Vec<CorrelationId> = table
                    .values()
                    .filter(|p| p.conflicts_with(&targets))
                    .map(|p| p.id)
                    .collect();

                let blocker = match policy {
                    ConflictPolicy::Queue => conflicting
                        .first()
                        .and_then(|other| table.get(other))
                        .map(|p| p.done.clone())
                        .or_else(|| {
                            queue
                                .range(..id)
                                .find(|(_, w)| w.targets.iter().any(|t| targets.contains(t)))
                                .map(|(_, w)| w.left.clone())
                        }),
                    ConflictPolicy::Supersede => None,
                };

                match blocker {
                    Some(token) => {
                        if place.is_none() {
                            let left = CancellationToken::new();
                            queue.insert(
                                id,
                                Waiter {
                                    targets: targets.clone(),
                                    left: left.clone(),
                                },
                            );
                            place = Some(QueuePlace {
                                inner: inner.clone(),
                                id,
                                left,
                            });
                        }
                        token
                    }
                    None => {
                        queue.remove(&id);
                        for other in conflicting {
                            if let Some(pending) = table.remove(&other) {
                                tracing::info!(correlation_id = other, by = id, command = %pending.command, "Command superseded");
                                let command = pending.command.clone();
                                pending.resolve(Err(CommandError::Superseded { command, by: id }));
                            }
                        }
                        table.insert(
                            id,
                            PendingCommand {
                                id,
                                command: descriptor.name.clone(),
                                targets: targets.clone(),
                                deadline: Instant::now() + inner.config.ack_timeout(),
                                attempts: 0,
                                sequence,
                                ack: descriptor.ack.clone(),
                                result_tx,
                                cancel: cancel.clone(),
                                done: CancellationToken::new(),
                            },
                        );
                        break;
                    }
                }
            };

            tracing::debug!(correlation_id = id, command, "Queued behind another command");
            blocker.cancelled().await;
        }
        // Wakes the next waiter on these fields
        drop(place);

        tracing::info!(correlation_id = id, command, "Submitting command");
        tokio::spawn(drive(
            inner.clone(),
            id,
            frame,
            descriptor.ack.is_some(),
            cancel.clone(),
        ));

        Ok(PendingHandle {
            id,
            command: descriptor.name.clone(),
            result_rx,
            inner: inner.clone(),
        })
    }

    /// Offer an inbound frame; returns `true` if it acknowledged a command
    pub fn on_frame(&self, frame: &[u8]) -> bool {
        let sequence = self.inner.codec.sequence_of(frame);
        let matched = {
            let table = self.inner.table();
            table
                .values()
                .filter(|p| p.attempts > 0)
                .find(|p| {
                    p.ack.as_ref().is_some_and(|ack| ack.matches(frame))
                        && (p.sequence.is_none() || p.sequence == sequence)
                })
                .map(|p| p.id)
        };

        let Some(id) = matched else {
            return false;
        };
        let ack = frame.to_vec();
        let resolved = self.inner.finish(id, |p| {
            Ok(CommandOutcome {
                id: p.id,
                command: p.command.clone(),
                attempts: p.attempts,
                ack: Some(ack),
            })
        });
        if resolved {
            tracing::debug!(correlation_id = id, "Command acknowledged");
        }
        resolved
    }

    /// Cancel one in-flight command
    pub fn cancel(&self, id: CorrelationId) -> bool {
        self.inner.cancel(id)
    }

    /// Cancel every in-flight command
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.inner.table().keys().copied().collect();
        ids.into_iter().filter(|id| self.inner.cancel(*id)).count()
    }

    /// In-flight commands, oldest first
    pub fn pending(&self) -> Vec<PendingInfo> {
        self.inner.table().values().map(PendingCommand::info).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table().len()
    }
}

/// A submission's spot in the wait queue, released on drop
///
/// Dropping also covers a submit future that is abandoned while waiting.
struct QueuePlace {
    inner: Arc<Inner>,
    id: CorrelationId,
    left: CancellationToken,
}

impl Drop for QueuePlace {
    fn drop(&mut self) {
        self.inner.queue().remove(&self.id);
        self.left.cancel();
    }
}

/// Send, wait for the ack deadline, resend up to the retry bound
async fn drive(
    inner: Arc<Inner>,
    id: CorrelationId,
    frame: Vec<u8>,
    expects_ack: bool,
    cancel: CancellationToken,
) {
    let ack_timeout = inner.config.ack_timeout();
    let max_attempts = inner.config.max_retries.saturating_add(1);
    let mut attempts = 0;
    let mut send_error = None;

    while attempts < max_attempts {
        attempts += 1;
        {
            let mut table = inner.table();
            let Some(pending) = table.get_mut(&id) else {
                return;
            };
            pending.attempts = attempts;
            pending.deadline = Instant::now() + ack_timeout;
        }
        if attempts > 1 {
            tracing::debug!(correlation_id = id, attempt = attempts, "Retrying command");
        }

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = inner.sink.send_frame(frame.clone()) => sent,
        };
        match sent {
            Ok(()) if !expects_ack => {
                inner.finish(id, |p| {
                    Ok(CommandOutcome {
                        id,
                        command: p.command.clone(),
                        attempts,
                        ack: None,
                    })
                });
                return;
            }
            Ok(()) => send_error = None,
            Err(e) => {
                tracing::warn!(correlation_id = id, error = %e, "Command send failed");
                send_error = Some(e);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = sleep(ack_timeout) => {}
        }
    }

    let finished = inner.finish(id, |p| {
        Err(match send_error {
            Some(e) => CommandError::Connectivity(e),
            None => CommandError::Timeout {
                command: p.command.clone(),
                attempts,
            },
        })
    });
    if finished {
        tracing::warn!(correlation_id = id, attempts, "Command failed");
    }
}

/// Handle to a submitted command
pub struct PendingHandle {
    id: CorrelationId,
    command: String,
    result_rx: oneshot::Receiver<Completion>,
    inner: Arc<Inner>,
}

impl PendingHandle {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Cancel the command; `false` if it already completed
    pub fn cancel(&self) -> bool {
        self.inner.cancel(self.id)
    }

    /// Wait for the command to complete
    pub async fn wait(self) -> Result<CommandOutcome, CommandError> {
        let command = self.command;
        self.result_rx
            .await
            .unwrap_or(Err(CommandError::Cancelled { command }))
    }
}

impl std::fmt::Debug for PendingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandle")
            .field("id", &self.id)
            .field("command", &self.command)
            .finish()
    }
}
