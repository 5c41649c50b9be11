//! Routes inbound platform events.
//!
//! Channel messages go straight to the hub. Commands go through a serial queue
//! per user, so one user's commands apply in arrival order while different
//! users are handled concurrently.

use crate::message::{InboundEvent, Interaction};
use crate::relay::Relay;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_common::logging::generate_trace_id;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::Instrument;

/// How long an idle per-user worker lives before it is retired.
const WORKER_IDLE: Duration = Duration::from_secs(120);

/// Answer to a command that did not fit in the user's queue.
pub const QUEUE_FULL: &str =
    "You have too many pending commands. Wait for them to finish and try again.";

struct Worker {
    id: u64,
    tx: mpsc::Sender<Interaction>,
}

/// Fans inbound events out to the relay.
pub struct Dispatcher {
    relay: Arc<Relay>,
    workers: DashMap<String, Worker>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(relay: Arc<Relay>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            relay,
            workers: DashMap::new(),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        })
    }

    /// Route a single event.
    pub fn dispatch(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => {
                if !self.relay.hub().publish(message) {
                    tracing::trace!("Message outside any session ignored");
                }
            }
            InboundEvent::Command(interaction) => self.enqueue(interaction),
        }
    }

    /// Number of live per-user workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    // Sends happen under the map entry lock, so a worker that removes its own
    // entry while its queue is empty cannot miss a command.
    fn enqueue(self: &Arc<Self>, interaction: Interaction) {
        let user_id = interaction.user_id.clone();

        match self.workers.entry(user_id.clone()) {
            Entry::Occupied(mut slot) => {
                let sent = slot.get().tx.try_send(interaction);
                match sent {
                    Ok(()) => {}
                    Err(TrySendError::Full(rejected)) => {
                        tracing::warn!(
                            user_id = %rejected.user_id,
                            command = %rejected.command,
                            "Command queue full, rejecting command"
                        );
                        let relay = Arc::clone(&self.relay);
                        tokio::spawn(async move { relay.reply(&rejected, QUEUE_FULL.to_string()).await });
                    }
                    Err(TrySendError::Closed(interaction)) => {
                        let worker = self.spawn_worker(user_id, interaction);
                        slot.insert(worker);
                    }
                }
            }
            Entry::Vacant(slot) => {
                let worker = self.spawn_worker(user_id, interaction);
                slot.insert(worker);
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, user_id: String, first: Interaction) -> Worker {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel(self.capacity);
        // Fresh channel with room for at least one item.
        let _ = tx.try_send(first);

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!(user_id = %user_id, "Command worker started");
            loop {
                match tokio::time::timeout(WORKER_IDLE, rx.recv()).await {
                    Ok(Some(interaction)) => {
                        let span = tracing::info_span!(
                            "command",
                            trace_id = %generate_trace_id(),
                            user_id = %interaction.user_id
                        );
                        // Sessions run detached; the queue moves on once the
                        // chat command has been answered.
                        let _ = dispatcher.relay.handle(&interaction).instrument(span).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let retired = dispatcher
                            .workers
                            .remove_if(&user_id, |_, w| w.id == id && rx.is_empty())
                            .is_some();
                        if retired {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(user_id = %user_id, "Command worker stopped");
        });

        Worker { id, tx }
    }

    /// Start a background task that dispatches events from `rx`.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<InboundEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Event dispatcher started");

            while let Some(event) = rx.recv().await {
                self.dispatch(event);
            }

            tracing::info!("Event dispatcher stopped");
        })
    }
}
