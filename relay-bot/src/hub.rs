//! Routes incoming channel messages to the session that is listening for them.
//!
//! A session subscribes for one (user, channel) pair. Messages from anyone
//! else, or from the same user in another channel, are not delivered.

use crate::message::ChannelMessage;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Route {
    id: u64,
    channel_id: String,
    tx: mpsc::Sender<ChannelMessage>,
}

/// Message fan-in for open sessions.
#[derive(Default)]
pub struct MessageHub {
    routes: DashMap<String, Route>,
    next_id: AtomicU64,
}

impl MessageHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for messages from `user_id` in `channel_id`.
    ///
    /// Replaces any earlier subscription for the same user. The subscription is
    /// removed when the returned value is dropped.
    pub fn subscribe(self: &Arc<Self>, user_id: &str, channel_id: &str, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes.insert(
            user_id.to_string(),
            Route {
                id,
                channel_id: channel_id.to_string(),
                tx,
            },
        );

        Subscription {
            hub: Arc::clone(self),
            user_id: user_id.to_string(),
            id,
            rx,
        }
    }

    /// Deliver a message to its session, if one is listening.
    ///
    /// Returns `true` when the message was queued.
    pub fn publish(&self, message: ChannelMessage) -> bool {
        let Some(route) = self.routes.get(&message.user_id) else {
            return false;
        };
        if route.channel_id != message.channel_id {
            return false;
        }

        match route.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(
                    user_id = %message.user_id,
                    channel_id = %message.channel_id,
                    "Session queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.routes.len()
    }

    fn unsubscribe(&self, user_id: &str, id: u64) {
        self.routes.remove_if(user_id, |_, route| route.id == id);
    }
}

/// A session's view of its incoming messages.
pub struct Subscription {
    hub: Arc<MessageHub>,
    user_id: String,
    id: u64,
    rx: mpsc::Receiver<ChannelMessage>,
}

impl Subscription {
    /// Wait for the next message. `None` once the hub stopped routing to us.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.user_id, self.id);
    }
}
