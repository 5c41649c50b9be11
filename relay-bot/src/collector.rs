//! One bounded chat session.
//!
//! The collector reads the admitted user's messages from their subscription,
//! relays each one to the completion backend and posts the answer. It stops on
//! an exit keyword or when the session deadline passes. The deadline is fixed
//! at start; new messages do not extend it.
//!
//! Backend failures are reported to the user and the session carries on.

use crate::completion::CompletionClient;
use crate::hub::Subscription;
use crate::message::{ChannelMessage, MessageRef, OutgoingMessage};
use crate::session::SessionGuard;
use crate::traits::Channel;
use relay_common::security::Credential;
use relay_common::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sent when the user ends the session.
pub const EXIT_ACK: &str = "Chat session ended. Use `/chat` to start a new one.";

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The user sent an exit keyword
    Exit,
    /// The session deadline passed
    Timeout,
    /// The message source shut down
    Closed,
}

impl EndReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::Timeout => "timeout",
            Self::Closed => "closed",
        }
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub reason: EndReason,
    /// Messages taken from the user, including the exit keyword
    pub messages_processed: usize,
}

/// Who the session is for and what it sends to the backend.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub user_name: String,
    pub channel_id: String,
    /// System prompt used for every exchange
    pub instruction: String,
    pub credential: Credential,
}

/// Text of the notice posted when a session times out.
pub fn timeout_notice(user_name: &str) -> String {
    format!("Chat session with {user_name} has ended due to inactivity.")
}

/// Withdraws the session announcement after a delay.
///
/// Dropping or finishing the timer cancels the pending task, so no callback
/// outlives its session.
pub struct AnnouncementTimer {
    handle: JoinHandle<()>,
    fired: Arc<AtomicBool>,
    channel: Arc<dyn Channel>,
    message: MessageRef,
}

impl AnnouncementTimer {
    /// Schedule `message` to be withdrawn after `ttl`.
    pub fn start(channel: Arc<dyn Channel>, message: MessageRef, ttl: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));

        let task_fired = Arc::clone(&fired);
        let task_channel = Arc::clone(&channel);
        let task_message = message.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if !task_fired.swap(true, Ordering::SeqCst) {
                if let Err(e) = task_channel.withdraw(&task_message).await {
                    tracing::debug!(error = %e, "Failed to withdraw session announcement");
                }
            }
        });

        Self {
            handle,
            fired,
            channel,
            message,
        }
    }

    /// Cancel the timer, withdrawing the announcement now if it is still up.
    ///
    /// When the timer has already fired, its withdrawal may still be in
    /// flight; that request is awaited rather than cut short.
    pub async fn finish(mut self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            if let Err(e) = (&mut self.handle).await {
                tracing::debug!(error = %e, "Announcement timer task failed");
            }
            return;
        }

        self.handle.abort();
        if let Err(e) = self.channel.withdraw(&self.message).await {
            tracing::debug!(error = %e, "Failed to withdraw session announcement");
        }
    }
}

impl Drop for AnnouncementTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs one chat session to completion.
pub struct ExchangeCollector {
    context: SessionContext,
    subscription: Subscription,
    guard: SessionGuard,
    channel: Arc<dyn Channel>,
    completion: Arc<dyn CompletionClient>,
    timeout: Duration,
    announcement: Option<AnnouncementTimer>,
}

impl ExchangeCollector {
    pub fn new(
        context: SessionContext,
        subscription: Subscription,
        guard: SessionGuard,
        channel: Arc<dyn Channel>,
        completion: Arc<dyn CompletionClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            context,
            subscription,
            guard,
            channel,
            completion,
            timeout,
            announcement: None,
        }
    }

    /// Attach the announcement timer so it ends with the session.
    pub fn with_announcement(mut self, timer: AnnouncementTimer) -> Self {
        self.announcement = Some(timer);
        self
    }

    /// Collect and relay messages until the session ends.
    pub async fn run(self) -> SessionSummary {
        let Self {
            context,
            mut subscription,
            guard,
            channel,
            completion,
            timeout,
            announcement,
        } = self;

        let deadline = Instant::now() + timeout;
        let mut messages_processed = 0usize;

        tracing::info!(
            user_id = %context.user_id,
            channel_id = %context.channel_id,
            timeout_secs = timeout.as_secs(),
            "Chat session started"
        );

        let reason = loop {
            let message = tokio::select! {
                received = subscription.recv() => match received {
                    Some(message) => message,
                    None => break EndReason::Closed,
                },
                _ = tokio::time::sleep_until(deadline) => break EndReason::Timeout,
            };
            messages_processed += 1;

            if message.is_exit_keyword() {
                reply(channel.as_ref(), &message, EXIT_ACK.to_string()).await;
                break EndReason::Exit;
            }

            let outcome = tokio::select! {
                outcome = completion.complete(&context.instruction, &message.text, &context.credential) => outcome,
                _ = tokio::time::sleep_until(deadline) => break EndReason::Timeout,
            };

            let text = match outcome {
                Ok(content) if !content.trim().is_empty() => content,
                Ok(_) => Error::BackendParse("empty completion".into()).user_message(),
                Err(e) => {
                    tracing::warn!(
                        user_id = %context.user_id,
                        error = %e,
                        "Exchange failed, session continues"
                    );
                    e.user_message()
                }
            };
            reply(channel.as_ref(), &message, text).await;
        };

        // Release everything tied to the session before the final notice.
        drop(subscription);
        drop(guard);
        if let Some(timer) = announcement {
            timer.finish().await;
        }

        if reason == EndReason::Timeout {
            let notice = OutgoingMessage::new(&context.channel_id, timeout_notice(&context.user_name));
            if let Err(e) = channel.send(notice).await {
                tracing::warn!(user_id = %context.user_id, error = %e, "Failed to post timeout notice");
            }
        }

        tracing::info!(
            user_id = %context.user_id,
            channel_id = %context.channel_id,
            reason = reason.as_str(),
            messages_processed,
            "Chat session ended"
        );

        SessionSummary {
            reason,
            messages_processed,
        }
    }
}

async fn reply(channel: &dyn Channel, to: &ChannelMessage, text: String) {
    let message = OutgoingMessage::new(&to.channel_id, text).replying_to(&to.id);
    if let Err(e) = channel.send(message).await {
        tracing::warn!(user_id = %to.user_id, error = %e, "Failed to deliver reply");
    }
}
