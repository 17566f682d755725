#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `notify_bus` is the process-wide registry of observer channels behind the
//! `/ws` push channel: file-change events, command output chunks, and
//! command-completion events are published here and fanned out to every
//! currently connected observer.
//!
//! # Design
//!
//! The bus is a thin wrapper around [`tokio::sync::broadcast`]. Publishing is
//! fire-and-forget: a [`tokio::sync::broadcast::Sender`] already drops a
//! message for any receiver that cannot keep up rather than blocking the
//! publisher, which gives best-effort delivery for free — no additional
//! retry or disconnection logic is needed on top of it.
//!
//! # Invariants
//!
//! - A publication attempt reaches every observer registered at the moment
//!   of publication; it is never queued for observers that subscribe later.
//! - `command_output` messages for a single command id are published in
//!   append order; the `command_completed` message for that id is always
//!   the last one published for it.
//!
//! # Errors
//!
//! Publishing never fails from the bus's point of view: with no observers
//! registered, a broadcast send error is swallowed and logged at `trace`
//! level rather than surfaced, since "nobody is listening" is not a failure
//! of the bus.
//!
//! # See also
//!
//! - [`exec`] for the command lifecycle that produces `command_output` and
//!   `command_completed` events.
//! - [`fileservice`] for the mutations that produce `file_changed` events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the broadcast channel: how many not-yet-delivered messages a
/// lagging observer may fall behind by before older ones are dropped for it.
const CHANNEL_CAPACITY: usize = 1024;

/// A message pushed to observers over the notification bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A file was created, written, or patched.
    FileChanged {
        /// Server-local path that changed.
        path: String,
        /// Short description of the mutation (`"write"`, `"delta"`, `"patch"`, ...).
        action: String,
    },
    /// One line of output from a running command.
    CommandOutput {
        /// Command this output belongs to.
        command_id: String,
        /// Which stream the line came from.
        stream: Stream,
        /// The line content.
        content: String,
    },
    /// A command reached a terminal state.
    CommandCompleted {
        /// Command that completed.
        command_id: String,
        /// Terminal state reached.
        status: String,
        /// Process exit code, if one was observed.
        exit_code: Option<i32>,
    },
    /// Reply to a client-initiated liveness probe.
    Pong,
}

/// Which stream a [`Message::CommandOutput`] line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// The process-wide bus. Cheap to clone; clones share the same underlying
/// broadcast channel.
#[derive(Debug, Clone)]
pub struct NotifyBus {
    sender: broadcast::Sender<Message>,
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyBus {
    /// Creates a new, empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Registers a new observer and returns its receiving half.
    ///
    /// The observer only sees messages published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }

    /// Publishes `message` to every currently registered observer.
    ///
    /// Best-effort: if there are no observers, or a lagging observer has
    /// fallen behind, the failure is swallowed rather than propagated.
    pub fn publish(&self, message: Message) {
        if self.sender.send(message).is_err() {
            tracing::trace!("notification published with no active observers");
        }
    }

    /// Number of observers currently registered.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_registered_before_publish_receives_it() {
        let bus = NotifyBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Message::Pong);

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Message::Pong));
    }

    #[tokio::test]
    async fn publish_with_no_observers_does_not_panic() {
        let bus = NotifyBus::new();
        bus.publish(Message::FileChanged {
            path: "a.txt".to_owned(),
            action: "write".to_owned(),
        });
        assert_eq!(bus.observer_count(), 0);
    }

    #[tokio::test]
    async fn multiple_observers_each_receive_the_message() {
        let bus = NotifyBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Message::CommandCompleted {
            command_id: "c1".to_owned(),
            status: "completed".to_owned(),
            exit_code: Some(0),
        });

        assert!(matches!(
            a.recv().await.unwrap(),
            Message::CommandCompleted { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            Message::CommandCompleted { .. }
        ));
    }

    #[test]
    fn command_output_serialises_with_tagged_shape() {
        let msg = Message::CommandOutput {
            command_id: "c1".to_owned(),
            stream: Stream::Stderr,
            content: "oops".to_owned(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "command_output");
        assert_eq!(json["command_id"], "c1");
        assert_eq!(json["stream"], "stderr");
    }
}
