//! # Event Bus System
//!
//! Broadcasts authentication lifecycle events to any number of host observers
//! using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: [`CoreEvent`] wrapping [`AuthEvent`] and [`RouteEvent`]
//! - **EventBus**: central broadcast channel
//!
//! Emitters never depend on anyone listening: `emit` returns an error when
//! there are no subscribers and callers discard it (`let _ = bus.emit(..)`).
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(32);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Auth(AuthEvent::SignedIn {
//!     user_id: "user-123".to_string(),
//!     method: "code".to_string(),
//! }))
//! .ok();
//!
//! assert!(matches!(rx.recv().await, Ok(CoreEvent::Auth(AuthEvent::SignedIn { .. }))));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; keep reading.
//! - **`RecvError::Closed`**: every sender was dropped; treat as shutdown.
//!
//! Payloads never carry tokens, codes or passwords.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 64;

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Auth(AuthEvent),
    Route(RouteEvent),
}

/// Authentication lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AuthEvent {
    /// A sign-in attempt started (callback exchange or password sign-in).
    SigningIn {
        /// `code`, `fragment`, `query`, `existing`, or `password`
        method: String,
    },
    SignedIn {
        user_id: String,
        method: String,
    },
    SignedOut {
        user_id: Option<String>,
        /// False when the provider call failed and only local state was cleared
        remote_confirmed: bool,
    },
    SessionRefreshed {
        user_id: String,
        /// Unix epoch seconds
        expires_at: i64,
    },
    /// The redirect callback could not establish a session.
    CallbackFailed {
        callback_id: String,
        message: String,
    },
    AuthError {
        message: String,
        /// Whether a retry could succeed
        recoverable: bool,
    },
}

/// Route guard decisions worth surfacing to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum RouteEvent {
    /// A protected route was refused and the visitor sent to login.
    AccessDenied { path: String, redirect_to: String },
    /// A background refresh found the persisted session no longer valid.
    SessionRevoked { path: String },
}

/// Central event bus for broadcasting events to multiple subscribers.
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus. Subscribers falling more than `capacity`
    /// events behind receive `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Each call creates an independent receiver for all future events.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
