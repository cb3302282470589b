//! # Host Bridge Traits
//!
//! Capabilities the authentication core needs from its host but cannot provide
//! itself.
//!
//! ## Overview
//!
//! The core never talks to the network, the disk, or the wall clock directly.
//! Each of those is a trait defined here and implemented per host: a desktop
//! shell wires `bridge-desktop`, a test wires in-memory fakes.
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Async HTTP round trips to the identity provider
//!
//! ### Storage
//! - [`DurableStore`](storage::DurableStore) - Durable client key/value storage with
//!   atomic batch commits
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Wall-clock source so expiry checks are deterministic in tests
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with a descriptive error when a required capability is
//! missing:
//!
//! ```ignore
//! use core_runtime::error::Error;
//!
//! let store = builder.durable_store.ok_or_else(|| Error::CapabilityMissing {
//!     capability: "DurableStore".to_string(),
//!     message: "Inject a DurableStore implementation (desktop: SqliteDurableStore)".to_string(),
//! })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert platform errors into it and never put secrets in the message.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so they can sit behind an `Arc`
//! shared by the route guard, the callback controller, and background refresh.

pub mod error;
pub mod http;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use storage::{DurableStore, MemoryStore, WriteBatch, WriteOp};
pub use time::{Clock, ConsoleLogger, FixedClock, LogEntry, LogLevel, LoggerSink, SystemClock};
