//! # Core Runtime Module
//!
//! Runtime infrastructure shared by the authentication core:
//! - Logging and tracing setup
//! - Configuration ([`config::AuthConfig`])
//! - Event bus for auth lifecycle notifications

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
