//! # Desktop Bridge Implementations
//!
//! Default implementations of the host bridge traits for desktop shells
//! (macOS, Windows, Linux).
//!
//! - `HttpClient` using `reqwest` with rustls
//! - `DurableStore` using a SQLite key/value table
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, SqliteDurableStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let http = ReqwestHttpClient::new()?;
//!     let store = SqliteDurableStore::new(data_dir.join("auth.db")).await?;
//!     // Hand both to `AuthConfig::builder()`
//!     Ok(())
//! }
//! ```

mod http;
mod store;

pub use http::ReqwestHttpClient;
pub use store::SqliteDurableStore;
