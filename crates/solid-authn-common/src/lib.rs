//! Transport and persistence plumbing shared by the `solid-authn` crates.
//!
//! Nothing in here knows about OpenID Connect: [`http_client::HttpClient`] moves raw
//! `http` requests and responses, and [`storage::Storage`] persists opaque strings.

#![warn(missing_docs)]

/// Transport error types
pub mod error;
/// Minimal HTTP client abstraction
pub mod http_client;
/// Key/value storage backends
pub mod storage;

pub use error::TransportError;
pub use http_client::{HttpClient, ResponseUrl};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use smol_str;
pub use url;
