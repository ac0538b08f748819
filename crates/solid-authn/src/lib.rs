//! Solid-OIDC authentication client.
//!
//! Logs a user in against a Solid-OIDC identity provider with the authorization code flow
//! (PKCE, optionally DPoP-bound), completes the redirect back, and hands out an
//! [`fetch::AuthenticatedFetch`] that attaches credentials to every request and keeps
//! them fresh.
//!
//! The entry point is [`client::ClientAuthentication`]. The lower-level pieces are public
//! for hosts that want to assemble their own flow.

pub mod client;
pub mod client_manager;
pub mod dpop;
pub mod error;
pub mod events;
pub mod fetch;
pub mod issuer;
pub mod jose;
pub mod login;
pub mod logout;
pub mod redirect;
pub mod refresher;
pub mod request;
pub mod session_info;
pub mod storage;
pub mod types;
pub mod utils;
pub mod webid;

pub use solid_authn_common::{HttpClient, MemoryStorage, FileStorage, Storage};

/// Signature algorithms offered for DPoP keys, most preferred first.
pub const PREFERRED_SIGNING_ALG: &[&str] = &["ES256", "RS256"];

/// Prefix for keys the library owns outside of per-user blobs.
pub const KEY_PREFIX: &str = "solidClientAuthn:";

/// Scopes requested by the authorization code flow.
pub const DEFAULT_SCOPES: &str = "openid offline_access webid";

/// Scopes requested when refreshing.
pub const REFRESH_SCOPES: &str = "openid offline_access";
