use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use super::TokenType;

/// Public view of a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SmolStr,
    pub is_logged_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_id: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_app_id: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_app_secret: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<i64>,
}

impl SessionInfo {
    /// Logged-out session with no other data.
    pub fn unauthenticated(session_id: impl Into<SmolStr>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}

/// Correlation state written when login starts, read back when the redirect arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcContext {
    pub issuer: SmolStr,
    pub code_verifier: Option<SmolStr>,
    pub redirect_url: Option<SmolStr>,
    pub dpop: bool,
}
