use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::dpop::KeyPair;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenType {
    #[default]
    DPoP,
    Bearer,
}

impl TokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DPoP => "DPoP",
            Self::Bearer => "Bearer",
        }
    }

    pub fn is_dpop(self) -> bool {
        self == Self::DPoP
    }
}

impl std::str::FromStr for TokenType {
    type Err = SmolStr;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("dpop") {
            Ok(Self::DPoP)
        } else if s.eq_ignore_ascii_case("bearer") {
            Ok(Self::Bearer)
        } else {
            Err(smol_str::format_smolstr!("unknown token type [{s}]"))
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenGrantType {
    AuthorizationCode,
    RefreshToken,
}

impl TokenGrantType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.3
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenRequestParameters {
    pub grant_type: TokenGrantType,
    pub redirect_uri: SmolStr,
    pub code: SmolStr,
    pub code_verifier: SmolStr,
    pub client_id: SmolStr,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-6
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequestParameters {
    pub grant_type: TokenGrantType,
    pub refresh_token: SmolStr,
    pub scope: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<SmolStr>,
}

/// Input to the authorization code grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeExchange {
    pub grant_type: TokenGrantType,
    pub code: SmolStr,
    pub code_verifier: SmolStr,
    pub redirect_url: SmolStr,
}

/// Validated tokens, with the subject resolved from the ID token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEndpointResponse {
    pub access_token: SmolStr,
    pub id_token: SmolStr,
    pub web_id: SmolStr,
    /// `azp` of the ID token, when present.
    pub client_id: Option<SmolStr>,
    pub refresh_token: Option<SmolStr>,
    pub expires_in: Option<i64>,
    /// Unix seconds, computed from `expires_in` when the response was received.
    pub expires_at: Option<i64>,
    pub token_type: TokenType,
    pub dpop_key: Option<KeyPair>,
}
