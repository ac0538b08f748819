use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::utils::is_valid_url;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    /// Pre-registered, opaque identifier
    Static,
    /// Registered on the fly against the issuer's registration endpoint
    Dynamic,
    /// Client identifier is a dereferenceable URL document
    SolidOidc,
}

impl ClientType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::SolidOidc => "solid-oidc",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub client_id: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SmolStr>,
    pub client_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token_signed_response_alg: Option<SmolStr>,
    /// Unix seconds; `0` means the registration never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_expires_at: Option<i64>,
}

impl Client {
    /// Check the invariants for the client's type.
    ///
    /// Solid-OIDC clients are public and identified by URL. Static and dynamic clients
    /// are confidential, and a dynamic one also carries its registration expiry.
    pub fn validate(&self) -> Result<(), SmolStr> {
        if self.client_id.is_empty() {
            return Err("a client must have a client id".into());
        }
        match self.client_type {
            ClientType::SolidOidc => {
                if self.client_secret.is_some() {
                    return Err(smol_str::format_smolstr!(
                        "Solid-OIDC client [{}] must not have a client secret",
                        self.client_id
                    ));
                }
                if !is_valid_url(&self.client_id) {
                    return Err(smol_str::format_smolstr!(
                        "Solid-OIDC client id [{}] must be a URL",
                        self.client_id
                    ));
                }
            }
            ClientType::Static | ClientType::Dynamic => {
                if self.client_secret.is_none() {
                    return Err(smol_str::format_smolstr!(
                        "{} client [{}] requires a client secret",
                        self.client_type.as_str(),
                        self.client_id
                    ));
                }
                if self.client_type == ClientType::Dynamic && self.client_expires_at.is_none() {
                    return Err(smol_str::format_smolstr!(
                        "dynamic client [{}] is missing its expiry",
                        self.client_id
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Expired dynamic registrations must be replaced.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.client_expires_at, Some(at) if at != 0 && at < now)
    }
}

/// What the host application knows about its client before negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
#[builder(start_fn = new)]
pub struct ClientRegistrationOptions {
    #[builder(into)]
    pub client_id: Option<SmolStr>,
    #[builder(into)]
    pub client_secret: Option<SmolStr>,
    #[builder(into)]
    pub client_name: Option<SmolStr>,
    #[builder(into)]
    pub redirect_url: Option<SmolStr>,
    /// Negotiated ID token signing algorithm to register with.
    #[builder(into)]
    pub id_token_signed_response_alg: Option<SmolStr>,
}
