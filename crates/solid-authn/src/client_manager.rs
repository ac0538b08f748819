use std::sync::Arc;

use chrono::Utc;
use smol_str::SmolStr;

use crate::{
    error::{AuthError, Result},
    storage::StorageUtility,
    types::{Client, ClientRegistrationOptions, ClientType, IssuerConfig},
    utils::is_valid_url,
};

/// Registers clients on the fly against an issuer's registration endpoint.
///
/// The HTTP exchange itself is left to the implementor.
#[async_trait::async_trait]
pub trait DynamicClientRegistrar: Send + Sync {
    async fn register(
        &self,
        options: &ClientRegistrationOptions,
        issuer_config: &IssuerConfig,
    ) -> Result<Client>;
}

/// Pick the kind of client to use against `issuer_config`.
///
/// An explicit non-URL identifier always means a pre-registered client. A URL identifier
/// is only used as-is when the issuer speaks Solid-OIDC; anything else registers.
pub fn determine_client_type(
    options: &ClientRegistrationOptions,
    issuer_config: &IssuerConfig,
) -> ClientType {
    match options.client_id.as_deref() {
        Some(id) if !is_valid_url(id) => ClientType::Static,
        Some(_) if issuer_config.supports_scope("webid") => ClientType::SolidOidc,
        _ => ClientType::Dynamic,
    }
}

/// First algorithm of `preferred` the issuer can sign ID tokens with.
pub fn negotiate_client_signing_alg<S: AsRef<str>>(
    issuer_config: &IssuerConfig,
    preferred: &[S],
) -> Result<SmolStr> {
    let preferred_list = || {
        preferred
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let Some(supported) = issuer_config.id_token_signing_alg_values_supported.as_ref() else {
        return Err(AuthError::configuration(smol_str::format_smolstr!(
            "The OIDC issuer discovery profile is missing the 'id_token_signing_alg_values_supported' value, which is mandatory. The client preferred [{}]",
            preferred_list()
        )));
    };
    preferred
        .iter()
        .find(|alg| supported.iter().any(|s| s == alg.as_ref()))
        .map(|alg| SmolStr::new(alg.as_ref()))
        .ok_or_else(|| {
            AuthError::configuration(smol_str::format_smolstr!(
                "No signature algorithm match between the issuer's supported [{}] and the client's preferred [{}]",
                supported.join(", "),
                preferred_list()
            ))
        })
}

const CLIENT_ID: &str = "clientId";
const CLIENT_SECRET: &str = "clientSecret";
const CLIENT_NAME: &str = "clientName";
const CLIENT_TYPE: &str = "clientType";
const ID_TOKEN_ALG: &str = "idTokenSignedResponseAlg";
const EXPIRES_AT: &str = "expiresAt";

/// Negotiates and persists client identities, one per issuer.
#[derive(Clone)]
pub struct ClientManager {
    storage: StorageUtility,
    registrar: Option<Arc<dyn DynamicClientRegistrar>>,
}

impl ClientManager {
    pub fn new(storage: StorageUtility, registrar: Option<Arc<dyn DynamicClientRegistrar>>) -> Self {
        Self { storage, registrar }
    }

    /// Stored client for `issuer`. Expired dynamic registrations read as absent.
    pub async fn get(&self, issuer: &str) -> Result<Option<Client>> {
        let data = self.storage.secure().get_user_data(issuer).await?;
        let Some(client_id) = data.get(CLIENT_ID) else {
            return Ok(None);
        };
        let client_type = match data.get(CLIENT_TYPE).map(String::as_str) {
            Some("static") => ClientType::Static,
            Some("dynamic") => ClientType::Dynamic,
            Some("solid-oidc") => ClientType::SolidOidc,
            _ => return Ok(None),
        };
        let client = Client {
            client_id: SmolStr::new(client_id),
            client_secret: data.get(CLIENT_SECRET).map(SmolStr::new),
            client_type,
            client_name: data.get(CLIENT_NAME).map(SmolStr::new),
            id_token_signed_response_alg: data.get(ID_TOKEN_ALG).map(SmolStr::new),
            client_expires_at: data.get(EXPIRES_AT).and_then(|s| s.parse().ok()),
        };
        if client.client_type == ClientType::Dynamic && client.is_expired(Utc::now().timestamp()) {
            return Ok(None);
        }
        Ok(Some(client))
    }

    /// Settle on a client for `issuer` and persist it.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = issuer)))]
    pub async fn register(
        &self,
        issuer: &str,
        options: &ClientRegistrationOptions,
        issuer_config: &IssuerConfig,
    ) -> Result<Client> {
        let client_type = determine_client_type(options, issuer_config);
        let client = match client_type {
            ClientType::Dynamic => {
                if let Some(stored) = self.get(issuer).await? {
                    if stored.client_type == ClientType::Dynamic {
                        return Ok(stored);
                    }
                }
                let registrar = self.registrar.as_ref().ok_or_else(|| {
                    AuthError::configuration(smol_str::format_smolstr!(
                        "The issuer [{issuer}] requires dynamic client registration, but no registrar is configured"
                    ))
                })?;
                let mut client = registrar.register(options, issuer_config).await?;
                client.client_type = ClientType::Dynamic;
                client
            }
            ClientType::Static | ClientType::SolidOidc => Client {
                // determine_client_type only picks these when an id was given
                client_id: options.client_id.clone().unwrap_or_default(),
                client_secret: options.client_secret.clone(),
                client_type,
                client_name: options.client_name.clone(),
                id_token_signed_response_alg: options.id_token_signed_response_alg.clone(),
                client_expires_at: None,
            },
        };
        client.validate().map_err(AuthError::invalid_client)?;
        self.persist(issuer, &client).await?;
        Ok(client)
    }

    async fn persist(&self, issuer: &str, client: &Client) -> Result<()> {
        let mut fields: Vec<(&str, String)> = vec![
            (CLIENT_ID, client.client_id.to_string()),
            (CLIENT_TYPE, client.client_type.as_str().to_string()),
        ];
        if let Some(secret) = &client.client_secret {
            fields.push((CLIENT_SECRET, secret.to_string()));
        }
        if let Some(name) = &client.client_name {
            fields.push((CLIENT_NAME, name.to_string()));
        }
        if let Some(alg) = &client.id_token_signed_response_alg {
            fields.push((ID_TOKEN_ALG, alg.to_string()));
        }
        if let Some(at) = client.client_expires_at {
            fields.push((EXPIRES_AT, at.to_string()));
        }
        // fields of the previous client are dropped, not merged
        self.storage.secure().delete_all_user_data(issuer).await?;
        self.storage.secure().set_for_user(issuer, fields).await
    }
}
