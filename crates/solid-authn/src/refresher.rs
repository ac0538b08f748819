use std::sync::Arc;

use smol_str::SmolStr;
use solid_authn_common::HttpClient;
use url::Url;

use crate::{
    client_manager::ClientManager,
    dpop::KeyPair,
    error::{AuthError, Result},
    events::SessionEventEmitter,
    issuer::IssuerConfigFetcher,
    request,
    storage::StorageUtility,
    types::TokenEndpointResponse,
    webid::WebIdVerifier,
};

/// Runs the refresh grant on behalf of a session.
#[async_trait::async_trait]
pub trait TokenRefresh: Send + Sync {
    /// Refresh `session_id`'s tokens. Without `refresh_token` the stored one is used.
    async fn refresh(
        &self,
        session_id: &str,
        refresh_token: Option<&str>,
        dpop_key: Option<&KeyPair>,
    ) -> Result<TokenEndpointResponse>;
}

/// What an authenticated fetch needs to keep its session alive.
#[derive(Clone)]
pub struct RefreshOptions {
    pub session_id: SmolStr,
    pub refresh_token: SmolStr,
    pub refresher: Arc<dyn TokenRefresh>,
    pub emitter: Option<SessionEventEmitter>,
    /// Lifetime of the current access token, in seconds.
    pub expires_in: Option<i64>,
}

impl std::fmt::Debug for RefreshOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshOptions")
            .field("session_id", &self.session_id)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// [`TokenRefresh`] backed by stored session context.
///
/// Resolves the session's issuer and client from storage, runs the grant, and persists a
/// rotated refresh token. Announcing the rotation is left to the caller.
pub struct TokenRefresher<C> {
    client: C,
    storage: StorageUtility,
    issuers: IssuerConfigFetcher<C>,
    clients: ClientManager,
    verifier: Arc<dyn WebIdVerifier>,
    allow_bearer_for_dpop: bool,
}

impl<C: HttpClient + Clone> TokenRefresher<C> {
    pub fn new(
        client: C,
        storage: StorageUtility,
        clients: ClientManager,
        verifier: Arc<dyn WebIdVerifier>,
    ) -> Self {
        Self {
            issuers: IssuerConfigFetcher::new(client.clone(), storage.clone()),
            client,
            storage,
            clients,
            verifier,
            allow_bearer_for_dpop: true,
        }
    }

    pub fn allow_bearer_for_dpop(mut self, allow: bool) -> Self {
        self.allow_bearer_for_dpop = allow;
        self
    }
}

#[async_trait::async_trait]
impl<C> TokenRefresh for TokenRefresher<C>
where
    C: HttpClient + Clone + Send + Sync,
{
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(session_id = session_id)))]
    async fn refresh(
        &self,
        session_id: &str,
        refresh_token: Option<&str>,
        dpop_key: Option<&KeyPair>,
    ) -> Result<TokenEndpointResponse> {
        let context = self.storage.load_oidc_context(session_id).await?;

        let refresh_token = match refresh_token {
            Some(token) => SmolStr::new(token),
            None => self
                .storage
                .secure()
                .get_for_user(session_id, "refreshToken")
                .await?
                .map(SmolStr::from)
                .ok_or_else(|| AuthError::no_refresh_token(session_id))?,
        };
        if context.dpop && dpop_key.is_none() {
            return Err(AuthError::configuration(smol_str::format_smolstr!(
                "For session [{session_id}], the key bound to the DPoP access token must be provided to refresh said access token."
            )));
        }

        let issuer_url = Url::parse(&context.issuer)?;
        let issuer_config = self.issuers.get_or_fetch(&issuer_url).await?;
        let client = self.clients.get(&context.issuer).await?.ok_or_else(|| {
            AuthError::invalid_client(smol_str::format_smolstr!(
                "No client is registered for issuer [{}]",
                context.issuer
            ))
        })?;

        let response = request::refresh(
            &self.client,
            &refresh_token,
            &issuer_config,
            &client,
            dpop_key,
            self.verifier.as_ref(),
            self.allow_bearer_for_dpop,
        )
        .await?;

        let mut fields = Vec::new();
        if let Some(rotated) = &response.refresh_token {
            fields.push(("refreshToken", rotated.to_string()));
        }
        if let Some(at) = response.expires_at {
            fields.push(("expirationDate", (at * 1000).to_string()));
        }
        if !fields.is_empty() {
            self.storage.secure().set_for_user(session_id, fields).await?;
        }
        Ok(response)
    }
}
