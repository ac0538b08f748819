//! Starting a login: the authorization request half of the code flow.

use std::sync::Arc;

use serde::Serialize;
use smol_str::SmolStr;
use url::Url;

use crate::{
    error::{AuthError, Result},
    storage::StorageUtility,
    types::{Client, IssuerConfig, TokenGrantType},
    utils::{generate_pkce, generate_state},
};

/// Receives the authorization URL the user agent must be sent to.
pub type RedirectCallback = Arc<dyn Fn(&Url) + Send + Sync>;

/// Everything needed to build one authorization request.
pub struct OidcLoginOptions<'a> {
    pub session_id: &'a str,
    /// Issuer as the caller named it; correlation state and the client are keyed by it.
    pub issuer: &'a str,
    pub issuer_config: &'a IssuerConfig,
    pub client: &'a Client,
    pub redirect_url: &'a str,
    pub dpop: bool,
    pub scopes: &'a str,
    pub prompt: Option<&'a str>,
    pub handle_redirect: Option<&'a RedirectCallback>,
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.1
#[derive(Serialize)]
struct AuthorizationRequest<'a> {
    response_type: &'a str,
    scope: &'a str,
    client_id: &'a str,
    redirect_uri: &'a str,
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.3
    code_challenge: &'a str,
    code_challenge_method: &'a str,
    state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

/// Authorization code flow with PKCE.
#[derive(Clone)]
pub struct AuthorizationCodeWithPkceOidcHandler {
    storage: StorageUtility,
}

impl AuthorizationCodeWithPkceOidcHandler {
    pub fn new(storage: StorageUtility) -> Self {
        Self { storage }
    }

    pub fn can_handle(&self, options: &OidcLoginOptions<'_>) -> bool {
        options
            .issuer_config
            .supports_grant(TokenGrantType::AuthorizationCode.as_str())
    }

    /// Record the correlation state for `options.session_id` and build the
    /// authorization URL, handing it to the redirect callback if there is one.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(session_id = options.session_id)))]
    pub async fn handle(&self, options: &OidcLoginOptions<'_>) -> Result<Url> {
        let (code_challenge, code_verifier) = generate_pkce();
        let state = generate_state();

        let secure = self.storage.secure();
        secure
            .set_for_user(&state, [("sessionId", options.session_id)])
            .await?;
        secure
            .set_for_user(
                options.session_id,
                [
                    ("codeVerifier", code_verifier.as_str()),
                    ("issuer", options.issuer),
                    ("redirectUrl", options.redirect_url),
                    ("dpop", if options.dpop { "true" } else { "false" }),
                ],
            )
            .await?;

        let url = authorization_url(options, &code_challenge, &state)?;
        if let Some(callback) = options.handle_redirect {
            callback(&url);
        }
        Ok(url)
    }
}

fn authorization_url(
    options: &OidcLoginOptions<'_>,
    code_challenge: &SmolStr,
    state: &SmolStr,
) -> Result<Url> {
    let endpoint = &options.issuer_config.authorization_endpoint;
    let mut url = Url::parse(endpoint).map_err(|e| {
        AuthError::configuration(smol_str::format_smolstr!(
            "The authorization endpoint [{endpoint}] of issuer [{}] is not a valid URL: {e}",
            options.issuer_config.issuer
        ))
    })?;
    let query = serde_html_form::to_string(AuthorizationRequest {
        response_type: "code",
        scope: options.scopes,
        client_id: &options.client.client_id,
        redirect_uri: options.redirect_url,
        code_challenge,
        code_challenge_method: "S256",
        state,
        prompt: options.prompt,
    })?;
    url.set_query(Some(&query));
    Ok(url)
}
