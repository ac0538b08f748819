//! Legacy implicit-flow redirects, where the tokens arrive in the URL itself.

use smol_str::{SmolStr, format_smolstr};
use solid_authn_common::HttpClient;
use url::Url;

use super::{HandlerContext, RedirectResult, query_param};
use crate::{
    error::{AuthError, Result},
    events::SessionEvent,
    fetch::{AuthenticatedFetch, FetchOptions},
    types::TokenType,
    utils::{find_param, random_uuid, remove_openid_params},
};

struct ImplicitTokens {
    id_token: SmolStr,
    access_token: SmolStr,
    state: SmolStr,
}

fn implicit_tokens(url: &Url) -> Option<ImplicitTokens> {
    Some(ImplicitTokens {
        id_token: find_param(url, "id_token")?,
        access_token: find_param(url, "access_token")?,
        state: find_param(url, "state")?,
    })
}

// some providers camelCase the parameter names
fn general_tokens(url: &Url) -> Option<ImplicitTokens> {
    let either = |snake: &str, camel: &str| query_param(url, snake).or_else(|| query_param(url, camel));
    Some(ImplicitTokens {
        id_token: either("id_token", "idToken")?,
        access_token: either("access_token", "accessToken")?,
        state: query_param(url, "state")?,
    })
}

pub(super) fn can_handle_implicit(url: &Url) -> bool {
    implicit_tokens(url).is_some()
}

pub(super) fn can_handle_general(url: &Url) -> bool {
    general_tokens(url).is_some()
}

pub(super) async fn handle_implicit<C>(
    ctx: &HandlerContext<C>,
    url: &Url,
) -> Result<RedirectResult<C>>
where
    C: HttpClient + Clone + Send + Sync + 'static,
{
    match implicit_tokens(url) {
        Some(tokens) => save_session(ctx, url, tokens).await,
        None => Err(AuthError::invalid_response(format_smolstr!(
            "No access token is present in the redirect URL: [{url}]"
        ))),
    }
}

pub(super) async fn handle_general<C>(
    ctx: &HandlerContext<C>,
    url: &Url,
) -> Result<RedirectResult<C>>
where
    C: HttpClient + Clone + Send + Sync + 'static,
{
    match general_tokens(url) {
        Some(tokens) => save_session(ctx, url, tokens).await,
        None => Ok(RedirectResult::unauthenticated(random_uuid())),
    }
}

/// Verify the ID token, persist the session, and return a Bearer-only fetch.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
async fn save_session<C>(
    ctx: &HandlerContext<C>,
    url: &Url,
    tokens: ImplicitTokens,
) -> Result<RedirectResult<C>>
where
    C: HttpClient + Clone + Send + Sync + 'static,
{
    let secure = ctx.storage.secure();
    // the state either names a session directly or points at one
    let session_id = match secure.get_for_user(&tokens.state, "sessionId").await? {
        Some(id) => {
            secure.delete_all_user_data(&tokens.state).await?;
            SmolStr::from(id)
        }
        None => tokens.state.clone(),
    };
    let context = ctx.storage.load_oidc_context(&session_id).await?;
    let issuer_config = ctx.issuers.get_or_fetch(&Url::parse(&context.issuer)?).await?;
    let client = ctx.clients.get(&context.issuer).await?.ok_or_else(|| {
        AuthError::invalid_client(format_smolstr!(
            "No client is registered for issuer [{}]",
            context.issuer
        ))
    })?;
    let claims = ctx
        .verifier
        .verify(
            &tokens.id_token,
            &issuer_config.jwks_uri,
            &issuer_config.issuer,
            &client.client_id,
        )
        .await?;

    secure
        .set_for_user(
            &session_id,
            [
                ("webId", claims.web_id.as_str()),
                ("isLoggedIn", "true"),
                ("tokenType", TokenType::Bearer.as_str()),
            ],
        )
        .await?;
    ctx.storage
        .insecure()
        .set_for_user(
            &session_id,
            [
                ("redirectUrl", remove_openid_params(url).to_string()),
                ("idToken", tokens.id_token.to_string()),
                ("issuer", context.issuer.to_string()),
                ("clientId", client.client_id.to_string()),
            ],
        )
        .await?;
    ctx.sessions.register(&session_id).await?;

    let info = ctx.sessions.get(&session_id).await?.ok_or_else(|| {
        AuthError::not_stored(format_smolstr!(
            "Could not find any session information associated with session [{session_id}] in storage."
        ))
    })?;
    ctx.emitter.emit(SessionEvent::Login);

    let fetch = AuthenticatedFetch::new(
        ctx.client.clone(),
        tokens.access_token,
        FetchOptions::new().build(),
    );
    Ok(RedirectResult {
        info,
        fetch: Some(fetch),
        logout_url: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_reads_query_or_fragment() {
        let url = Url::parse("https://app.example/#id_token=i&access_token=a&state=s").unwrap();
        let tokens = implicit_tokens(&url).unwrap();
        assert_eq!(tokens.id_token, "i");
        assert_eq!(tokens.state, "s");
        assert!(can_handle_implicit(
            &Url::parse("https://app.example/?id_token=i&access_token=a&state=s").unwrap()
        ));
        assert!(!can_handle_implicit(
            &Url::parse("https://app.example/?id_token=i&state=s").unwrap()
        ));
    }

    #[test]
    fn general_accepts_camel_case() {
        let url = Url::parse("https://app.example/?idToken=i&accessToken=a&state=s").unwrap();
        assert!(can_handle_general(&url));
        assert!(!can_handle_implicit(&url));
        assert_eq!(general_tokens(&url).unwrap().access_token, "a");
    }
}
