use smol_str::{SmolStr, format_smolstr};
use solid_authn_common::HttpClient;
use url::Url;

use super::{HandlerContext, RedirectResult, query_param};
use crate::{
    error::{AuthError, Result},
    events::SessionEvent,
    fetch::{AuthenticatedFetch, FetchOptions},
    issuer::issuer_equivalent,
    logout::maybe_build_rp_initiated_logout,
    refresher::RefreshOptions,
    request,
    types::{CodeExchange, IssuerConfig, TokenEndpointResponse, TokenGrantType},
    utils::remove_openid_params,
};

pub(super) fn can_handle(url: &Url) -> bool {
    query_param(url, "code").is_some() && query_param(url, "state").is_some()
}

// https://datatracker.ietf.org/doc/html/rfc9207#section-2.4
fn check_iss(url: &Url, issuer_config: &IssuerConfig) -> Result<()> {
    match query_param(url, "iss") {
        Some(iss) if !issuer_equivalent(&iss, &issuer_config.issuer) => {
            Err(AuthError::configuration(format_smolstr!(
                "The value of the iss parameter [{iss}] does not match the issuer identifier [{}]",
                issuer_config.issuer
            )))
        }
        None if issuer_config.authorization_response_iss_parameter_supported == Some(true) => {
            Err(AuthError::configuration(format_smolstr!(
                "The issuer [{}] advertises the iss parameter, but the redirect does not carry it",
                issuer_config.issuer
            )))
        }
        _ => Ok(()),
    }
}

/// Complete an authorization code login.
///
/// The one-time correlation state is consumed before the code is exchanged, so a replayed
/// redirect fails with a missing-context error instead of reaching the provider.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
pub(super) async fn handle<C>(ctx: &HandlerContext<C>, url: &Url) -> Result<RedirectResult<C>>
where
    C: HttpClient + Clone + Send + Sync + 'static,
{
    let (Some(code), Some(state)) = (query_param(url, "code"), query_param(url, "state")) else {
        return Err(AuthError::invalid_response(format_smolstr!(
            "The redirect [{url}] is missing one of [code, state]"
        )));
    };
    let secure = ctx.storage.secure();

    let session_id = secure
        .get_for_user(&state, "sessionId")
        .await?
        .map(SmolStr::from)
        .ok_or_else(|| {
            AuthError::missing_context(format_smolstr!(
                "No stored session is associated with the state [{state}]"
            ))
        })?;
    let context = ctx.storage.load_oidc_context(&session_id).await?;
    let issuer_config = ctx.issuers.get_or_fetch(&Url::parse(&context.issuer)?).await?;
    check_iss(url, &issuer_config)?;

    let code_verifier = secure
        .take_for_user(&session_id, "codeVerifier")
        .await?
        .ok_or_else(|| {
            AuthError::missing_context(format_smolstr!(
                "The code verifier for session [{session_id}] is missing from storage."
            ))
        })?;
    let redirect_url = context.redirect_url.clone().ok_or_else(|| {
        AuthError::missing_context(format_smolstr!(
            "The redirect URL for session [{session_id}] is missing from storage."
        ))
    })?;
    secure.delete_all_user_data(&state).await?;

    let client = ctx.clients.get(&context.issuer).await?.ok_or_else(|| {
        AuthError::invalid_client(format_smolstr!(
            "No client is registered for issuer [{}]",
            context.issuer
        ))
    })?;

    let tokens = request::get_tokens(
        &ctx.client,
        &issuer_config,
        &client,
        &CodeExchange {
            grant_type: TokenGrantType::AuthorizationCode,
            code,
            code_verifier: code_verifier.into(),
            redirect_url,
        },
        context.dpop.then_some(ctx.signing_algs.as_slice()),
        ctx.verifier.as_ref(),
        ctx.allow_bearer_for_dpop,
    )
    .await?;

    persist_session(ctx, &session_id, url, &context.issuer, &client.client_id, &tokens).await?;

    let fetch = build_fetch(ctx, &session_id, &tokens);
    let mut info = ctx.sessions.get(&session_id).await?.ok_or_else(|| {
        AuthError::not_stored(format_smolstr!(
            "Could not find any session information associated with session [{session_id}] in storage."
        ))
    })?;
    info.expiration_date = tokens.expires_at.map(|at| at * 1000);

    #[cfg(feature = "tracing")]
    tracing::info!(session_id = %session_id, web_id = %tokens.web_id, "login completed");

    if let Some(rt) = &tokens.refresh_token {
        ctx.emitter.emit(SessionEvent::NewRefreshToken(rt.clone()));
    }
    ctx.emitter.emit(SessionEvent::Login);

    Ok(RedirectResult {
        info,
        fetch: Some(fetch),
        logout_url: maybe_build_rp_initiated_logout(
            issuer_config.end_session_endpoint.as_deref(),
            Some(&tokens.id_token),
            None,
            None,
        ),
    })
}

async fn persist_session<C>(
    ctx: &HandlerContext<C>,
    session_id: &str,
    url: &Url,
    issuer: &str,
    client_id: &str,
    tokens: &TokenEndpointResponse,
) -> Result<()> {
    let mut secure_fields = vec![
        ("webId", tokens.web_id.to_string()),
        ("isLoggedIn", "true".to_string()),
        ("tokenType", tokens.token_type.as_str().to_string()),
    ];
    if let Some(rt) = &tokens.refresh_token {
        secure_fields.push(("refreshToken", rt.to_string()));
    }
    if let Some(at) = tokens.expires_at {
        secure_fields.push(("expirationDate", (at * 1000).to_string()));
    }
    ctx.storage
        .secure()
        .set_for_user(session_id, secure_fields)
        .await?;
    ctx.storage
        .insecure()
        .set_for_user(
            session_id,
            [
                ("redirectUrl", remove_openid_params(url).to_string()),
                ("idToken", tokens.id_token.to_string()),
                ("issuer", issuer.to_string()),
                ("clientId", client_id.to_string()),
            ],
        )
        .await?;
    ctx.sessions.register(session_id).await
}

fn build_fetch<C>(
    ctx: &HandlerContext<C>,
    session_id: &str,
    tokens: &TokenEndpointResponse,
) -> AuthenticatedFetch<C>
where
    C: HttpClient + Clone + Send + Sync + 'static,
{
    let refresh = tokens.refresh_token.as_ref().map(|rt| RefreshOptions {
        session_id: session_id.into(),
        refresh_token: rt.clone(),
        refresher: ctx.refresher.clone(),
        emitter: Some(ctx.emitter.clone()),
        expires_in: tokens.expires_in,
    });
    AuthenticatedFetch::new(
        ctx.client.clone(),
        tokens.access_token.clone(),
        FetchOptions::new()
            .maybe_dpop_key(tokens.dpop_key.clone())
            .maybe_refresh(refresh)
            .refresh_skew(ctx.refresh_skew)
            .default_expires_in(ctx.default_expires_in)
            .build(),
    )
}
