//! Token endpoint grants: authorization code (PKCE) and refresh.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use http::{Method, Request, Response};
use serde_json::{Map, Value};
use smol_str::SmolStr;
use solid_authn_common::HttpClient;

use crate::{
    REFRESH_SCOPES,
    dpop::{KeyPair, generate_key_pair, send_with_dpop},
    error::{AuthError, Result},
    types::{
        Client, CodeExchange, IssuerConfig, RefreshRequestParameters, TokenEndpointResponse,
        TokenGrantType, TokenRequestParameters, TokenType,
    },
    utils::is_valid_url,
    webid::WebIdVerifier,
};

/// Token endpoint response after shape validation, before the ID token is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTokens {
    pub access_token: SmolStr,
    pub id_token: SmolStr,
    pub refresh_token: Option<SmolStr>,
    pub expires_in: Option<i64>,
    pub token_type: SmolStr,
}

fn string_field(body: &Map<String, Value>, field: &str) -> Option<SmolStr> {
    body.get(field).and_then(Value::as_str).map(SmolStr::new)
}

/// Check a decoded token endpoint body.
///
/// Provider error objects come first, then the required fields in order, then the token
/// type against what was requested. `allow_bearer_for_dpop` accepts a `Bearer` answer to
/// a DPoP request.
pub fn validate_token_endpoint_response(
    body: &Map<String, Value>,
    dpop: bool,
    allow_bearer_for_dpop: bool,
) -> Result<ValidatedTokens> {
    if let Some(error) = string_field(body, "error") {
        return Err(AuthError::oidc_provider(
            error,
            string_field(body, "error_description"),
            string_field(body, "error_uri"),
        ));
    }
    let access_token =
        string_field(body, "access_token").ok_or_else(|| AuthError::missing_field("access_token"))?;
    let id_token =
        string_field(body, "id_token").ok_or_else(|| AuthError::missing_field("id_token"))?;
    let token_type =
        string_field(body, "token_type").ok_or_else(|| AuthError::missing_field("token_type"))?;
    let expires_in = match body.get("expires_in") {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.as_i64().ok_or_else(|| AuthError::missing_field("expires_in"))?),
    };

    let is_bearer = token_type.eq_ignore_ascii_case("bearer");
    if !dpop && !is_bearer {
        return Err(AuthError::invalid_response(smol_str::format_smolstr!(
            "Invalid token endpoint response: requested a [Bearer] token, but got a 'token_type' value of [{token_type}]."
        )));
    }
    if dpop && !token_type.eq_ignore_ascii_case("dpop") && !(is_bearer && allow_bearer_for_dpop) {
        return Err(AuthError::invalid_response(smol_str::format_smolstr!(
            "Invalid token endpoint response: requested a [DPoP] token, but got a 'token_type' value of [{token_type}]."
        )));
    }

    Ok(ValidatedTokens {
        access_token,
        id_token,
        refresh_token: string_field(body, "refresh_token"),
        expires_in,
        token_type,
    })
}

fn token_endpoint<'a>(issuer: &'a IssuerConfig) -> Result<&'a str> {
    issuer.token_endpoint.as_deref().ok_or_else(|| {
        AuthError::configuration(smol_str::format_smolstr!(
            "This issuer [{}] does not have a token endpoint",
            issuer.issuer
        ))
    })
}

fn basic_auth(client: &Client) -> Option<String> {
    client
        .client_secret
        .as_ref()
        .map(|secret| format!("Basic {}", STANDARD.encode(format!("{}:{secret}", client.client_id))))
}

async fn post_form<C: HttpClient>(
    client: &C,
    endpoint: &str,
    body: String,
    oidc_client: &Client,
    dpop_key: Option<&KeyPair>,
) -> Result<Response<Vec<u8>>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(endpoint)
        .header("Content-Type", "application/x-www-form-urlencoded");
    if let Some(auth) = basic_auth(oidc_client) {
        builder = builder.header("Authorization", auth);
    }
    let req = builder.body(body.into_bytes())?;
    match dpop_key {
        Some(key) => Ok(send_with_dpop(client, key, true, None, req).await?),
        None => client.send_http(req).await.map_err(AuthError::transport),
    }
}

fn decode_body(issuer: &IssuerConfig, res: &Response<Vec<u8>>) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(res.body()) {
        Ok(Value::Object(map)) => Ok(map),
        // body omitted: it may carry credentials
        _ => Err(AuthError::invalid_response(smol_str::format_smolstr!(
            "The token endpoint of issuer {} returned a malformed response.",
            issuer.issuer
        ))
        .with_details(smol_str::format_smolstr!("HTTP {}", res.status()))),
    }
}

async fn finish(
    tokens: ValidatedTokens,
    issuer: &IssuerConfig,
    oidc_client: &Client,
    dpop_key: Option<KeyPair>,
    verifier: &dyn WebIdVerifier,
) -> Result<TokenEndpointResponse> {
    let claims = verifier
        .verify(
            &tokens.id_token,
            &issuer.jwks_uri,
            &issuer.issuer,
            &oidc_client.client_id,
        )
        .await?;
    let token_type = if dpop_key.is_some() {
        TokenType::DPoP
    } else {
        TokenType::Bearer
    };
    Ok(TokenEndpointResponse {
        access_token: tokens.access_token,
        id_token: tokens.id_token,
        web_id: claims.web_id,
        client_id: claims.client_id,
        refresh_token: tokens.refresh_token,
        expires_at: tokens.expires_in.map(|e| Utc::now().timestamp() + e),
        expires_in: tokens.expires_in,
        token_type,
        dpop_key,
    })
}

/// Exchange an authorization code for tokens.
///
/// With `dpop_algs` set a fresh key pair is generated for the first supported algorithm
/// in that preference list, bound to the tokens, and returned in the response.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %issuer.issuer)))]
pub async fn get_tokens<C: HttpClient>(
    client: &C,
    issuer: &IssuerConfig,
    oidc_client: &Client,
    data: &CodeExchange,
    dpop_algs: Option<&[SmolStr]>,
    verifier: &dyn WebIdVerifier,
    allow_bearer_for_dpop: bool,
) -> Result<TokenEndpointResponse> {
    let grant = data.grant_type.as_str();
    if !issuer.supports_grant(grant) {
        return Err(AuthError::unsupported_grant(issuer.issuer.clone(), grant));
    }
    let endpoint = token_endpoint(issuer)?;

    let body = serde_html_form::to_string(TokenRequestParameters {
        grant_type: data.grant_type,
        redirect_uri: data.redirect_url.clone(),
        code: data.code.clone(),
        code_verifier: data.code_verifier.clone(),
        client_id: oidc_client.client_id.clone(),
    })?;
    let dpop_key = dpop_algs.map(generate_key_pair::<SmolStr>).transpose()?;
    let dpop = dpop_key.is_some();
    let res = post_form(client, endpoint, body, oidc_client, dpop_key.as_ref()).await?;

    let tokens = validate_token_endpoint_response(
        &decode_body(issuer, &res)?,
        dpop,
        allow_bearer_for_dpop,
    )?;
    finish(tokens, issuer, oidc_client, dpop_key, verifier).await
}

/// Run the refresh grant. A DPoP session keeps its existing key.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %issuer.issuer)))]
pub async fn refresh<C: HttpClient>(
    client: &C,
    refresh_token: &str,
    issuer: &IssuerConfig,
    oidc_client: &Client,
    dpop_key: Option<&KeyPair>,
    verifier: &dyn WebIdVerifier,
    allow_bearer_for_dpop: bool,
) -> Result<TokenEndpointResponse> {
    if oidc_client.client_id.is_empty() {
        return Err(AuthError::invalid_client(
            "A client ID is required to refresh tokens",
        ));
    }
    let endpoint = token_endpoint(issuer)?;

    // opaque legacy client ids are never echoed back
    let client_id = (oidc_client.client_secret.is_none() && is_valid_url(&oidc_client.client_id))
        .then(|| oidc_client.client_id.clone());
    let body = serde_html_form::to_string(RefreshRequestParameters {
        grant_type: TokenGrantType::RefreshToken,
        refresh_token: refresh_token.into(),
        scope: REFRESH_SCOPES.into(),
        client_id,
    })?;
    let res = post_form(client, endpoint, body, oidc_client, dpop_key).await?;

    let tokens = validate_token_endpoint_response(
        &decode_body(issuer, &res)?,
        dpop_key.is_some(),
        allow_bearer_for_dpop,
    )?;
    finish(tokens, issuer, oidc_client, dpop_key.cloned(), verifier).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthErrorKind;
    use crate::jose::CompactJws;
    use crate::jose::jwt::Claims;
    use crate::types::ClientType;
    use crate::webid::WebIdClaims;
    use core::future::Future;
    use http::StatusCode;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockClient {
        resp: Arc<Mutex<Option<Response<Vec<u8>>>>>,
        seen: Arc<Mutex<Vec<Request<Vec<u8>>>>>,
    }

    impl HttpClient for MockClient {
        type Error = Infallible;
        fn send_http(
            &self,
            request: Request<Vec<u8>>,
        ) -> impl Future<Output = core::result::Result<Response<Vec<u8>>, Self::Error>> + Send
        {
            let resp = self.resp.clone();
            let seen = self.seen.clone();
            async move {
                seen.lock().await.push(request);
                Ok(resp.lock().await.take().unwrap())
            }
        }
    }

    impl MockClient {
        async fn respond(&self, body: Value) {
            *self.resp.lock().await = Some(
                Response::builder()
                    .status(StatusCode::OK)
                    .body(serde_json::to_vec(&body).unwrap())
                    .unwrap(),
            );
        }

        async fn last_form(&self) -> Vec<(String, String)> {
            let seen = self.seen.lock().await;
            serde_html_form::from_bytes(seen.last().unwrap().body()).unwrap()
        }
    }

    struct FixedVerifier;

    #[async_trait::async_trait]
    impl WebIdVerifier for FixedVerifier {
        async fn verify(
            &self,
            _id_token: &str,
            _jwks_uri: &str,
            _issuer: &str,
            client_id: &str,
        ) -> Result<WebIdClaims> {
            Ok(WebIdClaims {
                web_id: "https://alice.example/#me".into(),
                client_id: Some(client_id.into()),
            })
        }
    }

    fn issuer() -> IssuerConfig {
        IssuerConfig {
            issuer: "https://idp.example/".into(),
            token_endpoint: Some("https://idp.example/token".into()),
            jwks_uri: "https://idp.example/jwks".into(),
            grant_types_supported: Some(vec!["authorization_code".into()]),
            scopes_supported: vec!["openid".into(), "webid".into()],
            ..Default::default()
        }
    }

    fn solid_client() -> Client {
        Client {
            client_id: "https://app.example/id".into(),
            client_secret: None,
            client_type: ClientType::SolidOidc,
            client_name: None,
            id_token_signed_response_alg: None,
            client_expires_at: None,
        }
    }

    fn static_client() -> Client {
        Client {
            client_id: "abc123".into(),
            client_secret: Some("s3cret".into()),
            client_type: ClientType::Static,
            ..solid_client()
        }
    }

    fn exchange() -> CodeExchange {
        CodeExchange {
            grant_type: TokenGrantType::AuthorizationCode,
            code: "abc".into(),
            code_verifier: "v".into(),
            redirect_url: "https://app.example/".into(),
        }
    }

    const ES256: &[SmolStr] = &[SmolStr::new_static("ES256")];

    fn token_body(token_type: &str) -> Value {
        serde_json::json!({
            "access_token": "at",
            "id_token": "it",
            "token_type": token_type,
            "expires_in": 300,
            "refresh_token": "rt"
        })
    }

    #[tokio::test]
    async fn code_exchange_with_dpop() {
        let client = MockClient::default();
        client.respond(token_body("DPoP")).await;
        let out = get_tokens(&client, &issuer(), &solid_client(), &exchange(), Some(ES256), &FixedVerifier, true)
            .await
            .unwrap();
        assert_eq!(out.web_id, "https://alice.example/#me");
        assert_eq!(out.token_type, TokenType::DPoP);
        assert_eq!(out.expires_in, Some(300));
        let key = out.dpop_key.expect("dpop key");

        let seen = client.seen.lock().await;
        let req = &seen[0];
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "https://idp.example/token");
        assert!(req.headers().get("Authorization").is_none());
        let proof = req.headers()["DPoP"].to_str().unwrap();
        let jws = CompactJws::parse(proof).unwrap();
        crate::jose::verify_es256(&jws, &key.verifying_key()).unwrap();
        let claims: Claims = jws.claims().unwrap();
        assert_eq!(claims.public.htu.as_deref(), Some("https://idp.example/token"));
        assert_eq!(claims.public.htm.as_deref(), Some("POST"));
        drop(seen);

        let form = client.last_form().await;
        let keys: Vec<_> = form.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["grant_type", "redirect_uri", "code", "code_verifier", "client_id"]
        );
        assert!(form.contains(&("grant_type".into(), "authorization_code".into())));
    }

    #[tokio::test]
    async fn confidential_client_uses_basic_auth() {
        let client = MockClient::default();
        client.respond(token_body("Bearer")).await;
        let out = get_tokens(&client, &issuer(), &static_client(), &exchange(), None, &FixedVerifier, true)
            .await
            .unwrap();
        assert!(out.dpop_key.is_none());
        let seen = client.seen.lock().await;
        assert_eq!(
            seen[0].headers()["Authorization"],
            format!("Basic {}", STANDARD.encode("abc123:s3cret")).as_str()
        );
        assert!(seen[0].headers().get("DPoP").is_none());
        assert!(!String::from_utf8_lossy(seen[0].body()).contains("s3cret"));
    }

    #[tokio::test]
    async fn preconditions() {
        let client = MockClient::default();
        let mut no_grant = issuer();
        no_grant.grant_types_supported = Some(vec!["implicit".into()]);
        let err = get_tokens(&client, &no_grant, &solid_client(), &exchange(), Some(ES256), &FixedVerifier, true)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The issuer [https://idp.example/] does not support the [authorization_code] grant"
        );

        let mut no_endpoint = issuer();
        no_endpoint.token_endpoint = None;
        let err = get_tokens(&client, &no_endpoint, &solid_client(), &exchange(), Some(ES256), &FixedVerifier, true)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), AuthErrorKind::Configuration(m) if m.contains("does not have a token endpoint")));
        assert!(client.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dpop_key_follows_algorithm_preferences() {
        let client = MockClient::default();
        let err = get_tokens(
            &client,
            &issuer(),
            &solid_client(),
            &exchange(),
            Some(&[SmolStr::new_static("RS256")][..]),
            &FixedVerifier,
            true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err.kind(), AuthErrorKind::Crypto));
        assert!(client.seen.lock().await.is_empty());

        client.respond(token_body("DPoP")).await;
        let out = get_tokens(
            &client,
            &issuer(),
            &solid_client(),
            &exchange(),
            Some(&[SmolStr::new_static("RS256"), SmolStr::new_static("ES256")][..]),
            &FixedVerifier,
            true,
        )
        .await
        .unwrap();
        assert!(out.dpop_key.is_some());
    }

    #[test]
    fn response_validation_order() {
        let as_map = |v: Value| v.as_object().unwrap().clone();

        let err = validate_token_endpoint_response(
            &as_map(serde_json::json!({"error": "invalid_grant", "error_description": "nope", "access_token": "x"})),
            true,
            true,
        )
        .unwrap_err();
        assert!(err.is_invalid_grant());
        assert!(err.to_string().ends_with(": nope"));

        for (body, field) in [
            (serde_json::json!({"id_token": "i", "token_type": "DPoP"}), "[access_token]"),
            (serde_json::json!({"access_token": "a", "token_type": "DPoP"}), "[id_token]"),
            (serde_json::json!({"access_token": "a", "id_token": "i"}), "[token_type]"),
            (
                serde_json::json!({"access_token": "a", "id_token": "i", "token_type": "DPoP", "expires_in": "soon"}),
                "[expires_in]",
            ),
        ] {
            let err = validate_token_endpoint_response(&as_map(body), true, true).unwrap_err();
            assert!(matches!(err.kind(), AuthErrorKind::InvalidResponse(m) if m.contains(field)));
        }
    }

    #[test]
    fn token_type_must_match_request() {
        let as_map = |v: Value| v.as_object().unwrap().clone();
        let dpop_body = as_map(token_body("DPoP"));
        let bearer_body = as_map(token_body("bearer"));

        let err = validate_token_endpoint_response(&dpop_body, false, true).unwrap_err();
        assert!(err.to_string().contains("requested a [Bearer] token"));

        assert!(validate_token_endpoint_response(&bearer_body, true, true).is_ok());
        let err = validate_token_endpoint_response(&bearer_body, true, false).unwrap_err();
        assert!(err.to_string().contains("requested a [DPoP] token"));
    }

    #[tokio::test]
    async fn refresh_echoes_only_url_client_ids() {
        let client = MockClient::default();
        let key = KeyPair::generate();
        client.respond(token_body("DPoP")).await;
        let out = refresh(&client, "rt-1", &issuer(), &solid_client(), Some(&key), &FixedVerifier, true)
            .await
            .unwrap();
        assert_eq!(out.dpop_key.as_ref(), Some(&key));
        let form = client.last_form().await;
        assert!(form.contains(&("client_id".into(), "https://app.example/id".into())));
        assert!(form.contains(&("scope".into(), "openid offline_access".into())));
        assert!(form.contains(&("refresh_token".into(), "rt-1".into())));

        client.respond(token_body("Bearer")).await;
        let mut legacy = static_client();
        legacy.client_secret = None;
        refresh(&client, "rt-1", &issuer(), &legacy, None, &FixedVerifier, true)
            .await
            .unwrap();
        assert!(!client.last_form().await.iter().any(|(k, _)| k == "client_id"));
    }

    #[tokio::test]
    async fn refresh_errors() {
        let client = MockClient::default();
        let mut nameless = solid_client();
        nameless.client_id = "".into();
        let err = refresh(&client, "rt", &issuer(), &nameless, None, &FixedVerifier, true)
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), AuthErrorKind::InvalidClient(_)));

        *client.resp.lock().await = Some(
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(b"<html>oops</html>".to_vec())
                .unwrap(),
        );
        let err = refresh(&client, "rt", &issuer(), &solid_client(), None, &FixedVerifier, true)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The token endpoint of issuer https://idp.example/ returned a malformed response."
        );
    }
}
