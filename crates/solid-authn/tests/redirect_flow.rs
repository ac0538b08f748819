use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use http::{Request, Response};
use serde_json::json;
use solid_authn::{
    HttpClient, MemoryStorage,
    client::{AuthnConfig, ClientAuthentication, LoginOptions, LogoutOptions},
    client_manager::DynamicClientRegistrar,
    error::{AuthErrorKind, Result},
    events::SessionEvent,
    jose::{CompactJws, jwt::Claims},
    types::{Client, ClientRegistrationOptions, ClientType, IssuerConfig, TokenType},
    utils::find_param,
    webid::{WebIdClaims, WebIdVerifier},
};
use tokio::sync::{Mutex, broadcast};
use url::Url;

#[derive(Clone, Default)]
struct MockClient {
    queue: Arc<Mutex<VecDeque<Response<Vec<u8>>>>>,
    log: Arc<Mutex<Vec<Request<Vec<u8>>>>>,
}

impl MockClient {
    async fn push(&self, res: Response<Vec<u8>>) {
        self.queue.lock().await.push_back(res);
    }
}

impl HttpClient for MockClient {
    type Error = Infallible;
    fn send_http(
        &self,
        request: Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<Response<Vec<u8>>, Self::Error>> + Send {
        let queue = self.queue.clone();
        let log = self.log.clone();
        async move {
            log.lock().await.push(request);
            Ok(queue
                .lock()
                .await
                .pop_front()
                .expect("no response queued for request"))
        }
    }
}

struct AliceVerifier;

#[async_trait::async_trait]
impl WebIdVerifier for AliceVerifier {
    async fn verify(&self, _: &str, _: &str, _: &str, client_id: &str) -> Result<WebIdClaims> {
        Ok(WebIdClaims {
            web_id: "https://alice.example/#me".into(),
            client_id: Some(client_id.into()),
        })
    }
}

fn json_response(body: serde_json::Value) -> Response<Vec<u8>> {
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .unwrap()
}

fn discovery(grants: &[&str]) -> Response<Vec<u8>> {
    json_response(json!({
        "issuer": "https://idp.example/",
        "authorization_endpoint": "https://idp.example/auth",
        "token_endpoint": "https://idp.example/token",
        "jwks_uri": "https://idp.example/jwks",
        "end_session_endpoint": "https://idp.example/logout",
        "grant_types_supported": grants,
        "scopes_supported": ["openid", "webid", "offline_access"],
        "id_token_signing_alg_values_supported": ["ES256"],
        "some_future_key": true
    }))
}

fn auth(client: &MockClient) -> ClientAuthentication<MockClient> {
    ClientAuthentication::new(
        client.clone(),
        MemoryStorage::new(),
        MemoryStorage::new(),
        AuthnConfig::default(),
    )
    .with_verifier(Arc::new(AliceVerifier))
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn login_then_redirect_establishes_a_dpop_session() {
    let client = MockClient::default();
    let auth = auth(&client);
    let mut events = auth.events().subscribe();

    client
        .push(discovery(&["authorization_code", "refresh_token"]))
        .await;
    let auth_url = auth
        .login(
            LoginOptions::new()
                .oidc_issuer("https://idp.example/")
                .redirect_url("https://app.example/")
                .client_id("https://app.example/id")
                .session_id("s1")
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(
        client.log.lock().await[0].uri().to_string(),
        "https://idp.example/.well-known/openid-configuration"
    );
    assert_eq!(
        auth.storage()
            .secure()
            .get_for_user("https://idp.example/", "clientType")
            .await
            .unwrap()
            .as_deref(),
        Some(ClientType::SolidOidc.as_str())
    );
    let state = find_param(&auth_url, "state").unwrap();

    client
        .push(json_response(json!({
            "access_token": "at",
            "id_token": "id.token.sig",
            "token_type": "DPoP",
            "expires_in": 3600,
            "refresh_token": "rt"
        })))
        .await;
    let redirect = format!("https://app.example/?code=abc&state={state}&iss=https%3A%2F%2Fidp.example%2F");
    let result = auth.handle_incoming_redirect(&redirect).await.unwrap();

    assert!(result.info.is_logged_in);
    assert_eq!(result.info.session_id, "s1");
    assert_eq!(result.info.web_id.as_deref(), Some("https://alice.example/#me"));
    assert!(result.info.expiration_date.is_some());
    assert!(result.fetch.is_some());
    assert!(
        result
            .logout_url
            .as_ref()
            .unwrap()
            .as_str()
            .starts_with("https://idp.example/logout?id_token_hint=id.token.sig")
    );

    {
        let log = client.log.lock().await;
        let token_request = &log[1];
        assert_eq!(token_request.method(), http::Method::POST);
        assert_eq!(token_request.uri().to_string(), "https://idp.example/token");
        assert!(token_request.headers().get("authorization").is_none());
        let body = String::from_utf8(token_request.body().clone()).unwrap();
        assert!(body.contains("grant_type=authorization_code"));
        assert!(body.contains("code=abc"));
        assert!(body.contains("code_verifier="));
        assert!(body.contains("redirect_uri=https%3A%2F%2Fapp.example%2F"));

        let proof = token_request.headers()["DPoP"].to_str().unwrap();
        let claims: Claims = CompactJws::parse(proof).unwrap().claims().unwrap();
        assert_eq!(claims.public.htm.as_deref(), Some("POST"));
        assert_eq!(claims.public.htu.as_deref(), Some("https://idp.example/token"));
    }

    let info = auth.get_session_info("s1").await.unwrap().unwrap();
    assert_eq!(info.redirect_url.as_deref(), Some("https://app.example/"));
    assert_eq!(info.client_app_id.as_deref(), Some("https://app.example/id"));
    assert_eq!(info.refresh_token.as_deref(), Some("rt"));
    assert_eq!(auth.get_all_session_info().await.unwrap().len(), 1);

    let seen = drain(&mut events);
    assert!(seen.contains(&SessionEvent::Login));
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, SessionEvent::NewRefreshToken(_)))
            .count(),
        1
    );

    // the verifier and the state were consumed
    let err = auth.handle_incoming_redirect(&redirect).await.unwrap_err();
    assert!(matches!(err.kind(), AuthErrorKind::MissingContext(_)));
    assert_eq!(client.log.lock().await.len(), 2);
}

#[tokio::test]
async fn logout_clears_session_and_builds_end_session_url() {
    let client = MockClient::default();
    let auth = auth(&client);
    client.push(discovery(&["authorization_code"])).await;
    let auth_url = auth
        .login(
            LoginOptions::new()
                .oidc_issuer("https://idp.example/")
                .redirect_url("https://app.example/")
                .client_id("https://app.example/id")
                .token_type(TokenType::Bearer)
                .session_id("s1")
                .restore_url("https://app.example/private")
                .build(),
        )
        .await
        .unwrap();
    let state = find_param(&auth_url, "state").unwrap();
    client
        .push(json_response(json!({
            "access_token": "at",
            "id_token": "id.token.sig",
            "token_type": "Bearer"
        })))
        .await;
    let mut events = auth.events().subscribe();
    let result = auth
        .handle_incoming_redirect(&format!("https://app.example/?code=abc&state={state}"))
        .await
        .unwrap();
    assert!(result.info.is_logged_in);
    assert!(client.log.lock().await[1].headers().get("DPoP").is_none());
    assert!(drain(&mut events).contains(&SessionEvent::SessionRestored {
        url: "https://app.example/private".into()
    }));

    let url = auth
        .logout(
            "s1",
            LogoutOptions::new()
                .idp(true)
                .post_logout_url("https://app.example/bye")
                .build(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(find_param(&url, "id_token_hint").as_deref(), Some("id.token.sig"));
    assert_eq!(
        find_param(&url, "post_logout_redirect_uri").as_deref(),
        Some("https://app.example/bye")
    );
    assert_eq!(auth.get_session_info("s1").await.unwrap(), None);
    assert!(drain(&mut events).contains(&SessionEvent::Logout));
}

#[tokio::test]
async fn error_redirect_reports_and_stays_logged_out() {
    let client = MockClient::default();
    let reported = Arc::new(std::sync::Mutex::new(None));
    let sink = reported.clone();
    let auth = auth(&client).on_error(Arc::new(move |error: &str, description: Option<&str>| {
        *sink.lock().unwrap() = Some((error.to_string(), description.map(str::to_string)));
    }));
    let mut events = auth.events().subscribe();

    let result = auth
        .handle_incoming_redirect("https://app.example/?error=access_denied&error_description=nope")
        .await
        .unwrap();
    assert!(!result.info.is_logged_in);
    assert!(result.fetch.is_none());
    assert_eq!(
        reported.lock().unwrap().clone(),
        Some(("access_denied".to_string(), Some("nope".to_string())))
    );
    assert_eq!(
        drain(&mut events),
        vec![SessionEvent::Error {
            code: "access_denied".into(),
            description: Some("nope".into())
        }]
    );
    assert!(client.log.lock().await.is_empty());
}

#[tokio::test]
async fn plain_and_invalid_urls() {
    let client = MockClient::default();
    let auth = auth(&client);
    let result = auth
        .handle_incoming_redirect("https://app.example/home")
        .await
        .unwrap();
    assert!(!result.info.is_logged_in);

    let err = auth.handle_incoming_redirect("not a url").await.unwrap_err();
    assert!(matches!(err.kind(), AuthErrorKind::InvalidRedirectUrl(_)));
}

#[tokio::test]
async fn issuer_without_code_grant_is_rejected() {
    let client = MockClient::default();
    let auth = auth(&client);
    client.push(discovery(&["implicit"])).await;
    let err = auth
        .login(
            LoginOptions::new()
                .oidc_issuer("https://idp.example/")
                .redirect_url("https://app.example/")
                .client_id("https://app.example/id")
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        AuthErrorKind::UnsupportedGrant { grant, .. } if grant == "authorization_code"
    ));
}

struct Registrar(AtomicUsize);

#[async_trait::async_trait]
impl DynamicClientRegistrar for Registrar {
    async fn register(
        &self,
        options: &ClientRegistrationOptions,
        _: &IssuerConfig,
    ) -> Result<Client> {
        self.0.fetch_add(1, Ordering::SeqCst);
        assert_eq!(options.id_token_signed_response_alg.as_deref(), Some("ES256"));
        Ok(Client {
            client_id: "registered-id".into(),
            client_secret: Some("registered-secret".into()),
            client_type: ClientType::Dynamic,
            client_name: options.client_name.clone(),
            id_token_signed_response_alg: options.id_token_signed_response_alg.clone(),
            client_expires_at: Some(0),
        })
    }
}

#[tokio::test]
async fn dynamic_registration_happens_once_per_issuer() {
    let client = MockClient::default();
    let registrar = Arc::new(Registrar(AtomicUsize::new(0)));
    let auth = auth(&client).with_registrar(registrar.clone());

    for _ in 0..2 {
        client.push(discovery(&["authorization_code"])).await;
        let url = auth
            .login(
                LoginOptions::new()
                    .oidc_issuer("https://idp.example/")
                    .redirect_url("https://app.example/")
                    .client_name("My app")
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(find_param(&url, "client_id").as_deref(), Some("registered-id"));
        assert!(Url::parse(url.as_str()).is_ok());
    }
    assert_eq!(registrar.0.load(Ordering::SeqCst), 1);
}

async fn start_login(client: &MockClient, auth: &ClientAuthentication<MockClient>, session_id: &str) -> String {
    client.push(discovery(&["authorization_code"])).await;
    let url = auth
        .login(
            LoginOptions::new()
                .oidc_issuer("https://idp.example/")
                .redirect_url("https://app.example/")
                .client_id("https://app.example/id")
                .token_type(TokenType::Bearer)
                .session_id(session_id)
                .build(),
        )
        .await
        .unwrap();
    find_param(&url, "state").unwrap().to_string()
}

#[tokio::test]
async fn implicit_redirect_establishes_a_bearer_session() {
    let client = MockClient::default();
    let auth = auth(&client);
    let state = start_login(&client, &auth, "s1").await;
    let mut events = auth.events().subscribe();

    let result = auth
        .handle_incoming_redirect(&format!(
            "https://app.example/#id_token=id.token.sig&access_token=at&state={state}"
        ))
        .await
        .unwrap();
    assert!(result.info.is_logged_in);
    assert_eq!(result.info.session_id, "s1");
    assert_eq!(result.info.web_id.as_deref(), Some("https://alice.example/#me"));
    assert!(drain(&mut events).contains(&SessionEvent::Login));

    let secure = auth.storage().secure();
    assert_eq!(secure.get_for_user(&state, "sessionId").await.unwrap(), None);
    let info = auth.get_session_info("s1").await.unwrap().unwrap();
    assert_eq!(info.token_type, Some(TokenType::Bearer));
    assert_eq!(info.redirect_url.as_deref(), Some("https://app.example/"));
    assert_eq!(info.id_token.as_deref(), Some("id.token.sig"));

    // no token endpoint round trip for implicit tokens
    assert_eq!(client.log.lock().await.len(), 1);
    client
        .push(Response::builder().status(200).body(Vec::new()).unwrap())
        .await;
    let res = result
        .fetch
        .unwrap()
        .get("https://alice.pod.example/private")
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let log = client.log.lock().await;
    let sent = log.last().unwrap();
    assert_eq!(sent.headers()["authorization"], "Bearer at");
    assert!(sent.headers().get("DPoP").is_none());
}

#[tokio::test]
async fn camel_case_redirect_uses_state_as_session_id() {
    let client = MockClient::default();
    let auth = auth(&client);
    start_login(&client, &auth, "s2").await;

    let result = auth
        .handle_incoming_redirect("https://app.example/?idToken=i&accessToken=a&state=s2")
        .await
        .unwrap();
    assert!(result.info.is_logged_in);
    assert_eq!(result.info.session_id, "s2");
    assert!(result.fetch.is_some());
    let info = auth.get_session_info("s2").await.unwrap().unwrap();
    assert_eq!(info.token_type, Some(TokenType::Bearer));
    assert_eq!(info.id_token.as_deref(), Some("i"));
}

#[tokio::test]
async fn dpop_key_algorithm_comes_from_config() {
    let client = MockClient::default();
    let auth = ClientAuthentication::new(
        client.clone(),
        MemoryStorage::new(),
        MemoryStorage::new(),
        AuthnConfig::new()
            .preferred_signing_algs(vec!["RS256".into()])
            .build(),
    )
    .with_verifier(Arc::new(AliceVerifier));
    client.push(discovery(&["authorization_code"])).await;
    let url = auth
        .login(
            LoginOptions::new()
                .oidc_issuer("https://idp.example/")
                .redirect_url("https://app.example/")
                .client_id("https://app.example/id")
                .session_id("s1")
                .build(),
        )
        .await
        .unwrap();
    let state = find_param(&url, "state").unwrap();

    let err = auth
        .handle_incoming_redirect(&format!("https://app.example/?code=abc&state={state}"))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), AuthErrorKind::Crypto));
    // no DPoP key could be made, so the code was never sent
    assert_eq!(client.log.lock().await.len(), 1);
}
