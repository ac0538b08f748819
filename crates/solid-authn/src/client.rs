//! The high-level entry point.

use std::{sync::Arc, time::Duration};

use smol_str::{SmolStr, format_smolstr};
use solid_authn_common::{HttpClient, Storage};
use url::Url;

use crate::{
    DEFAULT_SCOPES, PREFERRED_SIGNING_ALG,
    client_manager::{
        ClientManager, DynamicClientRegistrar, determine_client_type, negotiate_client_signing_alg,
    },
    error::{AuthError, Result},
    events::{SessionEvent, SessionEventEmitter},
    fetch::{DEFAULT_EXPIRATION_TIME, REFRESH_BEFORE_EXPIRATION},
    issuer::IssuerConfigFetcher,
    login::{AuthorizationCodeWithPkceOidcHandler, OidcLoginOptions, RedirectCallback},
    logout::maybe_build_rp_initiated_logout,
    redirect::{ErrorCallback, HandlerContext, IncomingRedirectHandler, RedirectResult},
    refresher::{TokenRefresh, TokenRefresher},
    session_info::SessionInfoManager,
    storage::StorageUtility,
    types::{ClientRegistrationOptions, ClientType, SessionInfo, TokenGrantType, TokenType},
    utils::random_uuid,
    webid::{JwksWebIdVerifier, WebIdVerifier},
};

/// Library-wide settings.
#[derive(Debug, Clone, PartialEq, bon::Builder)]
#[builder(start_fn = new)]
pub struct AuthnConfig {
    /// Signing algorithms offered for DPoP keys and ID tokens, most preferred first.
    #[builder(default = PREFERRED_SIGNING_ALG.iter().copied().map(SmolStr::new_static).collect())]
    pub preferred_signing_algs: Vec<SmolStr>,
    /// How long before expiry tokens are proactively refreshed.
    #[builder(default = REFRESH_BEFORE_EXPIRATION)]
    pub refresh_skew: Duration,
    /// Assumed token lifetime when the provider does not say.
    #[builder(default = DEFAULT_EXPIRATION_TIME)]
    pub default_expires_in: Duration,
    /// Accept a `Bearer` token type in answer to a DPoP-bound request.
    #[builder(default = true)]
    pub allow_bearer_for_dpop: bool,
    #[builder(default = SmolStr::new_static(DEFAULT_SCOPES), into)]
    pub scopes: SmolStr,
}

impl Default for AuthnConfig {
    fn default() -> Self {
        Self::new().build()
    }
}

/// Options for a single login.
#[derive(Clone, bon::Builder)]
#[builder(start_fn = new)]
pub struct LoginOptions {
    #[builder(into)]
    pub oidc_issuer: SmolStr,
    #[builder(into)]
    pub redirect_url: SmolStr,
    #[builder(into)]
    pub client_id: Option<SmolStr>,
    #[builder(into)]
    pub client_secret: Option<SmolStr>,
    #[builder(into)]
    pub client_name: Option<SmolStr>,
    #[builder(default)]
    pub token_type: TokenType,
    #[builder(into)]
    pub prompt: Option<SmolStr>,
    /// Reuse this session id instead of minting a new one.
    #[builder(into)]
    pub session_id: Option<SmolStr>,
    /// Where the app was when a silent re-login started. Reported back through
    /// [`SessionEvent::SessionRestored`] once the redirect completes.
    #[builder(into)]
    pub restore_url: Option<SmolStr>,
    pub handle_redirect: Option<RedirectCallback>,
}

#[derive(Clone, Default, bon::Builder)]
#[builder(start_fn = new)]
pub struct LogoutOptions {
    /// Also end the session at the identity provider.
    #[builder(default)]
    pub idp: bool,
    #[builder(into)]
    pub post_logout_url: Option<SmolStr>,
    #[builder(into)]
    pub state: Option<SmolStr>,
    pub handle_redirect: Option<RedirectCallback>,
}

const RESTORE_URL: &str = "restoreUrl";

/// Logs users in, completes their redirects, and tracks their sessions.
pub struct ClientAuthentication<C> {
    client: C,
    storage: StorageUtility,
    registrar: Option<Arc<dyn DynamicClientRegistrar>>,
    verifier: Arc<dyn WebIdVerifier>,
    on_error: Option<ErrorCallback>,
    emitter: SessionEventEmitter,
    config: AuthnConfig,
}

impl ClientAuthentication<reqwest::Client> {
    /// Client backed by a default `reqwest` client.
    pub fn with_reqwest(
        secure: impl Storage + 'static,
        insecure: impl Storage + 'static,
        config: AuthnConfig,
    ) -> Self {
        Self::new(reqwest::Client::new(), secure, insecure, config)
    }
}

impl<C> ClientAuthentication<C>
where
    C: HttpClient + Clone + Send + Sync + 'static,
{
    /// `secure` holds tokens and correlation state; `insecure` holds what may be exposed,
    /// such as issuer metadata and ID tokens.
    pub fn new<S, I>(client: C, secure: S, insecure: I, config: AuthnConfig) -> Self
    where
        S: Storage + 'static,
        I: Storage + 'static,
    {
        Self {
            verifier: Arc::new(JwksWebIdVerifier::new(client.clone())),
            client,
            storage: StorageUtility::new(secure, insecure),
            registrar: None,
            on_error: None,
            emitter: SessionEventEmitter::new(),
            config,
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn DynamicClientRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn WebIdVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Called when the provider redirects back with an error.
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn events(&self) -> &SessionEventEmitter {
        &self.emitter
    }

    pub fn storage(&self) -> &StorageUtility {
        &self.storage
    }

    pub fn config(&self) -> &AuthnConfig {
        &self.config
    }

    fn issuers(&self) -> IssuerConfigFetcher<C> {
        IssuerConfigFetcher::new(self.client.clone(), self.storage.clone())
    }

    fn clients(&self) -> ClientManager {
        ClientManager::new(self.storage.clone(), self.registrar.clone())
    }

    fn sessions(&self) -> SessionInfoManager {
        SessionInfoManager::new(self.storage.clone())
    }

    fn refresher(&self) -> Arc<dyn TokenRefresh> {
        Arc::new(
            TokenRefresher::new(
                self.client.clone(),
                self.storage.clone(),
                self.clients(),
                self.verifier.clone(),
            )
            .allow_bearer_for_dpop(self.config.allow_bearer_for_dpop),
        )
    }

    fn redirect_handler(&self) -> IncomingRedirectHandler<C> {
        let ctx = HandlerContext::new(
            self.client.clone(),
            self.storage.clone(),
            self.clients(),
            self.verifier.clone(),
            self.refresher(),
            self.emitter.clone(),
        )
        .allow_bearer_for_dpop(self.config.allow_bearer_for_dpop)
        .signing_algs(self.config.preferred_signing_algs.clone())
        .refresh_timing(self.config.refresh_skew, self.config.default_expires_in);
        let handler = IncomingRedirectHandler::new(ctx);
        match &self.on_error {
            Some(callback) => handler.on_error(callback.clone()),
            None => handler,
        }
    }

    /// Start a login and return the authorization URL to send the user to.
    ///
    /// Any state stored for the session is cleared first.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip_all, fields(issuer = %options.oidc_issuer)))]
    pub async fn login(&self, options: LoginOptions) -> Result<Url> {
        let session_id = options.session_id.clone().unwrap_or_else(random_uuid);
        self.sessions().clear(&session_id).await?;

        let issuer = &options.oidc_issuer;
        let issuer_url = Url::parse(issuer)?;
        let issuer_config = self.issuers().fetch_config(&issuer_url).await?;

        let mut registration = ClientRegistrationOptions {
            client_id: options.client_id.clone(),
            client_secret: options.client_secret.clone(),
            client_name: options.client_name.clone(),
            redirect_url: Some(options.redirect_url.clone()),
            id_token_signed_response_alg: None,
        };
        if determine_client_type(&registration, &issuer_config) == ClientType::Dynamic {
            registration.id_token_signed_response_alg = Some(negotiate_client_signing_alg(
                &issuer_config,
                &self.config.preferred_signing_algs,
            )?);
        }
        let client = self
            .clients()
            .register(issuer, &registration, &issuer_config)
            .await?;

        let handler = AuthorizationCodeWithPkceOidcHandler::new(self.storage.clone());
        let login_options = OidcLoginOptions {
            session_id: &session_id,
            issuer,
            issuer_config: &issuer_config,
            client: &client,
            redirect_url: &options.redirect_url,
            dpop: options.token_type.is_dpop(),
            scopes: &self.config.scopes,
            prompt: options.prompt.as_deref(),
            handle_redirect: options.handle_redirect.as_ref(),
        };
        if !handler.can_handle(&login_options) {
            return Err(AuthError::unsupported_grant(
                issuer.clone(),
                TokenGrantType::AuthorizationCode.as_str(),
            ));
        }
        if let Some(url) = &options.restore_url {
            self.storage
                .insecure()
                .set_for_user(&session_id, [(RESTORE_URL, url.as_str())])
                .await?;
        }
        handler.handle(&login_options).await
    }

    /// Complete whatever flow `redirect_url` belongs to.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip_all))]
    pub async fn handle_incoming_redirect(&self, redirect_url: &str) -> Result<RedirectResult<C>> {
        let result = self.redirect_handler().handle(redirect_url).await?;
        if result.info.is_logged_in {
            let restored = self
                .storage
                .insecure()
                .take_for_user(&result.info.session_id, RESTORE_URL)
                .await?;
            if let Some(url) = restored {
                self.emitter
                    .emit(SessionEvent::SessionRestored { url: url.into() });
            }
        }
        Ok(result)
    }

    /// Forget `session_id` locally, and with `options.idp` build the provider's
    /// end-session URL as well.
    ///
    /// Any [`AuthenticatedFetch`](crate::fetch::AuthenticatedFetch) handed out for the
    /// session keeps its current token until dropped.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip_all, fields(session_id = session_id)))]
    pub async fn logout(&self, session_id: &str, options: LogoutOptions) -> Result<Option<Url>> {
        let sessions = self.sessions();
        let info = sessions.get(session_id).await?;

        let mut logout_url = None;
        if options.idp {
            let info = info.as_ref().ok_or_else(|| {
                AuthError::not_stored(format_smolstr!(
                    "No session [{session_id}] is stored, so there is no identity provider session to end"
                ))
            })?;
            if let Some(issuer) = &info.issuer {
                let config = self.issuers().get_or_fetch(&Url::parse(issuer)?).await?;
                logout_url = maybe_build_rp_initiated_logout(
                    config.end_session_endpoint.as_deref(),
                    info.id_token.as_deref(),
                    options.post_logout_url.as_deref(),
                    options.state.as_deref(),
                );
            }
        }

        sessions.clear(session_id).await?;
        self.emitter.emit(SessionEvent::Logout);

        if let (Some(url), Some(callback)) = (&logout_url, &options.handle_redirect) {
            callback(url);
        }
        Ok(logout_url)
    }

    pub async fn get_session_info(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        self.sessions().get(session_id).await
    }

    pub async fn get_all_session_info(&self) -> Result<Vec<SessionInfo>> {
        self.sessions().get_all().await
    }
}
