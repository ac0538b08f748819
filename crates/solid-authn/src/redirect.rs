//! Turning an incoming redirect URL into a session.
//!
//! Each redirect shape a provider can send back has its own handler. They are tried in a
//! fixed order, most specific first, and the last one accepts anything that parses so that
//! callers never have to classify a URL themselves.

mod auth_code;
mod error;
mod fallback;
mod implicit;

use std::{sync::Arc, time::Duration};

use smol_str::SmolStr;
use solid_authn_common::HttpClient;
use url::Url;

use crate::{
    client_manager::ClientManager,
    error::{AuthError, Result},
    events::SessionEventEmitter,
    fetch::{AuthenticatedFetch, DEFAULT_EXPIRATION_TIME, REFRESH_BEFORE_EXPIRATION},
    issuer::IssuerConfigFetcher,
    refresher::TokenRefresh,
    session_info::SessionInfoManager,
    storage::StorageUtility,
    types::SessionInfo,
    webid::WebIdVerifier,
};

/// Called with `(error, error_description)` when the provider redirects back with an error.
pub type ErrorCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// The redirect shapes, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectHandler {
    /// `error` in the query
    Error,
    /// `code` and `state` in the query
    AuthCode,
    /// `id_token`, `access_token` and `state` in the query or fragment
    Implicit,
    /// Implicit-style tokens under camelCase names
    General,
    /// Any other valid URL
    Fallback,
}

impl RedirectHandler {
    pub const PRECEDENCE: [Self; 5] = [
        Self::Error,
        Self::AuthCode,
        Self::Implicit,
        Self::General,
        Self::Fallback,
    ];

    pub fn can_handle(self, redirect_url: &str) -> bool {
        let Ok(url) = Url::parse(redirect_url) else {
            return false;
        };
        match self {
            Self::Error => error::can_handle(&url),
            Self::AuthCode => auth_code::can_handle(&url),
            Self::Implicit => implicit::can_handle_implicit(&url),
            Self::General => implicit::can_handle_general(&url),
            Self::Fallback => true,
        }
    }

    /// First handler in precedence order that accepts `redirect_url`.
    ///
    /// Unparseable URLs land on [`RedirectHandler::Fallback`], whose `handle` rejects them.
    pub fn select(redirect_url: &str) -> Self {
        Self::PRECEDENCE
            .into_iter()
            .find(|h| h.can_handle(redirect_url))
            .unwrap_or(Self::Fallback)
    }
}

/// Outcome of handling a redirect.
pub struct RedirectResult<C> {
    pub info: SessionInfo,
    /// Present when the redirect produced credentials.
    pub fetch: Option<AuthenticatedFetch<C>>,
    /// The provider's end-session URL for this login, if it has one.
    pub logout_url: Option<Url>,
}

impl<C> RedirectResult<C> {
    pub(crate) fn unauthenticated(session_id: impl Into<SmolStr>) -> Self {
        Self {
            info: SessionInfo::unauthenticated(session_id),
            fetch: None,
            logout_url: None,
        }
    }
}

impl<C> std::fmt::Debug for RedirectResult<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectResult")
            .field("info", &self.info)
            .field("fetch", &self.fetch.is_some())
            .field("logout_url", &self.logout_url)
            .finish()
    }
}

/// Everything the handlers share.
pub struct HandlerContext<C> {
    pub(crate) client: C,
    pub(crate) storage: StorageUtility,
    pub(crate) issuers: IssuerConfigFetcher<C>,
    pub(crate) clients: ClientManager,
    pub(crate) sessions: SessionInfoManager,
    pub(crate) verifier: Arc<dyn WebIdVerifier>,
    pub(crate) refresher: Arc<dyn TokenRefresh>,
    pub(crate) emitter: SessionEventEmitter,
    pub(crate) allow_bearer_for_dpop: bool,
    pub(crate) signing_algs: Vec<SmolStr>,
    pub(crate) refresh_skew: Duration,
    pub(crate) default_expires_in: Duration,
}

impl<C: HttpClient + Clone> HandlerContext<C> {
    pub fn new(
        client: C,
        storage: StorageUtility,
        clients: ClientManager,
        verifier: Arc<dyn WebIdVerifier>,
        refresher: Arc<dyn TokenRefresh>,
        emitter: SessionEventEmitter,
    ) -> Self {
        Self {
            issuers: IssuerConfigFetcher::new(client.clone(), storage.clone()),
            sessions: SessionInfoManager::new(storage.clone()),
            client,
            storage,
            clients,
            verifier,
            refresher,
            emitter,
            allow_bearer_for_dpop: true,
            signing_algs: crate::PREFERRED_SIGNING_ALG
                .iter()
                .copied()
                .map(SmolStr::new_static)
                .collect(),
            refresh_skew: REFRESH_BEFORE_EXPIRATION,
            default_expires_in: DEFAULT_EXPIRATION_TIME,
        }
    }

    pub fn allow_bearer_for_dpop(mut self, allow: bool) -> Self {
        self.allow_bearer_for_dpop = allow;
        self
    }

    /// Key algorithms tried, in order, when generating the DPoP key for a code exchange.
    pub fn signing_algs(mut self, algs: Vec<SmolStr>) -> Self {
        self.signing_algs = algs;
        self
    }

    pub fn refresh_timing(mut self, skew: Duration, default_expires_in: Duration) -> Self {
        self.refresh_skew = skew;
        self.default_expires_in = default_expires_in;
        self
    }
}

/// Dispatches an incoming redirect to the first handler that accepts it.
pub struct IncomingRedirectHandler<C> {
    ctx: HandlerContext<C>,
    on_error: Option<ErrorCallback>,
}

impl<C> IncomingRedirectHandler<C>
where
    C: HttpClient + Clone + Send + Sync + 'static,
{
    pub fn new(ctx: HandlerContext<C>) -> Self {
        Self {
            ctx,
            on_error: None,
        }
    }

    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn context(&self) -> &HandlerContext<C> {
        &self.ctx
    }

    /// Handle `redirect_url`. Only a URL that does not parse, or a failing login
    /// completion, is an error.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn handle(&self, redirect_url: &str) -> Result<RedirectResult<C>> {
        let handler = RedirectHandler::select(redirect_url);
        #[cfg(feature = "tracing")]
        tracing::debug!(?handler, "dispatching redirect");

        if handler == RedirectHandler::Fallback {
            return fallback::handle(redirect_url);
        }
        let url = Url::parse(redirect_url)
            .map_err(|e| AuthError::invalid_redirect_url(redirect_url, e))?;
        match handler {
            RedirectHandler::Error => Ok(error::handle(&self.ctx, &url, self.on_error.as_ref())),
            RedirectHandler::AuthCode => auth_code::handle(&self.ctx, &url).await,
            RedirectHandler::Implicit => implicit::handle_implicit(&self.ctx, &url).await,
            RedirectHandler::General => implicit::handle_general(&self.ctx, &url).await,
            RedirectHandler::Fallback => fallback::handle(redirect_url),
        }
    }
}

/// First query parameter named `name`.
pub(crate) fn query_param(url: &Url, name: &str) -> Option<SmolStr> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| SmolStr::new(v))
}
