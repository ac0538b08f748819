//! Credential-attaching HTTP wrapper with transparent refresh.
//!
//! An [`AuthenticatedFetch`] owns the session's access token (and DPoP key, if any) and
//! adds them to every request. When refresh is configured it keeps a single background
//! timer that refreshes shortly before expiry, and it refreshes reactively when a request
//! comes back 401 or 403.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use http::{Request, Response, StatusCode, header::AUTHORIZATION};
use smol_str::SmolStr;
use solid_authn_common::{HttpClient, ResponseUrl};
use tokio::{sync::RwLock, task::JoinHandle};
use url::Url;

use crate::{
    dpop::{KeyPair, send_with_dpop},
    error::{AuthError, Result},
    events::{RefreshTimerId, SessionEvent, SessionEventEmitter},
    refresher::{RefreshOptions, TokenRefresh},
    types::TokenEndpointResponse,
};

/// Default lifetime assumed for tokens issued without `expires_in`.
pub const DEFAULT_EXPIRATION_TIME: Duration = Duration::from_secs(600);

/// How long before expiry the proactive refresh fires.
pub const REFRESH_BEFORE_EXPIRATION: Duration = Duration::from_secs(5);

/// Credentials the wrapper attaches. Replaced as a whole on refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub access_token: SmolStr,
    pub dpop_key: Option<KeyPair>,
    pub refresh_token: Option<SmolStr>,
    /// Seconds, as reported by the token endpoint.
    pub expires_in: Option<i64>,
}

/// Delay before the proactive refresh: `expires_in - skew`, or the full lifetime if that
/// would not be positive.
pub fn refresh_delay(expires_in: Option<i64>, skew: Duration, default: Duration) -> Duration {
    let Some(expires_in) = expires_in else {
        return default.saturating_sub(skew);
    };
    let lifetime = Duration::from_secs(expires_in.max(0) as u64);
    match lifetime.checked_sub(skew) {
        Some(d) if !d.is_zero() => d,
        _ => lifetime,
    }
}

#[derive(Debug, Clone, bon::Builder)]
#[builder(start_fn = new)]
pub struct FetchOptions {
    pub dpop_key: Option<KeyPair>,
    pub refresh: Option<RefreshOptions>,
    #[builder(default = REFRESH_BEFORE_EXPIRATION)]
    pub refresh_skew: Duration,
    #[builder(default = DEFAULT_EXPIRATION_TIME)]
    pub default_expires_in: Duration,
}

struct RefreshContext {
    session_id: SmolStr,
    refresher: Arc<dyn TokenRefresh>,
    emitter: Option<SessionEventEmitter>,
}

struct Inner<C> {
    client: C,
    state: RwLock<SessionState>,
    refresh: Option<RefreshContext>,
    // held across a refresh so concurrent 401s trigger one grant
    refresh_lock: tokio::sync::Mutex<()>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
    next_timer_id: AtomicU64,
    refresh_skew: Duration,
    default_expires_in: Duration,
}

impl<C> Inner<C> {
    fn emit(&self, event: SessionEvent) {
        if let Some(emitter) = self.refresh.as_ref().and_then(|r| r.emitter.as_ref()) {
            emitter.emit(event);
        }
    }

    fn cancel_timer(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }

    /// Swap in freshly refreshed credentials. Returns the new state.
    async fn apply(&self, tokens: TokenEndpointResponse) -> SessionState {
        let mut state = self.state.write().await;
        let rotated = tokens
            .refresh_token
            .clone()
            .filter(|t| state.refresh_token.as_ref() != Some(t));
        *state = SessionState {
            access_token: tokens.access_token,
            dpop_key: tokens.dpop_key.or_else(|| state.dpop_key.clone()),
            refresh_token: tokens.refresh_token.or_else(|| state.refresh_token.clone()),
            expires_in: tokens.expires_in,
        };
        let new_state = state.clone();
        drop(state);

        if let Some(token) = rotated {
            self.emit(SessionEvent::NewRefreshToken(token));
        }
        new_state
    }
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// HTTP client wrapper that authenticates every request as the session's user.
///
/// Cheap to clone; clones share credentials and the refresh timer. The timer stops
/// when the last clone is dropped.
pub struct AuthenticatedFetch<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for AuthenticatedFetch<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> std::fmt::Debug for AuthenticatedFetch<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedFetch")
            .field("refresh", &self.inner.refresh.is_some())
            .finish_non_exhaustive()
    }
}

/// Wrap `client` so that it authenticates with `access_token`.
pub fn build_authenticated_fetch<C>(
    client: C,
    access_token: impl Into<SmolStr>,
    options: FetchOptions,
) -> AuthenticatedFetch<C>
where
    C: HttpClient + Send + Sync + 'static,
{
    AuthenticatedFetch::new(client, access_token, options)
}

impl<C> AuthenticatedFetch<C>
where
    C: HttpClient + Send + Sync + 'static,
{
    pub fn new(client: C, access_token: impl Into<SmolStr>, options: FetchOptions) -> Self {
        let (refresh, refresh_token, expires_in) = match options.refresh {
            Some(RefreshOptions {
                session_id,
                refresh_token,
                refresher,
                emitter,
                expires_in,
            }) => (
                Some(RefreshContext {
                    session_id,
                    refresher,
                    emitter,
                }),
                Some(refresh_token),
                expires_in,
            ),
            None => (None, None, None),
        };
        let access_token: SmolStr = access_token.into();
        let fetch = Self {
            inner: Arc::new(Inner {
                client,
                state: RwLock::new(SessionState {
                    access_token: access_token.clone(),
                    dpop_key: options.dpop_key,
                    refresh_token,
                    expires_in,
                }),
                refresh,
                refresh_lock: tokio::sync::Mutex::new(()),
                timer: std::sync::Mutex::new(None),
                next_timer_id: AtomicU64::new(1),
                refresh_skew: options.refresh_skew,
                default_expires_in: options.default_expires_in,
            }),
        };
        if fetch.inner.refresh.is_some() {
            schedule_refresh(&fetch.inner, expires_in, access_token);
        }
        fetch
    }

    /// Snapshot of the current credentials.
    pub async fn state(&self) -> SessionState {
        self.inner.state.read().await.clone()
    }

    pub fn has_refresh_timer(&self) -> bool {
        self.inner
            .timer
            .lock()
            .map(|t| t.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Stop proactive refreshing. Requests keep working with the current token.
    pub fn cancel_refresh(&self) {
        self.inner.cancel_timer();
    }

    /// Send an authenticated `GET` to `url`.
    pub async fn get(&self, url: &str) -> Result<Response<Vec<u8>>> {
        self.send(Request::get(url).body(Vec::new())?).await
    }

    /// Send `request` with the session's credentials.
    ///
    /// Responses other than 401/403 are returned as they are. On 401/403 a DPoP-bound
    /// request that was redirected is replayed once against the final URL, then, if
    /// refresh is configured, the tokens are refreshed and the request retried once. When
    /// that refresh fails the failed response is returned rather than an error.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(uri = %request.uri())))]
    pub async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let state = self.state().await;
        let requested = Url::parse(&request.uri().to_string())?;
        let mut response = self.send_with(&state, request.clone()).await?;
        if !is_auth_failure(response.status()) {
            return Ok(response);
        }

        if state.dpop_key.is_some() {
            if let Some(final_url) = ResponseUrl::of(&response).filter(|u| **u != requested) {
                #[cfg(feature = "tracing")]
                tracing::debug!(%final_url, "replaying DPoP request against redirect target");
                let mut replay = request.clone();
                *replay.uri_mut() = final_url.as_str().parse().map_err(http::Error::from)?;
                response = self.send_with(&state, replay).await?;
                if !is_auth_failure(response.status()) {
                    return Ok(response);
                }
            }
        }

        if self.inner.refresh.is_none() {
            return Ok(response);
        }
        match self.refresh_after_failure(&state.access_token).await {
            Ok(fresh) => self.send_with(&fresh, request).await,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "refresh after rejected request failed");
                Ok(response)
            }
        }
    }

    async fn send_with(
        &self,
        state: &SessionState,
        mut request: Request<Vec<u8>>,
    ) -> Result<Response<Vec<u8>>> {
        match &state.dpop_key {
            Some(key) => {
                request.headers_mut().insert(
                    AUTHORIZATION,
                    format!("DPoP {}", state.access_token).parse()?,
                );
                Ok(send_with_dpop(
                    &self.inner.client,
                    key,
                    false,
                    Some(&state.access_token),
                    request,
                )
                .await?)
            }
            None => {
                request.headers_mut().insert(
                    AUTHORIZATION,
                    format!("Bearer {}", state.access_token).parse()?,
                );
                self.inner
                    .client
                    .send_http(request)
                    .await
                    .map_err(AuthError::transport)
            }
        }
    }

    /// Refresh unless another caller already replaced `failed_token`.
    async fn refresh_after_failure(&self, failed_token: &str) -> Result<SessionState> {
        let _guard = self.inner.refresh_lock.lock().await;
        let current = self.state().await;
        if current.access_token != failed_token {
            return Ok(current);
        }
        run_refresh(&self.inner, &current).await
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// One refresh cycle: run the grant, swap credentials, re-arm the timer.
async fn run_refresh<C>(inner: &Arc<Inner<C>>, current: &SessionState) -> Result<SessionState>
where
    C: HttpClient + Send + Sync + 'static,
{
    let Some(refresh) = inner.refresh.as_ref() else {
        return Err(AuthError::no_refresh_token(""));
    };
    let tokens = refresh
        .refresher
        .refresh(
            &refresh.session_id,
            current.refresh_token.as_deref(),
            current.dpop_key.as_ref(),
        )
        .await?;
    let expires_in = tokens.expires_in;
    let state = inner.apply(tokens).await;
    inner.emit(SessionEvent::SessionExtended {
        expires_in: expires_in.unwrap_or(inner.default_expires_in.as_secs() as i64),
    });
    schedule_refresh(inner, expires_in, state.access_token.clone());
    Ok(state)
}

/// Arm the proactive refresh for the credentials holding `access_token`.
fn schedule_refresh<C>(inner: &Arc<Inner<C>>, expires_in: Option<i64>, access_token: SmolStr)
where
    C: HttpClient + Send + Sync + 'static,
{
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        #[cfg(feature = "tracing")]
        tracing::warn!("no tokio runtime; proactive token refresh disabled");
        return;
    };
    let delay = refresh_delay(expires_in, inner.refresh_skew, inner.default_expires_in);
    let weak = Arc::downgrade(inner);
    let task = async move {
        tokio::time::sleep(delay).await;
        proactive_refresh(weak, access_token).await;
    };
    #[cfg(feature = "tracing")]
    let task = tracing::Instrument::instrument(
        task,
        tracing::info_span!("refresh_timer", delay_secs = delay.as_secs()),
    );
    let handle = runtime.spawn(task);
    let id = RefreshTimerId(inner.next_timer_id.fetch_add(1, Ordering::Relaxed));
    if let Ok(mut timer) = inner.timer.lock() {
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
    }
    inner.emit(SessionEvent::TimeoutSet(id));
}

async fn proactive_refresh<C>(weak: Weak<Inner<C>>, scheduled_for: SmolStr)
where
    C: HttpClient + Send + Sync + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    // this task is finishing; forget its handle so re-arming does not abort it
    if let Ok(mut timer) = inner.timer.lock() {
        timer.take();
    }
    let _guard = inner.refresh_lock.lock().await;
    let current = inner.state.read().await.clone();
    // a reactive refresh got here first and armed its own timer
    if current.access_token != scheduled_for {
        #[cfg(feature = "tracing")]
        tracing::debug!("token already replaced; skipping proactive refresh");
        return;
    }
    if let Err(e) = run_refresh(&inner, &current).await {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %e, "proactive token refresh failed");
        let (code, description) = e.event_payload();
        inner.emit(SessionEvent::Error { code, description });
        if e.is_invalid_grant() {
            inner.emit(SessionEvent::SessionExpired);
        }
    }
}
