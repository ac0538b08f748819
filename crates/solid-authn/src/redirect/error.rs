use url::Url;

use super::{ErrorCallback, HandlerContext, RedirectResult, query_param};
use crate::{events::SessionEvent, utils::random_uuid};

pub(super) fn can_handle(url: &Url) -> bool {
    url.query_pairs().any(|(k, _)| k == "error")
}

/// Report the provider's error and hand back a logged-out session.
pub(super) fn handle<C>(
    ctx: &HandlerContext<C>,
    url: &Url,
    on_error: Option<&ErrorCallback>,
) -> RedirectResult<C> {
    let error = query_param(url, "error").unwrap_or_default();
    let description =
        query_param(url, "error_description").or_else(|| query_param(url, "errorDescription"));

    #[cfg(feature = "tracing")]
    tracing::info!(%error, ?description, "identity provider redirected with an error");

    if let Some(callback) = on_error {
        callback(&error, description.as_deref());
    }
    ctx.emitter.emit(SessionEvent::Error {
        code: error,
        description,
    });
    RedirectResult::unauthenticated(random_uuid())
}
