use url::Url;

use super::RedirectResult;
use crate::{
    error::{AuthError, Result},
    utils::random_uuid,
};

/// Any valid URL yields a fresh logged-out session.
pub(super) fn handle<C>(redirect_url: &str) -> Result<RedirectResult<C>> {
    Url::parse(redirect_url).map_err(|e| AuthError::invalid_redirect_url(redirect_url, e))?;
    Ok(RedirectResult::unauthenticated(random_uuid()))
}
