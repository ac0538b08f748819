use url::Url;

/// End-session URL for RP-initiated logout, if the provider has an endpoint.
///
/// `state` is only sent along with a `post_logout_redirect_uri`, since without one the
/// provider has nowhere to echo it back to.
// https://openid.net/specs/openid-connect-rpinitiated-1_0.html#RPLogout
pub fn maybe_build_rp_initiated_logout(
    end_session_endpoint: Option<&str>,
    id_token_hint: Option<&str>,
    post_logout_redirect_uri: Option<&str>,
    state: Option<&str>,
) -> Option<Url> {
    let mut url = Url::parse(end_session_endpoint?).ok()?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(hint) = id_token_hint {
            query.append_pair("id_token_hint", hint);
        }
        if let Some(redirect) = post_logout_redirect_uri {
            query.append_pair("post_logout_redirect_uri", redirect);
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Some(url)
}
