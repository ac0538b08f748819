use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{CryptoRng, RngCore, rngs::ThreadRng};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use url::Url;

/// Query and fragment parameters that only make sense for the redirect that carried them.
pub const OPENID_PARAMS: &[&str] = &[
    "code",
    "state",
    "iss",
    "id_token",
    "access_token",
    "token_type",
    "expires_in",
    "session_state",
];

pub fn generate_state() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 16>(&mut ThreadRng::default()))
        .into()
}

pub fn generate_verifier() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, 43>(&mut ThreadRng::default()))
        .into()
}

pub fn get_random_values<R, const LEN: usize>(rng: &mut R) -> [u8; LEN]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0u8; LEN];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Returns `(challenge, verifier)`.
pub fn generate_pkce() -> (SmolStr, SmolStr) {
    // https://datatracker.ietf.org/doc/html/rfc7636#section-4.1
    let verifier = generate_verifier();
    (pkce_challenge(&verifier), verifier)
}

pub fn pkce_challenge(verifier: &str) -> SmolStr {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier)).into()
}

/// Random (version 4) UUID in its hyphenated lowercase form.
pub fn random_uuid() -> SmolStr {
    let mut bytes = get_random_values::<_, 16>(&mut ThreadRng::default());
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    smol_str::format_smolstr!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

pub fn is_valid_url(s: &str) -> bool {
    Url::parse(s).is_ok()
}

/// Look a parameter up in the query, then in the fragment.
pub fn find_param(url: &Url, name: &str) -> Option<SmolStr> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| SmolStr::new(v))
        .or_else(|| {
            let fragment = url.fragment()?;
            form_pairs(fragment)
                .into_iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v)
        })
}

fn form_pairs(s: &str) -> Vec<(SmolStr, SmolStr)> {
    url::form_urlencoded::parse(s.as_bytes())
        .map(|(k, v)| (SmolStr::new(k), SmolStr::new(v)))
        .collect()
}

/// Strip the authorization-response parameters from both the query and the fragment.
pub fn remove_openid_params(url: &Url) -> Url {
    let mut cleaned = url.clone();

    let query: Vec<(SmolStr, SmolStr)> = url
        .query_pairs()
        .filter(|(k, _)| !OPENID_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (SmolStr::new(k), SmolStr::new(v)))
        .collect();
    if query.is_empty() {
        cleaned.set_query(None);
    } else {
        cleaned.query_pairs_mut().clear().extend_pairs(query);
    }

    if let Some(fragment) = url.fragment() {
        let pairs = form_pairs(fragment);
        // fragments that are not parameter lists (`#me`) are kept as they are
        let is_param_list = fragment.contains('=');
        if is_param_list {
            let kept: Vec<_> = pairs
                .into_iter()
                .filter(|(k, _)| !OPENID_PARAMS.contains(&k.as_str()))
                .collect();
            if kept.is_empty() {
                cleaned.set_fragment(None);
            } else {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(kept)
                    .finish();
                cleaned.set_fragment(Some(&encoded));
            }
        }
    }
    cleaned
}
