use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use elliptic_curve::SecretKey;
use http::{Request, Response, header::InvalidHeaderValue};
use jose_jwa::{Algorithm, Signing};
use jose_jwk::{Class, Jwk, Key, Parameters, crypto};
use p256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::ThreadRng;
use serde::Serialize;
use sha2::Digest;
use smol_str::SmolStr;
use solid_authn_common::HttpClient;
use url::Url;

use crate::{
    jose::{
        self, create_signed_jwt,
        jws::RegisteredHeader,
        jwt::{Claims, PublicClaims, RegisteredClaims},
    },
    utils::random_uuid,
};

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";

#[derive(serde::Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(code(solid_authn::dpop::header))]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
    #[error("none of the algorithms {0:?} can be used for a DPoP key")]
    #[diagnostic(
        code(solid_authn::dpop::unsupported_key),
        help("ES256 is the only supported DPoP signing algorithm")
    )]
    UnsupportedKey(Vec<SmolStr>),
    #[error(transparent)]
    #[diagnostic(code(solid_authn::dpop::serde_json))]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Jose(#[from] jose::Error),
    #[error("Inner: {0}")]
    #[diagnostic(code(solid_authn::dpop::transport))]
    Inner(#[source] Box<dyn std::error::Error + Send + Sync>),
}

type Result<T> = core::result::Result<T, Error>;

/// Proof-of-possession key pair.
///
/// The private half only ever lives in memory. Serializing a `KeyPair` writes the public
/// JWK and nothing else.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey<p256::NistP256>,
    public: Jwk,
}

impl KeyPair {
    /// Fresh ES256 key pair.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::<p256::NistP256>::random(&mut ThreadRng::default()))
    }

    pub fn from_secret(secret: SecretKey<p256::NistP256>) -> Self {
        let public = Jwk {
            key: Key::from(&crypto::Key::from(secret.public_key())),
            prm: Parameters {
                alg: Some(Algorithm::Signing(Signing::Es256)),
                cls: Some(Class::Signing),
                ..Default::default()
            },
        };
        Self { secret, public }
    }

    /// Public JWK with its algorithm pinned.
    pub fn public_jwk(&self) -> &Jwk {
        &self.public
    }

    pub fn algorithm(&self) -> &'static str {
        "ES256"
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(self.secret.public_key())
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from(self.secret.clone())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Serialize for KeyPair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct PublicOnly<'a> {
            public_key: &'a Jwk,
        }
        PublicOnly {
            public_key: &self.public,
        }
        .serialize(serializer)
    }
}

/// Generate a key pair for the first usable algorithm in `preferred`.
pub fn generate_key_pair<S: AsRef<str>>(preferred: &[S]) -> Result<KeyPair> {
    for alg in preferred {
        #[allow(clippy::single_match)]
        match alg.as_ref() {
            "ES256" => return Ok(KeyPair::generate()),
            _ => {}
        }
    }
    Err(Error::UnsupportedKey(
        preferred.iter().map(|a| SmolStr::new(a.as_ref())).collect(),
    ))
}

/// `htu` form of a URL: no fragment, no userinfo. A bare origin serializes with a
/// trailing slash.
pub fn normalize_htu(url: &Url) -> SmolStr {
    let mut url = url.clone();
    url.set_fragment(None);
    // only fails for cannot-be-a-base URLs, which have no userinfo anyway
    let _ = url.set_username("");
    let _ = url.set_password(None);
    SmolStr::new(url.as_str())
}

/// Build a DPoP proof for `method` against `url`.
pub fn create_proof(url: &Url, method: &str, key: &KeyPair) -> Result<SmolStr> {
    build_dpop_proof(key, method, url, None, None)
}

/// Compact JWS (ES256) for DPoP with embedded public JWK.
///
/// `access_token` adds the `ath` claim, `nonce` echoes a server-provided `DPoP-Nonce`.
pub fn build_dpop_proof(
    key: &KeyPair,
    method: &str,
    url: &Url,
    nonce: Option<&str>,
    access_token: Option<&str>,
) -> Result<SmolStr> {
    let mut header = RegisteredHeader::from(Algorithm::Signing(Signing::Es256));
    header.typ = Some(JWT_HEADER_TYP_DPOP.into());
    header.jwk = Some(key.public.clone());

    let claims = Claims {
        registered: RegisteredClaims {
            jti: Some(random_uuid()),
            iat: Some(Utc::now().timestamp()),
            ..Default::default()
        },
        public: PublicClaims {
            htm: Some(SmolStr::new(method.to_ascii_uppercase())),
            htu: Some(normalize_htu(url)),
            // https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
            ath: access_token.map(|t| URL_SAFE_NO_PAD.encode(sha2::Sha256::digest(t)).into()),
            nonce: nonce.map(SmolStr::new),
        },
    };
    Ok(create_signed_jwt(&key.signing_key(), &header, &claims)?)
}

/// Attach a proof to `request` and send it, retrying once if the server asks for a
/// `DPoP-Nonce`.
///
/// `is_to_auth_server` selects which nonce challenge to recognise: a 400
/// `use_dpop_nonce` body from the token endpoint, or a 401 `WWW-Authenticate` from a
/// resource server.
pub async fn send_with_dpop<T>(
    client: &T,
    key: &KeyPair,
    is_to_auth_server: bool,
    access_token: Option<&str>,
    mut request: Request<Vec<u8>>,
) -> Result<Response<Vec<u8>>>
where
    T: HttpClient,
{
    let method = request.method().as_str().to_owned();
    let url = Url::parse(&request.uri().to_string())
        .map_err(|e| Error::Inner(Box::new(e)))?;

    let proof = build_dpop_proof(key, &method, &url, None, access_token)?;
    request.headers_mut().insert("DPoP", proof.parse()?);
    let response = client
        .send_http(request.clone())
        .await
        .map_err(|e| Error::Inner(e.into()))?;

    let Some(nonce) = response
        .headers()
        .get("DPoP-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(SmolStr::new)
    else {
        return Ok(response);
    };
    if !is_use_dpop_nonce_error(is_to_auth_server, &response) {
        return Ok(response);
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(%url, "retrying with server-provided DPoP nonce");

    let proof = build_dpop_proof(key, &method, &url, Some(&nonce), access_token)?;
    request.headers_mut().insert("DPoP", proof.parse()?);
    client
        .send_http(request)
        .await
        .map_err(|e| Error::Inner(e.into()))
}

#[inline]
fn is_use_dpop_nonce_error(is_to_auth_server: bool, response: &Response<Vec<u8>>) -> bool {
    // https://datatracker.ietf.org/doc/html/rfc9449#name-authorization-server-provid
    if is_to_auth_server {
        if response.status() == 400 {
            if let Ok(res) = serde_json::from_slice::<ErrorResponse>(response.body()) {
                return res.error == "use_dpop_nonce";
            };
        }
    }
    // https://datatracker.ietf.org/doc/html/rfc9449#name-resource-server-provided-no
    else if response.status() == 401 {
        if let Some(www_auth) = response
            .headers()
            .get("WWW-Authenticate")
            .and_then(|v| v.to_str().ok())
        {
            return www_auth.starts_with("DPoP") && www_auth.contains(r#"error="use_dpop_nonce""#);
        }
    }
    false
}
