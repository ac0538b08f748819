//! Deriving the authenticated WebID from an ID token.

use chrono::Utc;
use http::{Request, StatusCode};
use jose_jwk::{JwkSet, crypto};
use p256::ecdsa::VerifyingKey;
use smol_str::SmolStr;
use solid_authn_common::HttpClient;
use url::Url;

use crate::{
    error::{AuthError, Result},
    jose::{CompactJws, jwt::IdTokenClaims, verify_es256, verify_rs256},
};

/// ID token signature algorithms [`JwksWebIdVerifier`] can check.
pub const SUPPORTED_ID_TOKEN_ALGS: &[&str] = &["ES256", "RS256"];

/// Clock skew tolerated on `exp`, in seconds.
pub const EXP_LEEWAY_SECS: i64 = 60;

/// Subject and client resolved from a verified ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebIdClaims {
    pub web_id: SmolStr,
    pub client_id: Option<SmolStr>,
}

/// Validates an ID token against the issuer's keys and extracts its WebID.
#[async_trait::async_trait]
pub trait WebIdVerifier: Send + Sync {
    async fn verify(
        &self,
        id_token: &str,
        jwks_uri: &str,
        issuer: &str,
        client_id: &str,
    ) -> Result<WebIdClaims>;
}

/// `webid` claim if present, else `sub` when it is itself a URL.
pub fn web_id_from_claims(claims: &IdTokenClaims) -> Result<WebIdClaims> {
    let web_id = match (&claims.webid, &claims.registered.sub) {
        (Some(webid), _) => webid.clone(),
        (None, Some(sub)) if Url::parse(sub).is_ok() => sub.clone(),
        (None, Some(sub)) => {
            return Err(AuthError::token_verification(smol_str::format_smolstr!(
                "The ID token has no 'webid' claim, and its 'sub' claim of [{sub}] is not a valid URL"
            )));
        }
        (None, None) => {
            return Err(AuthError::token_verification(
                "The ID token has neither a 'webid' nor a 'sub' claim",
            ));
        }
    };
    Ok(WebIdClaims {
        web_id,
        client_id: claims.azp.clone(),
    })
}

/// Check `iss`, `aud` and `exp` of already signature-checked claims.
pub fn check_registered_claims(
    claims: &IdTokenClaims,
    issuer: &str,
    client_id: &str,
    now: i64,
) -> Result<()> {
    let registered = &claims.registered;
    match registered.iss.as_deref() {
        Some(iss) if crate::issuer::issuer_equivalent(iss, issuer) => {}
        other => {
            return Err(AuthError::token_verification(smol_str::format_smolstr!(
                "Expected issuer [{issuer}], the ID token has [{}]",
                other.unwrap_or("none")
            )));
        }
    }
    if !registered.aud.as_ref().is_some_and(|aud| aud.contains(client_id)) {
        return Err(AuthError::token_verification(smol_str::format_smolstr!(
            "The ID token audience does not include the client [{client_id}]"
        )));
    }
    match registered.exp {
        Some(exp) if exp + EXP_LEEWAY_SECS >= now => Ok(()),
        Some(_) => Err(AuthError::token_verification("The ID token has expired")),
        None => Err(AuthError::token_verification("The ID token has no 'exp' claim")),
    }
}

/// Verifies ES256 and RS256 ID tokens with keys fetched from the issuer's JWKS endpoint.
pub struct JwksWebIdVerifier<C> {
    client: C,
}

impl<C: HttpClient> JwksWebIdVerifier<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet> {
        let req = Request::builder()
            .uri(jwks_uri)
            .header("Accept", "application/json")
            .body(Vec::new())?;
        let res = self
            .client
            .send_http(req)
            .await
            .map_err(AuthError::transport)?;
        if res.status() != StatusCode::OK {
            return Err(AuthError::http_status(res.status()).with_url(jwks_uri));
        }
        Ok(serde_json::from_slice(res.body())?)
    }
}

/// Issuer key able to check an ID token signature.
enum IdTokenKey {
    Es256(VerifyingKey),
    Rs256(rsa::RsaPublicKey),
}

impl IdTokenKey {
    fn for_alg(alg: &str, key: crypto::Key) -> Option<Self> {
        match (alg, key) {
            ("ES256", crypto::Key::P256(crypto::Kind::Public(pk))) => {
                Some(Self::Es256(VerifyingKey::from(pk)))
            }
            ("RS256", crypto::Key::Rsa(crypto::Kind::Public(pk))) => Some(Self::Rs256(pk)),
            _ => None,
        }
    }

    fn verify(&self, jws: &CompactJws<'_>) -> Result<()> {
        match self {
            Self::Es256(key) => verify_es256(jws, key),
            Self::Rs256(key) => verify_rs256(jws, key),
        }
        .map_err(token_error)
    }
}

/// Key for `kid` usable with `alg`, or the only such key when the token names no kid.
fn select_key(jwks: &JwkSet, alg: &str, kid: Option<&str>) -> Result<IdTokenKey> {
    let mut candidates: Vec<_> = jwks
        .keys
        .iter()
        .filter(|jwk| match kid {
            Some(kid) => jwk.prm.kid.as_deref() == Some(kid),
            None => true,
        })
        .filter_map(|jwk| crypto::Key::try_from(&jwk.key).ok())
        .filter_map(|key| IdTokenKey::for_alg(alg, key))
        .collect();
    match candidates.len() {
        1 => Ok(candidates.remove(0)),
        0 => Err(AuthError::token_verification(smol_str::format_smolstr!(
            "No {alg} key in the issuer's JWKS matches kid [{}]",
            kid.unwrap_or("none")
        ))),
        _ => Err(AuthError::token_verification(smol_str::format_smolstr!(
            "The ID token names no kid and the issuer's JWKS holds several {alg} keys"
        ))),
    }
}

#[async_trait::async_trait]
impl<C> WebIdVerifier for JwksWebIdVerifier<C>
where
    C: HttpClient + Send + Sync,
{
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = issuer)))]
    async fn verify(
        &self,
        id_token: &str,
        jwks_uri: &str,
        issuer: &str,
        client_id: &str,
    ) -> Result<WebIdClaims> {
        let jws = CompactJws::parse(id_token).map_err(token_error)?;
        let header = jws.header().map_err(token_error)?;
        if !SUPPORTED_ID_TOKEN_ALGS.contains(&header.alg.as_str()) {
            return Err(AuthError::token_verification(smol_str::format_smolstr!(
                "Unsupported ID token signature algorithm [{}]",
                header.alg
            )));
        }
        let jwks = self.fetch_jwks(jwks_uri).await?;
        select_key(&jwks, &header.alg, header.kid.as_deref())?.verify(&jws)?;

        let claims: IdTokenClaims = jws.claims().map_err(token_error)?;
        check_registered_claims(&claims, issuer, client_id, Utc::now().timestamp())?;
        web_id_from_claims(&claims)
    }
}

fn token_error(e: crate::jose::Error) -> AuthError {
    let msg = smol_str::format_smolstr!("{e}");
    AuthError::new(
        crate::error::AuthErrorKind::TokenVerification(msg),
        Some(Box::new(e)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpop::KeyPair;
    use crate::error::AuthErrorKind;
    use crate::jose::{create_signed_jwt, jws::RegisteredHeader};
    use core::future::Future;
    use jose_jwa::{Algorithm, Signing};
    use std::convert::Infallible;

    struct JwksServer(serde_json::Value);

    impl HttpClient for JwksServer {
        type Error = Infallible;
        fn send_http(
            &self,
            _request: http::Request<Vec<u8>>,
        ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> + Send
        {
            let body = serde_json::to_vec(&self.0).unwrap();
            async move { Ok(http::Response::builder().status(200).body(body).unwrap()) }
        }
    }

    fn signer() -> p256::SecretKey {
        p256::SecretKey::random(&mut rand::rngs::ThreadRng::default())
    }

    fn sign(secret: &p256::SecretKey, kid: &str, claims: serde_json::Value) -> String {
        let signing = p256::ecdsa::SigningKey::from(secret.clone());
        let mut header = RegisteredHeader::from(Algorithm::Signing(Signing::Es256));
        header.kid = Some(kid.into());
        create_signed_jwt(&signing, &header, &claims).unwrap().to_string()
    }

    fn jwks_for(secret: &p256::SecretKey, kid: &str) -> serde_json::Value {
        let mut jwk = serde_json::to_value(KeyPair::from_secret(secret.clone()).public_jwk()).unwrap();
        jwk["kid"] = kid.into();
        serde_json::json!({ "keys": [jwk] })
    }

    fn claims(extra: serde_json::Value) -> serde_json::Value {
        let mut base = serde_json::json!({
            "iss": "https://idp.example/",
            "aud": ["https://app.example/id"],
            "sub": "alice",
            "exp": Utc::now().timestamp() + 300,
            "azp": "https://app.example/id",
        });
        for (k, v) in extra.as_object().unwrap() {
            base[k] = v.clone();
        }
        base
    }

    async fn verify_token(token: &str, jwks: serde_json::Value) -> Result<WebIdClaims> {
        JwksWebIdVerifier::new(JwksServer(jwks))
            .verify(
                token,
                "https://idp.example/jwks",
                "https://idp.example",
                "https://app.example/id",
            )
            .await
    }

    #[tokio::test]
    async fn verifies_and_extracts_webid() {
        let secret = signer();
        let token = sign(
            &secret,
            "k1",
            claims(serde_json::json!({"webid": "https://alice.example/profile#me"})),
        );
        let out = verify_token(&token, jwks_for(&secret, "k1")).await.unwrap();
        assert_eq!(out.web_id, "https://alice.example/profile#me");
        assert_eq!(out.client_id.as_deref(), Some("https://app.example/id"));
    }

    #[tokio::test]
    async fn rejects_foreign_signature() {
        let token = sign(&signer(), "k1", claims(serde_json::json!({})));
        let err = verify_token(&token, jwks_for(&signer(), "k1")).await.unwrap_err();
        assert!(matches!(err.kind(), AuthErrorKind::TokenVerification(_)));
    }

    #[tokio::test]
    async fn rejects_wrong_audience() {
        let secret = signer();
        let token = sign(
            &secret,
            "k1",
            claims(serde_json::json!({"aud": "https://someone-else.example"})),
        );
        let err = verify_token(&token, jwks_for(&secret, "k1")).await.unwrap_err();
        assert!(err.to_string().contains("audience"));
    }

    fn rsa_signer() -> rsa::RsaPrivateKey {
        rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap()
    }

    fn sign_rs256(key: &rsa::RsaPrivateKey, kid: &str, claims: serde_json::Value) -> String {
        use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
        use rsa::signature::{SignatureEncoding, Signer};

        let header = serde_json::json!({"alg": "RS256", "typ": "JWT", "kid": kid});
        let input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap())
        );
        let signer = rsa::pkcs1v15::SigningKey::<rsa::sha2::Sha256>::new(key.clone());
        let sig = signer.sign(input.as_bytes()).to_bytes();
        format!("{input}.{}", URL_SAFE_NO_PAD.encode(sig))
    }

    fn rsa_jwk(key: &rsa::RsaPrivateKey, kid: &str) -> serde_json::Value {
        let public = rsa::RsaPublicKey::from(key);
        let mut jwk = serde_json::to_value(jose_jwk::Key::Rsa(jose_jwk::Rsa::from(&public))).unwrap();
        jwk["kid"] = kid.into();
        jwk
    }

    #[tokio::test]
    async fn verifies_rs256_token_by_kid() {
        let p256_secret = signer();
        let rsa_key = rsa_signer();
        let other = rsa_signer();
        let mut jwks = jwks_for(&p256_secret, "e1");
        let keys = jwks["keys"].as_array_mut().unwrap();
        keys.push(rsa_jwk(&other, "r0"));
        keys.push(rsa_jwk(&rsa_key, "r1"));

        let token = sign_rs256(
            &rsa_key,
            "r1",
            claims(serde_json::json!({"webid": "https://alice.example/profile#me"})),
        );
        let out = verify_token(&token, jwks.clone()).await.unwrap();
        assert_eq!(out.web_id, "https://alice.example/profile#me");

        // the ES256 key under the same kid must not be used for an RS256 token
        let token = sign_rs256(&rsa_key, "e1", claims(serde_json::json!({})));
        let err = verify_token(&token, jwks).await.unwrap_err();
        assert!(matches!(err.kind(), AuthErrorKind::TokenVerification(_)));
    }

    #[tokio::test]
    async fn rejects_rs256_token_signed_by_other_key() {
        let token = sign_rs256(&rsa_signer(), "r1", claims(serde_json::json!({})));
        let jwks = serde_json::json!({ "keys": [rsa_jwk(&rsa_signer(), "r1")] });
        let err = verify_token(&token, jwks).await.unwrap_err();
        assert!(matches!(err.kind(), AuthErrorKind::TokenVerification(_)));
    }

    #[tokio::test]
    async fn rejects_unsupported_algorithm() {
        use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims(serde_json::json!({}))).unwrap());
        let token = format!("{header}.{body}.c2ln");
        let err = verify_token(&token, serde_json::json!({"keys": []})).await.unwrap_err();
        assert!(err.to_string().contains("HS256"));
    }

    #[test]
    fn webid_falls_back_to_url_sub() {
        let parse = |v: serde_json::Value| serde_json::from_value::<IdTokenClaims>(v).unwrap();

        let out = web_id_from_claims(&parse(serde_json::json!({"sub": "https://bob.example/#me"})))
            .unwrap();
        assert_eq!(out.web_id, "https://bob.example/#me");
        assert_eq!(out.client_id, None);

        let err = web_id_from_claims(&parse(serde_json::json!({"sub": "bob"}))).unwrap_err();
        assert!(matches!(err.kind(), AuthErrorKind::TokenVerification(_)));
    }

    #[test]
    fn expiry_honours_leeway() {
        let parse = |v: serde_json::Value| serde_json::from_value::<IdTokenClaims>(v).unwrap();
        let now = 1_000_000;
        let c = parse(serde_json::json!({
            "iss": "https://idp.example/", "aud": "c", "exp": now - EXP_LEEWAY_SECS + 1
        }));
        assert!(check_registered_claims(&c, "https://idp.example", "c", now).is_ok());
        let c = parse(serde_json::json!({
            "iss": "https://idp.example/", "aud": "c", "exp": now - EXP_LEEWAY_SECS - 1
        }));
        assert!(check_registered_claims(&c, "https://idp.example", "c", now).is_err());
    }
}
