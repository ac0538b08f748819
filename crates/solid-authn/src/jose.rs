//! Compact JWS/JWT encoding for DPoP proofs and ID tokens.

pub mod jws;
pub mod jwt;
pub mod signing;

pub use self::signing::{CompactJws, create_signed_jwt, verify_es256, verify_rs256};

#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum Error {
    #[error("malformed compact JWS: expected three dot-separated segments")]
    #[diagnostic(code(solid_authn::jose::malformed))]
    Malformed,
    #[error(transparent)]
    #[diagnostic(code(solid_authn::jose::base64))]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    #[diagnostic(code(solid_authn::jose::serde_json))]
    SerdeJson(#[from] serde_json::Error),
    #[error("signature verification failed")]
    #[diagnostic(code(solid_authn::jose::signature))]
    Signature(#[from] signature::Error),
    #[error("unsupported algorithm {0}")]
    #[diagnostic(
        code(solid_authn::jose::unsupported_alg),
        help("only ES256 and RS256 signatures are supported")
    )]
    UnsupportedAlgorithm(String),
}
