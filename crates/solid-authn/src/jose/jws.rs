use jose_jwa::Algorithm;
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredHeader {
    pub alg: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jku: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cty: Option<SmolStr>,
}

impl From<Algorithm> for RegisteredHeader {
    fn from(alg: Algorithm) -> Self {
        Self {
            alg,
            jku: None,
            jwk: None,
            kid: None,
            typ: None,
            cty: None,
        }
    }
}

/// Header as read from an untrusted token: `alg` is kept as a string so unknown
/// algorithms surface as a verification error rather than a parse error.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct UntrustedHeader {
    pub alg: SmolStr,
    #[serde(default)]
    pub kid: Option<SmolStr>,
    #[serde(default)]
    pub typ: Option<SmolStr>,
    #[serde(default)]
    pub jwk: Option<Jwk>,
}
