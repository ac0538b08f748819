use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Claims {
    #[serde(flatten)]
    pub registered: RegisteredClaims,
    #[serde(flatten)]
    pub public: PublicClaims,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegisteredClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<RegisteredClaimsAud>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<SmolStr>,
}

// https://datatracker.ietf.org/doc/html/rfc9449#section-4.2
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PublicClaims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htm: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htu: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<SmolStr>,
}

impl From<RegisteredClaims> for Claims {
    fn from(registered: RegisteredClaims) -> Self {
        Self {
            registered,
            public: PublicClaims::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisteredClaimsAud {
    Single(SmolStr),
    Multiple(Vec<SmolStr>),
}

impl RegisteredClaimsAud {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            Self::Single(s) => s == value,
            Self::Multiple(v) => v.iter().any(|s| s == value),
        }
    }
}

/// ID token claims. Anything beyond the registered set is kept in `extra`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct IdTokenClaims {
    #[serde(flatten)]
    pub registered: RegisteredClaims,
    #[serde(default)]
    pub webid: Option<SmolStr>,
    #[serde(default)]
    pub azp: Option<SmolStr>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
