use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Provider metadata in the shape the client works with.
///
/// Built from a [`DiscoveryDocument`]; this is also the form persisted in storage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IssuerConfig {
    pub issuer: SmolStr,
    pub authorization_endpoint: SmolStr,
    #[serde(default)]
    pub token_endpoint: Option<SmolStr>,
    #[serde(default)]
    pub userinfo_endpoint: Option<SmolStr>,
    pub jwks_uri: SmolStr,
    #[serde(default)]
    pub registration_endpoint: Option<SmolStr>,
    #[serde(default)]
    pub end_session_endpoint: Option<SmolStr>,
    pub scopes_supported: Vec<SmolStr>,
    #[serde(default)]
    pub response_types_supported: Vec<SmolStr>,
    #[serde(default)]
    pub response_modes_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub grant_types_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub acr_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub subject_types_supported: Vec<SmolStr>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub id_token_encryption_alg_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub id_token_encryption_enc_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub userinfo_signing_alg_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub userinfo_encryption_alg_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub userinfo_encryption_enc_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub request_object_signing_alg_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub request_object_encryption_alg_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub request_object_encryption_enc_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub token_endpoint_auth_signing_alg_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub display_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub claim_types_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub claims_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub service_documentation: Option<SmolStr>,
    #[serde(default)]
    pub claims_locales_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub ui_locales_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub claims_parameter_supported: Option<bool>,
    #[serde(default)]
    pub request_parameter_supported: Option<bool>,
    #[serde(default)]
    pub request_uri_parameter_supported: Option<bool>,
    #[serde(default)]
    pub require_request_uri_registration: Option<bool>,
    #[serde(default)]
    pub op_policy_uri: Option<SmolStr>,
    #[serde(default)]
    pub op_tos_uri: Option<SmolStr>,
    #[serde(default)]
    pub code_challenge_methods_supported: Option<Vec<SmolStr>>,
    // https://datatracker.ietf.org/doc/html/rfc9207#section-3
    #[serde(default)]
    pub authorization_response_iss_parameter_supported: Option<bool>,
    // https://datatracker.ietf.org/doc/html/rfc9449#section-5.1
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Option<Vec<SmolStr>>,
}

impl IssuerConfig {
    pub fn supports_grant(&self, grant: &str) -> bool {
        self.grant_types_supported
            .as_ref()
            .is_some_and(|g| g.iter().any(|s| s == grant))
    }

    pub fn supports_scope(&self, scope: &str) -> bool {
        self.scopes_supported.iter().any(|s| s == scope)
    }
}

/// `/.well-known/openid-configuration` as served. Unknown keys are dropped.
// https://openid.net/specs/openid-connect-discovery-1_0.html#ProviderMetadata
#[derive(Deserialize, Debug, Clone, Default)]
pub struct DiscoveryDocument {
    pub issuer: SmolStr,
    pub authorization_endpoint: SmolStr,
    pub token_endpoint: Option<SmolStr>,
    pub userinfo_endpoint: Option<SmolStr>,
    pub jwks_uri: SmolStr,
    pub registration_endpoint: Option<SmolStr>,
    pub end_session_endpoint: Option<SmolStr>,
    pub scopes_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub response_types_supported: Vec<SmolStr>,
    pub response_modes_supported: Option<Vec<SmolStr>>,
    pub grant_types_supported: Option<Vec<SmolStr>>,
    pub acr_values_supported: Option<Vec<SmolStr>>,
    #[serde(default)]
    pub subject_types_supported: Vec<SmolStr>,
    pub id_token_signing_alg_values_supported: Option<Vec<SmolStr>>,
    pub id_token_encryption_alg_values_supported: Option<Vec<SmolStr>>,
    pub id_token_encryption_enc_values_supported: Option<Vec<SmolStr>>,
    pub userinfo_signing_alg_values_supported: Option<Vec<SmolStr>>,
    pub userinfo_encryption_alg_values_supported: Option<Vec<SmolStr>>,
    pub userinfo_encryption_enc_values_supported: Option<Vec<SmolStr>>,
    pub request_object_signing_alg_values_supported: Option<Vec<SmolStr>>,
    pub request_object_encryption_alg_values_supported: Option<Vec<SmolStr>>,
    pub request_object_encryption_enc_values_supported: Option<Vec<SmolStr>>,
    pub token_endpoint_auth_methods_supported: Option<Vec<SmolStr>>,
    pub token_endpoint_auth_signing_alg_values_supported: Option<Vec<SmolStr>>,
    pub display_values_supported: Option<Vec<SmolStr>>,
    pub claim_types_supported: Option<Vec<SmolStr>>,
    pub claims_supported: Option<Vec<SmolStr>>,
    pub service_documentation: Option<SmolStr>,
    pub claims_locales_supported: Option<Vec<SmolStr>>,
    pub ui_locales_supported: Option<Vec<SmolStr>>,
    pub claims_parameter_supported: Option<bool>,
    pub request_parameter_supported: Option<bool>,
    pub request_uri_parameter_supported: Option<bool>,
    pub require_request_uri_registration: Option<bool>,
    pub op_policy_uri: Option<SmolStr>,
    pub op_tos_uri: Option<SmolStr>,
    pub code_challenge_methods_supported: Option<Vec<SmolStr>>,
    pub authorization_response_iss_parameter_supported: Option<bool>,
    pub dpop_signing_alg_values_supported: Option<Vec<SmolStr>>,
}

impl From<DiscoveryDocument> for IssuerConfig {
    fn from(doc: DiscoveryDocument) -> Self {
        let scopes_supported = match doc.scopes_supported {
            Some(scopes) if !scopes.is_empty() => scopes,
            _ => vec![SmolStr::new_static("openid")],
        };
        Self {
            issuer: doc.issuer,
            authorization_endpoint: doc.authorization_endpoint,
            token_endpoint: doc.token_endpoint,
            userinfo_endpoint: doc.userinfo_endpoint,
            jwks_uri: doc.jwks_uri,
            registration_endpoint: doc.registration_endpoint,
            end_session_endpoint: doc.end_session_endpoint,
            scopes_supported,
            response_types_supported: doc.response_types_supported,
            response_modes_supported: doc.response_modes_supported,
            grant_types_supported: doc.grant_types_supported,
            acr_values_supported: doc.acr_values_supported,
            subject_types_supported: doc.subject_types_supported,
            id_token_signing_alg_values_supported: doc.id_token_signing_alg_values_supported,
            id_token_encryption_alg_values_supported: doc.id_token_encryption_alg_values_supported,
            id_token_encryption_enc_values_supported: doc.id_token_encryption_enc_values_supported,
            userinfo_signing_alg_values_supported: doc.userinfo_signing_alg_values_supported,
            userinfo_encryption_alg_values_supported: doc.userinfo_encryption_alg_values_supported,
            userinfo_encryption_enc_values_supported: doc.userinfo_encryption_enc_values_supported,
            request_object_signing_alg_values_supported: doc
                .request_object_signing_alg_values_supported,
            request_object_encryption_alg_values_supported: doc
                .request_object_encryption_alg_values_supported,
            request_object_encryption_enc_values_supported: doc
                .request_object_encryption_enc_values_supported,
            token_endpoint_auth_methods_supported: doc.token_endpoint_auth_methods_supported,
            token_endpoint_auth_signing_alg_values_supported: doc
                .token_endpoint_auth_signing_alg_values_supported,
            display_values_supported: doc.display_values_supported,
            claim_types_supported: doc.claim_types_supported,
            claims_supported: doc.claims_supported,
            service_documentation: doc.service_documentation,
            claims_locales_supported: doc.claims_locales_supported,
            ui_locales_supported: doc.ui_locales_supported,
            claims_parameter_supported: doc.claims_parameter_supported,
            request_parameter_supported: doc.request_parameter_supported,
            request_uri_parameter_supported: doc.request_uri_parameter_supported,
            require_request_uri_registration: doc.require_request_uri_registration,
            op_policy_uri: doc.op_policy_uri,
            op_tos_uri: doc.op_tos_uri,
            code_challenge_methods_supported: doc.code_challenge_methods_supported,
            authorization_response_iss_parameter_supported: doc
                .authorization_response_iss_parameter_supported,
            dpop_signing_alg_values_supported: doc.dpop_signing_alg_values_supported,
        }
    }
}
