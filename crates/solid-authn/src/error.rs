use http::StatusCode;
use smol_str::SmolStr;
use solid_authn_common::{StorageError, TransportError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error for every login, redirect, token and storage operation
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("{kind}")]
pub struct AuthError {
    #[diagnostic_source]
    kind: AuthErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<SmolStr>,
    context: Option<SmolStr>,
    url: Option<SmolStr>,
    details: Option<SmolStr>,
}

/// Error categories
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum AuthErrorKind {
    /// Discovery document missing, unparseable or lacking a required endpoint
    #[error("{0}")]
    #[diagnostic(
        code(solid_authn::configuration),
        help("check the issuer URL and its /.well-known/openid-configuration document")
    )]
    Configuration(SmolStr),

    /// Issuer does not advertise the grant
    #[error("The issuer [{issuer}] does not support the [{grant}] grant")]
    #[diagnostic(
        code(solid_authn::unsupported_grant),
        help("the issuer's grant_types_supported must include this grant")
    )]
    UnsupportedGrant { issuer: SmolStr, grant: SmolStr },

    /// Token endpoint returned an OAuth error object
    #[error(
        "Token endpoint returned error [{error}]{}{}",
        .description.as_ref().map(|d| format!(": {d}")).unwrap_or_default(),
        .uri.as_ref().map(|u| format!(" (see {u})")).unwrap_or_default()
    )]
    #[diagnostic(code(solid_authn::oidc_provider))]
    OidcProvider {
        error: SmolStr,
        description: Option<SmolStr>,
        uri: Option<SmolStr>,
    },

    /// Token endpoint response is missing or mistypes a required field
    #[error("{0}")]
    #[diagnostic(code(solid_authn::invalid_response))]
    InvalidResponse(SmolStr),

    /// Correlation state for a redirect is absent from storage
    #[error("{0}")]
    #[diagnostic(
        code(solid_authn::missing_context),
        help("the redirect was already handled, or login was started in another storage context")
    )]
    MissingContext(SmolStr),

    /// Redirect URL cannot be parsed
    #[error("[{0}] is not a valid URL, and cannot be used as a redirect URL")]
    #[diagnostic(code(solid_authn::invalid_redirect_url))]
    InvalidRedirectUrl(SmolStr),

    /// Key generation, signing or signature verification failed
    #[error("cryptographic operation failed")]
    #[diagnostic(code(solid_authn::crypto))]
    Crypto,

    /// A required storage field is absent
    #[error("{0}")]
    #[diagnostic(code(solid_authn::not_stored))]
    NotStored(SmolStr),

    /// Client registration details are inconsistent
    #[error("{0}")]
    #[diagnostic(code(solid_authn::invalid_client))]
    InvalidClient(SmolStr),

    /// Refresh requested for a session without a refresh token
    #[error("Session [{0}] has no refresh token to allow it to refresh its access token")]
    #[diagnostic(code(solid_authn::no_refresh_token))]
    NoRefreshToken(SmolStr),

    /// ID token could not be validated, or carries no usable WebID
    #[error("Token verification failed: {0}")]
    #[diagnostic(code(solid_authn::token_verification))]
    TokenVerification(SmolStr),

    /// Storage backend error
    #[error("storage error")]
    #[diagnostic(code(solid_authn::storage))]
    Storage,

    /// HTTP transport error
    #[error("transport error")]
    #[diagnostic(code(solid_authn::transport))]
    Transport,

    /// HTTP build error
    #[error("http build error")]
    #[diagnostic(code(solid_authn::http_build))]
    HttpBuild,

    /// Unexpected HTTP status
    #[error("http status: {0}")]
    #[diagnostic(
        code(solid_authn::http_status),
        help("see server response for details")
    )]
    HttpStatus(StatusCode),

    /// JSON error
    #[error("json error")]
    #[diagnostic(code(solid_authn::serde_json))]
    SerdeJson,

    /// Form serialization error
    #[error("form serialization error")]
    #[diagnostic(code(solid_authn::serde_form))]
    SerdeHtmlForm,

    /// URL parse error
    #[error("url error")]
    #[diagnostic(code(solid_authn::url))]
    Url,
}

impl AuthError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: AuthErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
            url: None,
            details: None,
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> &AuthErrorKind {
        &self.kind
    }

    /// Get the source error if present
    pub fn source_err(&self) -> Option<&BoxError> {
        self.source.as_ref()
    }

    /// Get the context string if present
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Get the URL if present
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Get the details if present
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Add help text to this error
    pub fn with_help(mut self, help: impl Into<SmolStr>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context to this error
    pub fn with_context(mut self, context: impl Into<SmolStr>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add URL to this error
    pub fn with_url(mut self, url: impl Into<SmolStr>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Add details to this error
    pub fn with_details(mut self, details: impl Into<SmolStr>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Whether the provider rejected the refresh token itself (`invalid_grant`).
    pub fn is_invalid_grant(&self) -> bool {
        matches!(&self.kind, AuthErrorKind::OidcProvider { error, .. } if error == "invalid_grant")
    }

    /// Error code and description suitable for a `SessionEvent::Error`.
    pub fn event_payload(&self) -> (SmolStr, Option<SmolStr>) {
        match &self.kind {
            AuthErrorKind::OidcProvider {
                error, description, ..
            } => (error.clone(), description.clone()),
            other => (
                smol_str::format_smolstr!("{other}"),
                self.context.clone(),
            ),
        }
    }

    // Constructors for each kind

    pub fn configuration(msg: impl Into<SmolStr>) -> Self {
        Self::new(AuthErrorKind::Configuration(msg.into()), None)
    }

    pub fn unsupported_grant(issuer: impl Into<SmolStr>, grant: impl Into<SmolStr>) -> Self {
        Self::new(
            AuthErrorKind::UnsupportedGrant {
                issuer: issuer.into(),
                grant: grant.into(),
            },
            None,
        )
    }

    pub fn oidc_provider(
        error: impl Into<SmolStr>,
        description: Option<SmolStr>,
        uri: Option<SmolStr>,
    ) -> Self {
        Self::new(
            AuthErrorKind::OidcProvider {
                error: error.into(),
                description,
                uri,
            },
            None,
        )
    }

    pub fn invalid_response(msg: impl Into<SmolStr>) -> Self {
        Self::new(AuthErrorKind::InvalidResponse(msg.into()), None)
    }

    /// A required field of the token endpoint response is absent.
    pub fn missing_field(field: &str) -> Self {
        Self::invalid_response(smol_str::format_smolstr!(
            "Invalid response from the token endpoint: missing the field [{field}]"
        ))
    }

    pub fn missing_context(msg: impl Into<SmolStr>) -> Self {
        Self::new(AuthErrorKind::MissingContext(msg.into()), None)
    }

    pub fn invalid_redirect_url(url: impl Into<SmolStr>, source: url::ParseError) -> Self {
        Self::new(
            AuthErrorKind::InvalidRedirectUrl(url.into()),
            Some(Box::new(source)),
        )
    }

    pub fn crypto(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(AuthErrorKind::Crypto, Some(Box::new(source)))
    }

    pub fn not_stored(msg: impl Into<SmolStr>) -> Self {
        Self::new(AuthErrorKind::NotStored(msg.into()), None)
    }

    pub fn invalid_client(msg: impl Into<SmolStr>) -> Self {
        Self::new(AuthErrorKind::InvalidClient(msg.into()), None)
    }

    pub fn no_refresh_token(session_id: impl Into<SmolStr>) -> Self {
        Self::new(AuthErrorKind::NoRefreshToken(session_id.into()), None)
    }

    pub fn token_verification(msg: impl Into<SmolStr>) -> Self {
        Self::new(AuthErrorKind::TokenVerification(msg.into()), None)
    }

    pub fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let msg = smol_str::format_smolstr!("{}", source);
        Self::new(AuthErrorKind::Transport, Some(Box::new(source))).with_context(msg)
    }

    pub fn http_status(status: StatusCode) -> Self {
        Self::new(AuthErrorKind::HttpStatus(status), None)
    }
}

// From impls for common error types

impl From<StorageError> for AuthError {
    fn from(e: StorageError) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(AuthErrorKind::Storage, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify the storage backend is accessible and writable")
    }
}

impl From<TransportError> for AuthError {
    fn from(e: TransportError) -> Self {
        Self::transport(e)
    }
}

impl From<crate::dpop::Error> for AuthError {
    fn from(e: crate::dpop::Error) -> Self {
        if let crate::dpop::Error::Inner(inner) = e {
            let msg = smol_str::format_smolstr!("{}", inner);
            return Self::new(AuthErrorKind::Transport, Some(inner)).with_context(msg);
        }
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(AuthErrorKind::Crypto, Some(Box::new(e)))
            .with_context(msg)
            .with_help("check the DPoP key pair; a broken key cannot be repaired by retrying")
    }
}

impl From<http::Error> for AuthError {
    fn from(e: http::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(AuthErrorKind::HttpBuild, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify request URIs and headers are valid")
    }
}

impl From<http::header::InvalidHeaderValue> for AuthError {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(AuthErrorKind::HttpBuild, Some(Box::new(e))).with_context(msg)
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(AuthErrorKind::SerdeJson, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify the response body is valid JSON")
    }
}

impl From<serde_html_form::ser::Error> for AuthError {
    fn from(e: serde_html_form::ser::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(AuthErrorKind::SerdeHtmlForm, Some(Box::new(e)))
            .with_context(msg)
            .with_help("check token request parameters are serializable")
    }
}

impl From<url::ParseError> for AuthError {
    fn from(e: url::ParseError) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(AuthErrorKind::Url, Some(Box::new(e))).with_context(msg)
    }
}

pub type Result<T> = core::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_message_includes_description_and_uri() {
        let err = AuthError::oidc_provider(
            "invalid_grant",
            Some("code expired".into()),
            Some("https://idp.example/errors".into()),
        );
        assert_eq!(
            err.to_string(),
            "Token endpoint returned error [invalid_grant]: code expired (see https://idp.example/errors)"
        );
        assert!(err.is_invalid_grant());

        let bare = AuthError::oidc_provider("server_error", None, None);
        assert_eq!(bare.to_string(), "Token endpoint returned error [server_error]");
        assert!(!bare.is_invalid_grant());
    }

    #[test]
    fn missing_field_names_the_field() {
        let err = AuthError::missing_field("id_token");
        assert!(matches!(err.kind(), AuthErrorKind::InvalidResponse(m) if m.contains("[id_token]")));
    }
}
