use http::{Request, StatusCode};
use solid_authn_common::HttpClient;
use url::Url;

use crate::{
    error::{AuthError, Result},
    storage::{StorageUtility, issuer_config_key},
    types::{DiscoveryDocument, IssuerConfig},
};

pub const WELL_KNOWN_OPENID_CONFIG: &str = ".well-known/openid-configuration";

/// Discovery URL for `issuer`, whether or not it ends in `/`.
pub fn discovery_url(issuer: &Url) -> Result<Url> {
    let base = issuer.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!("{base}/{WELL_KNOWN_OPENID_CONFIG}"))?)
}

/// Compare two issuer strings strictly but without spuriously failing on trivial differences.
///
/// Schemes, hosts and effective ports must match exactly. An empty path and `/` are
/// equivalent, as is a single trailing slash on any other path.
pub(crate) fn issuer_equivalent(a: &str, b: &str) -> bool {
    fn normalize(url: &Url) -> Option<(String, String, u16, String)> {
        if url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        let path = url.path().trim_end_matches('/');
        Some((
            url.scheme().to_string(),
            url.host_str()?.to_string(),
            url.port_or_known_default()?,
            path.to_string(),
        ))
    }

    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => match (normalize(&ua), normalize(&ub)) {
            (Some(na), Some(nb)) => na == nb,
            _ => false,
        },
        _ => a == b,
    }
}

/// Fetches and caches provider discovery documents.
pub struct IssuerConfigFetcher<C> {
    client: C,
    storage: StorageUtility,
}

impl<C: HttpClient> IssuerConfigFetcher<C> {
    pub fn new(client: C, storage: StorageUtility) -> Self {
        Self { client, storage }
    }

    /// Previously fetched configuration, if any.
    pub async fn get_cached(&self, issuer: &str) -> Result<Option<IssuerConfig>> {
        let Some(raw) = self.storage.insecure().get(&issuer_config_key(issuer)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    /// Fetch `<issuer>/.well-known/openid-configuration` and persist the mapped result.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %issuer)))]
    pub async fn fetch_config(&self, issuer: &Url) -> Result<IssuerConfig> {
        let url = discovery_url(issuer)?;
        let req = Request::builder()
            .uri(url.as_str())
            .header("Accept", "application/json")
            .body(Vec::new())?;
        let res = self
            .client
            .send_http(req)
            .await
            .map_err(AuthError::transport)?;
        if res.status() != StatusCode::OK {
            return Err(AuthError::configuration(smol_str::format_smolstr!(
                "[{issuer}] has an invalid configuration: discovery returned HTTP {}",
                res.status()
            ))
            .with_url(url.as_str()));
        }
        let document: DiscoveryDocument = serde_json::from_slice(res.body()).map_err(|e| {
            AuthError::configuration(smol_str::format_smolstr!(
                "[{issuer}] has an invalid configuration: {e}"
            ))
            .with_url(url.as_str())
        })?;
        let config = IssuerConfig::from(document);

        self.storage
            .insecure()
            .set(
                &issuer_config_key(issuer.as_str()),
                serde_json::to_string(&config)?,
            )
            .await?;
        Ok(config)
    }

    /// Cached configuration, fetching it on a miss.
    pub async fn get_or_fetch(&self, issuer: &Url) -> Result<IssuerConfig> {
        match self.get_cached(issuer.as_str()).await? {
            Some(config) => Ok(config),
            None => self.fetch_config(issuer).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use core::future::Future;
    use std::{convert::Infallible, sync::Arc};

    use super::*;
    use crate::error::AuthErrorKind;
    use http::{Request as HttpRequest, Response as HttpResponse};
    use solid_authn_common::MemoryStorage;
    use tokio::sync::Mutex;

    #[derive(Default, Clone)]
    struct MockHttp {
        next: Arc<Mutex<Option<HttpResponse<Vec<u8>>>>>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl HttpClient for MockHttp {
        type Error = Infallible;
        fn send_http(
            &self,
            request: HttpRequest<Vec<u8>>,
        ) -> impl Future<Output = core::result::Result<HttpResponse<Vec<u8>>, Self::Error>> + Send
        {
            let next = self.next.clone();
            let seen = self.seen.clone();
            async move {
                seen.lock().await.push(request.uri().to_string());
                Ok(next.lock().await.take().unwrap())
            }
        }
    }

    fn ok(body: serde_json::Value) -> HttpResponse<Vec<u8>> {
        HttpResponse::builder()
            .status(StatusCode::OK)
            .body(serde_json::to_vec(&body).unwrap())
            .unwrap()
    }

    fn fetcher(client: MockHttp) -> IssuerConfigFetcher<MockHttp> {
        IssuerConfigFetcher::new(
            client,
            StorageUtility::new(MemoryStorage::new(), MemoryStorage::new()),
        )
    }

    #[test]
    fn discovery_url_is_slash_agnostic() {
        for issuer in ["https://idp.example", "https://idp.example/"] {
            assert_eq!(
                discovery_url(&Url::parse(issuer).unwrap()).unwrap().as_str(),
                "https://idp.example/.well-known/openid-configuration"
            );
        }
        assert_eq!(
            discovery_url(&Url::parse("https://idp.example/realm/").unwrap())
                .unwrap()
                .as_str(),
            "https://idp.example/realm/.well-known/openid-configuration"
        );
    }

    #[tokio::test]
    async fn maps_known_keys_and_defaults_scopes() {
        let client = MockHttp::default();
        *client.next.lock().await = Some(ok(serde_json::json!({
            "issuer": "https://idp.example/",
            "authorization_endpoint": "https://idp.example/auth",
            "token_endpoint": "https://idp.example/token",
            "jwks_uri": "https://idp.example/jwks",
            "grant_types_supported": ["authorization_code", "refresh_token"],
            "end_session_endpoint": "https://idp.example/logout",
            "some_vendor_extension": {"nested": true}
        })));
        let fetcher = fetcher(client.clone());
        let issuer = Url::parse("https://idp.example").unwrap();
        let config = fetcher.fetch_config(&issuer).await.unwrap();
        assert_eq!(config.scopes_supported, vec!["openid"]);
        assert_eq!(config.token_endpoint.as_deref(), Some("https://idp.example/token"));
        assert!(config.supports_grant("authorization_code"));
        assert_eq!(
            client.seen.lock().await[0],
            "https://idp.example/.well-known/openid-configuration"
        );

        let cached = fetcher.get_cached(issuer.as_str()).await.unwrap().unwrap();
        assert_eq!(cached, config);
    }

    #[tokio::test]
    async fn non_json_is_a_configuration_error() {
        let client = MockHttp::default();
        *client.next.lock().await = Some(
            HttpResponse::builder()
                .status(StatusCode::OK)
                .body(b"<html>".to_vec())
                .unwrap(),
        );
        let err = fetcher(client)
            .fetch_config(&Url::parse("https://idp.example").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            AuthErrorKind::Configuration(m) if m.starts_with("[https://idp.example/] has an invalid configuration")
        ));
    }

    #[test]
    fn issuer_equivalence_rules() {
        assert!(issuer_equivalent("https://issuer", "https://issuer/"));
        assert!(issuer_equivalent("https://issuer:443/", "https://issuer/"));
        assert!(issuer_equivalent("https://issuer/realm/", "https://issuer/realm"));
        assert!(!issuer_equivalent("http://issuer/", "https://issuer/"));
        assert!(!issuer_equivalent("https://issuer/foo", "https://issuer/"));
        assert!(!issuer_equivalent("https://issuer/?q=1", "https://issuer/"));
    }
}
