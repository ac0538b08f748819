//! Minimal HTTP client abstraction shared across crates.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use url::Url;

/// Final URL of a response after any redirects were followed.
///
/// Clients that follow redirects attach this as a response extension. A response without
/// it is treated as not redirected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseUrl(pub Url);

impl ResponseUrl {
    /// Read the final URL from a response, if the client recorded one.
    pub fn of<B>(response: &http::Response<B>) -> Option<&Url> {
        response.extensions().get::<ResponseUrl>().map(|u| &u.0)
    }
}

/// HTTP client trait for sending raw HTTP requests.
#[cfg_attr(not(target_arch = "wasm32"), trait_variant::make(Send))]
pub trait HttpClient {
    /// Error type returned by the HTTP client
    type Error: std::error::Error + Display + Send + Sync + 'static;

    /// Send an HTTP request and return the response.
    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>>;
}

#[cfg(feature = "reqwest-client")]
impl HttpClient for reqwest::Client {
    type Error = crate::TransportError;

    async fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
        let (parts, body) = request.into_parts();

        let mut req = self.request(parts.method, parts.uri.to_string()).body(body);
        for (name, value) in parts.headers.iter() {
            req = req.header(name.as_str(), value.as_bytes());
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(uri = %parts.uri, "sending request");

        let resp = req.send().await?;
        let final_url = resp.url().clone();

        let mut builder = http::Response::builder().status(resp.status());
        for (name, value) in resp.headers().iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let body = resp.bytes().await?.to_vec();

        let mut response = builder.body(body)?;
        response.extensions_mut().insert(ResponseUrl(final_url));
        Ok(response)
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl<T: HttpClient + Sync> HttpClient for Arc<T> {
    type Error = T::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> + Send
    {
        self.as_ref().send_http(request)
    }
}

#[cfg(target_arch = "wasm32")]
impl<T: HttpClient> HttpClient for Arc<T> {
    type Error = T::Error;

    fn send_http(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> impl Future<Output = core::result::Result<http::Response<Vec<u8>>, Self::Error>> {
        self.as_ref().send_http(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_url_extension() {
        let mut resp = http::Response::builder().status(200).body(Vec::<u8>::new()).unwrap();
        assert!(ResponseUrl::of(&resp).is_none());
        let url = Url::parse("https://pod.example/resource").unwrap();
        resp.extensions_mut().insert(ResponseUrl(url.clone()));
        assert_eq!(ResponseUrl::of(&resp), Some(&url));
    }
}
