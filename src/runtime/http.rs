use std::time::Duration;

use reqwest::{Method, Response};

use super::TlsConfig;
use crate::error::{Error, Result};

/// A thin wrapper over a `reqwest` client, configured with a request timeout and optionally a
/// custom TLS configuration.
#[derive(Clone, Debug, Default)]
pub(crate) struct HttpClient {
    inner: reqwest::Client,
}

pub(crate) struct HttpRequest {
    inner: reqwest::RequestBuilder,
}

impl From<reqwest::RequestBuilder> for HttpRequest {
    fn from(value: reqwest::RequestBuilder) -> Self {
        Self { inner: value }
    }
}

/// The status and body of a completed HTTP exchange.
#[derive(Clone, Debug)]
pub(crate) struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) body: Vec<u8>,
}

impl HttpRequest {
    /// Sets the headers for the request.
    pub(crate) fn headers<'a>(
        self,
        headers: impl IntoIterator<Item = &'a (String, String)>,
    ) -> Self {
        headers
            .into_iter()
            .fold(self.inner, |request, (k, v)| request.header(k.as_str(), v.as_str()))
            .into()
    }

    /// Sets the body for the request.
    pub(crate) fn body(self, body: Vec<u8>) -> Self {
        self.inner.body(body).into()
    }

    /// Sends the request via the HttpClient it was created from and returns the status and the
    /// raw body of the response.
    pub(crate) async fn send(self) -> reqwest::Result<HttpResponse> {
        let response: Response = self.inner.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

impl HttpClient {
    pub(crate) fn new(timeout: Duration, tls: Option<&TlsConfig>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(tls) = tls {
            builder = builder.use_preconfigured_tls(tls.rustls_config());
        }
        let inner = builder
            .build()
            .map_err(|e| Error::internal(format!("error initializing http client: {e}")))?;
        Ok(Self { inner })
    }

    /// Creates an HTTP request with the given method. `send` must be called on the returned
    /// request for it to be executed.
    pub(crate) fn request(&self, method: &str, uri: &str) -> Result<HttpRequest> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| Error::invalid_argument(format!("invalid HTTP method {method}: {e}")))?;
        Ok(self.inner.request(method, uri).into())
    }
}
