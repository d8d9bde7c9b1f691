//! Key management: wrapping and unwrapping data keys with a master key held by a KMS provider.

mod aws;
mod azure;
mod credentials;
mod gcp;
mod kmip;
mod local;
mod retry;

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use self::retry::RetryPolicy;
use self::credentials::CredentialCache;
use crate::{
    bson::{Bson, Document},
    client::{csfle::options::KmsProviders, options::TlsOptions},
    error::{Error, KmsErrorKind, Result},
    options::ServerAddress,
    runtime::{self, http::HttpClient, AsyncStream, TlsConfig},
    trace::KMS_TRACING_EVENT_TARGET,
    BoxFuture,
};

/// Timeout applied to every request sent to a KMS provider.
pub(crate) const KMS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The kind of key management service a provider talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum KmsProviderType {
    /// A 96-byte master key supplied by the application.
    Local,
    /// AWS KMS.
    Aws,
    /// Azure Key Vault.
    Azure,
    /// Google Cloud KMS.
    Gcp,
    /// A KMIP server.
    Kmip,
}

impl KmsProviderType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
            Self::Kmip => "kmip",
        }
    }
}

/// A configured KMS provider: a provider type, optionally with a name so that several providers
/// of the same type can be configured at once (written `"aws:name"`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KmsProvider {
    provider_type: KmsProviderType,
    name: Option<String>,
}

impl KmsProvider {
    fn new(provider_type: KmsProviderType) -> Self {
        Self {
            provider_type,
            name: None,
        }
    }

    /// The local provider.
    pub fn local() -> Self {
        Self::new(KmsProviderType::Local)
    }

    /// The AWS provider.
    pub fn aws() -> Self {
        Self::new(KmsProviderType::Aws)
    }

    /// The Azure provider.
    pub fn azure() -> Self {
        Self::new(KmsProviderType::Azure)
    }

    /// The GCP provider.
    pub fn gcp() -> Self {
        Self::new(KmsProviderType::Gcp)
    }

    /// The KMIP provider.
    pub fn kmip() -> Self {
        Self::new(KmsProviderType::Kmip)
    }

    /// Gives this provider a name, distinguishing it from other providers of the same type.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The type of this provider.
    pub fn provider_type(&self) -> KmsProviderType {
        self.provider_type
    }

    /// The string identifying this provider in configuration and key documents.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for KmsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(ref name) => write!(f, "{}:{}", self.provider_type.as_str(), name),
            None => f.write_str(self.provider_type.as_str()),
        }
    }
}

impl FromStr for KmsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (type_name, name) = match s.split_once(':') {
            Some((t, n)) => (t, Some(n)),
            None => (s, None),
        };
        let provider_type = match type_name {
            "local" => KmsProviderType::Local,
            "aws" => KmsProviderType::Aws,
            "azure" => KmsProviderType::Azure,
            "gcp" => KmsProviderType::Gcp,
            "kmip" => KmsProviderType::Kmip,
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported KMS provider {other:?}"
                )))
            }
        };
        if name.is_some_and(|n| {
            n.is_empty() || !n.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }) {
            return Err(Error::invalid_argument(format!(
                "invalid KMS provider name in {s:?}"
            )));
        }
        Ok(Self {
            provider_type,
            name: name.map(str::to_string),
        })
    }
}

impl Serialize for KmsProvider {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KmsProvider {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a data key's master key lives, as stored in the `masterKey` field of a key document.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum MasterKey {
    Local {
        #[serde(skip)]
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Aws {
        #[serde(skip)]
        name: Option<String>,
        region: String,
        /// The ARN of the customer master key.
        key: String,
        endpoint: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Azure {
        #[serde(skip)]
        name: Option<String>,
        key_vault_endpoint: String,
        key_name: String,
        key_version: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Gcp {
        #[serde(skip)]
        name: Option<String>,
        project_id: String,
        location: String,
        key_ring: String,
        key_name: String,
        key_version: Option<String>,
        endpoint: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Kmip {
        #[serde(skip)]
        name: Option<String>,
        /// Created on the KMIP server when a data key is created without one.
        key_id: Option<String>,
        endpoint: Option<String>,
        /// Have the KMIP server encrypt and decrypt the data key rather than handing out the
        /// key encryption key.
        delegated: Option<bool>,
    },
}

impl MasterKey {
    /// A master key held by the local provider.
    pub fn local() -> Self {
        Self::Local { name: None }
    }

    /// The provider holding this master key.
    pub fn provider(&self) -> KmsProvider {
        let (provider_type, name) = match self {
            Self::Local { name } => (KmsProviderType::Local, name),
            Self::Aws { name, .. } => (KmsProviderType::Aws, name),
            Self::Azure { name, .. } => (KmsProviderType::Azure, name),
            Self::Gcp { name, .. } => (KmsProviderType::Gcp, name),
            Self::Kmip { name, .. } => (KmsProviderType::Kmip, name),
        };
        KmsProvider {
            provider_type,
            name: name.clone(),
        }
    }

    fn name_mut(&mut self) -> &mut Option<String> {
        match self {
            Self::Local { name }
            | Self::Aws { name, .. }
            | Self::Azure { name, .. }
            | Self::Gcp { name, .. }
            | Self::Kmip { name, .. } => name,
        }
    }

    pub(crate) fn to_document(&self) -> Result<Document> {
        let mut doc = bson::to_document(self)?;
        doc.insert("provider", self.provider().to_string());
        Ok(doc)
    }

    pub(crate) fn from_document(doc: &Document) -> Result<Self> {
        let provider: KmsProvider = doc
            .get_str("provider")
            .map_err(|_| Error::invalid_argument("master key is missing a provider"))?
            .parse()?;
        let mut untagged = doc.clone();
        untagged.insert("provider", provider.provider_type.as_str());
        let mut key: MasterKey = bson::from_document(untagged).map_err(|e| {
            Error::invalid_argument(format!("invalid master key for {provider}: {e}"))
        })?;
        *key.name_mut() = provider.name;
        Ok(key)
    }
}

/// An HTTP request to a KMS provider or a credentials endpoint.
#[derive(Clone, Debug)]
pub(crate) struct KmsHttpRequest {
    pub(crate) method: &'static str,
    pub(crate) url: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl KmsHttpRequest {
    pub(crate) fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub(crate) fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub(crate) fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    fn host(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(_, rest)| rest);
        rest.split(['/', '?']).next().unwrap_or(rest)
    }
}

/// The status and body of a KMS HTTP exchange.
#[derive(Clone, Debug)]
pub(crate) struct KmsHttpResponse {
    pub(crate) status: u16,
    pub(crate) body: Vec<u8>,
}

/// The network transport used to reach KMS providers.
pub(crate) trait KmsTransport: Send + Sync + fmt::Debug {
    /// Sends an HTTP(S) request on behalf of `provider`.
    fn http<'a>(
        &'a self,
        provider: &'a KmsProvider,
        request: KmsHttpRequest,
    ) -> BoxFuture<'a, Result<KmsHttpResponse>>;

    /// Sends a TTLV message to a KMIP server over TLS and returns the response message.
    fn kmip<'a>(
        &'a self,
        provider: &'a KmsProvider,
        endpoint: &'a str,
        message: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// The default transport: `reqwest` for HTTP and `tokio-rustls` for KMIP, with one TLS
/// configuration per provider that has TLS options.
#[derive(Debug)]
pub(crate) struct DefaultKmsTransport {
    default_http: HttpClient,
    default_tls: TlsConfig,
    http: HashMap<KmsProvider, HttpClient>,
    tls: HashMap<KmsProvider, TlsConfig>,
}

impl DefaultKmsTransport {
    pub(crate) fn new(tls_options: Option<&HashMap<KmsProvider, TlsOptions>>) -> Result<Self> {
        let default_tls = TlsConfig::new(&TlsOptions::default())?;
        let mut http = HashMap::new();
        let mut tls = HashMap::new();
        for (provider, options) in tls_options.into_iter().flatten() {
            let config = TlsConfig::new(options)?;
            http.insert(
                provider.clone(),
                HttpClient::new(KMS_REQUEST_TIMEOUT, Some(&config))?,
            );
            tls.insert(provider.clone(), config);
        }
        Ok(Self {
            default_http: HttpClient::new(KMS_REQUEST_TIMEOUT, None)?,
            default_tls,
            http,
            tls,
        })
    }

    async fn kmip_round_trip(
        &self,
        provider: &KmsProvider,
        endpoint: &str,
        message: Vec<u8>,
    ) -> Result<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut address = ServerAddress::parse(endpoint)?;
        let ServerAddress::Tcp { ref mut port, .. } = address;
        port.get_or_insert(kmip::DEFAULT_PORT);

        let tls = self.tls.get(provider).unwrap_or(&self.default_tls);
        let mut stream =
            AsyncStream::connect(&address, Some(tls), Some(KMS_REQUEST_TIMEOUT)).await?;
        runtime::timeout(KMS_REQUEST_TIMEOUT, async {
            stream.write_all(&message).await?;
            stream.flush().await?;

            let mut header = [0u8; kmip::HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let len = kmip::message_len(&header)?;
            let mut response = header.to_vec();
            response.resize(kmip::HEADER_LEN + len, 0);
            stream.read_exact(&mut response[kmip::HEADER_LEN..]).await?;
            Ok::<_, Error>(response)
        })
        .await?
    }
}

impl KmsTransport for DefaultKmsTransport {
    fn http<'a>(
        &'a self,
        provider: &'a KmsProvider,
        request: KmsHttpRequest,
    ) -> BoxFuture<'a, Result<KmsHttpResponse>> {
        Box::pin(async move {
            let client = self.http.get(provider).unwrap_or(&self.default_http);
            let response = client
                .request(request.method, &request.url)?
                .headers(&request.headers)
                .body(request.body)
                .send()
                .await
                .map_err(|e| {
                    let mut error = Error::kms(provider, KmsErrorKind::Network, e.to_string());
                    if e.is_connect() || e.is_timeout() || e.is_request() {
                        error.add_label(retry::TRANSIENT_KMS_ERROR);
                    }
                    error
                })?;
            Ok(KmsHttpResponse {
                status: response.status,
                body: response.body,
            })
        })
    }

    fn kmip<'a>(
        &'a self,
        provider: &'a KmsProvider,
        endpoint: &'a str,
        message: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.kmip_round_trip(provider, endpoint, message)
                .await
                .map_err(|e| {
                    if e.is_kms_error() {
                        return e;
                    }
                    let transient = e.is_network_error();
                    let mut error = Error::kms(provider, KmsErrorKind::Network, e.to_string());
                    if transient {
                        error.add_label(retry::TRANSIENT_KMS_ERROR);
                    }
                    error
                })
        })
    }
}

/// Everything a provider implementation needs for one call.
pub(crate) struct KmsContext<'a> {
    pub(crate) provider: &'a KmsProvider,
    pub(crate) credentials: &'a Document,
    transport: &'a dyn KmsTransport,
    retry: &'a RetryPolicy,
    cache: &'a CredentialCache,
}

impl KmsContext<'_> {
    /// Sends `request`, retrying transient failures, and returns the body of a successful
    /// response.
    pub(crate) async fn send(&self, request: KmsHttpRequest) -> Result<Vec<u8>> {
        self.retry
            .run(self.provider, || async {
                tracing::debug!(
                    target: KMS_TRACING_EVENT_TARGET,
                    provider = %self.provider,
                    method = request.method,
                    host = request.host(),
                    "Sending KMS request",
                );
                let response = self.transport.http(self.provider, request.clone()).await?;
                check_status(self.provider, &response)?;
                Ok(response.body)
            })
            .await
    }

    /// Like [`KmsContext::send`], parsing the body as JSON.
    pub(crate) async fn send_json(&self, request: KmsHttpRequest) -> Result<serde_json::Value> {
        let body = self.send(request).await?;
        serde_json::from_slice(&body).map_err(|e| {
            Error::kms(
                self.provider,
                KmsErrorKind::Response,
                format!("invalid JSON in response: {e}"),
            )
        })
    }

    pub(crate) async fn send_kmip(&self, endpoint: &str, message: Vec<u8>) -> Result<Vec<u8>> {
        self.retry
            .run(self.provider, || {
                self.transport.kmip(self.provider, endpoint, message.clone())
            })
            .await
    }

    pub(crate) fn cache(&self) -> &CredentialCache {
        self.cache
    }

    pub(crate) fn transport(&self) -> &dyn KmsTransport {
        self.transport
    }

    pub(crate) fn response_error(&self, message: impl Into<String>) -> Error {
        Error::kms(self.provider, KmsErrorKind::Response, message)
    }

    /// A required string credential.
    pub(crate) fn credential_str(&self, key: &str) -> Result<&str> {
        match self.credentials.get(key) {
            Some(Bson::String(s)) => Ok(s),
            Some(_) => Err(Error::invalid_argument(format!(
                "expected a string for {key} in {} credentials",
                self.provider
            ))),
            None => Err(Error::kms(
                self.provider,
                KmsErrorKind::CredentialsNotFound,
                format!("missing {key} in credentials"),
            )),
        }
    }
}

fn check_status(provider: &KmsProvider, response: &KmsHttpResponse) -> Result<()> {
    if (200..300).contains(&response.status) {
        return Ok(());
    }
    let body = String::from_utf8_lossy(&response.body);
    let message = format!("HTTP status {}: {body}", response.status);
    let kind = match response.status {
        401 | 403 => KmsErrorKind::Auth,
        _ if is_auth_error_body(&body) => KmsErrorKind::Auth,
        _ => KmsErrorKind::Http,
    };
    let mut error = Error::kms(provider, kind, message);
    if kind == KmsErrorKind::Http && matches!(response.status, 408 | 429 | 500..=599) {
        error.add_label(retry::TRANSIENT_KMS_ERROR);
    }
    Err(error)
}

/// AWS reports credential problems with a 400 status and an error type in the body.
fn is_auth_error_body(body: &str) -> bool {
    [
        "UnrecognizedClientException",
        "InvalidSignatureException",
        "AccessDeniedException",
        "IncompleteSignature",
        "invalid_client",
        "unauthorized_client",
        "invalid_grant",
    ]
    .iter()
    .any(|marker| body.contains(marker))
}

/// Wraps and unwraps data keys with the configured KMS providers.
#[derive(Debug)]
pub(crate) struct KmsClient {
    providers: KmsProviders,
    transport: Arc<dyn KmsTransport>,
    retry: RetryPolicy,
    cache: CredentialCache,
}

impl KmsClient {
    pub(crate) fn new(providers: KmsProviders, retry: RetryPolicy) -> Result<Self> {
        let transport = Arc::new(DefaultKmsTransport::new(providers.tls_options())?);
        Ok(Self::with_transport(providers, retry, transport))
    }

    pub(crate) fn with_transport(
        providers: KmsProviders,
        retry: RetryPolicy,
        transport: Arc<dyn KmsTransport>,
    ) -> Self {
        Self {
            providers,
            transport,
            retry,
            cache: CredentialCache::default(),
        }
    }

    fn context<'a>(&'a self, provider: &'a KmsProvider) -> Result<KmsContext<'a>> {
        let credentials = self.providers.credentials().get(provider).ok_or_else(|| {
            Error::kms(
                provider,
                KmsErrorKind::CredentialsNotFound,
                format!("KMS provider {provider} is not configured"),
            )
        })?;
        Ok(KmsContext {
            provider,
            credentials,
            transport: self.transport.as_ref(),
            retry: &self.retry,
            cache: &self.cache,
        })
    }

    /// Encrypts `data_key` with `master_key`. Returns the wrapped key and the master key to store
    /// with it, which may have gained provider-assigned fields.
    pub(crate) async fn wrap_key(
        &self,
        master_key: &MasterKey,
        data_key: &[u8],
    ) -> Result<(Vec<u8>, MasterKey)> {
        let provider = master_key.provider();
        let ctx = self.context(&provider)?;
        tracing::debug!(target: KMS_TRACING_EVENT_TARGET, %provider, "Wrapping data key");
        match master_key {
            MasterKey::Local { .. } => Ok((local::wrap(&ctx, data_key)?, master_key.clone())),
            MasterKey::Aws {
                region,
                key,
                endpoint,
                ..
            } => Ok((
                aws::encrypt(&ctx, region, key, endpoint.as_deref(), data_key).await?,
                master_key.clone(),
            )),
            MasterKey::Azure {
                key_vault_endpoint,
                key_name,
                key_version,
                ..
            } => Ok((
                azure::wrap(
                    &ctx,
                    key_vault_endpoint,
                    key_name,
                    key_version.as_deref(),
                    data_key,
                )
                .await?,
                master_key.clone(),
            )),
            MasterKey::Gcp { .. } => Ok((
                gcp::encrypt(&ctx, master_key, data_key).await?,
                master_key.clone(),
            )),
            MasterKey::Kmip { .. } => kmip::wrap(&ctx, master_key, data_key).await,
        }
    }

    /// Decrypts a data key wrapped by [`KmsClient::wrap_key`].
    pub(crate) async fn unwrap_key(
        &self,
        master_key: &MasterKey,
        wrapped: &[u8],
    ) -> Result<Vec<u8>> {
        let provider = master_key.provider();
        let ctx = self.context(&provider)?;
        tracing::debug!(target: KMS_TRACING_EVENT_TARGET, %provider, "Unwrapping data key");
        match master_key {
            MasterKey::Local { .. } => local::unwrap(&ctx, wrapped),
            MasterKey::Aws {
                region,
                key,
                endpoint,
                ..
            } => aws::decrypt(&ctx, region, key, endpoint.as_deref(), wrapped).await,
            MasterKey::Azure {
                key_vault_endpoint,
                key_name,
                key_version,
                ..
            } => {
                azure::unwrap(
                    &ctx,
                    key_vault_endpoint,
                    key_name,
                    key_version.as_deref(),
                    wrapped,
                )
                .await
            }
            MasterKey::Gcp { .. } => gcp::decrypt(&ctx, master_key, wrapped).await,
            MasterKey::Kmip { .. } => kmip::unwrap(&ctx, master_key, wrapped).await,
        }
    }
}

/// Builds a provider URL from an optional `host[:port]` override and a default host.
pub(crate) fn endpoint_url(endpoint: Option<&str>, default_host: &str, path: &str) -> String {
    let host = endpoint
        .map(|e| e.trim_start_matches("https://").trim_end_matches('/'))
        .unwrap_or(default_host);
    format!("https://{host}{path}")
}

#[cfg(test)]
pub(crate) mod test;
