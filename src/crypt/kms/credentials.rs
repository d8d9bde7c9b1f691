//! On-demand credentials for cloud KMS providers whose credentials document is left empty, and
//! the cache of short-lived access tokens obtained for any provider.

use std::{
    collections::HashMap,
    future::Future,
    time::{Duration, Instant},
};

use aws_credential_types::Credentials;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{KmsContext, KmsHttpRequest};
use crate::{
    error::{Error, KmsErrorKind, Result},
    trace::KMS_TRACING_EVENT_TARGET,
};

const IMDS_HOST: &str = "http://169.254.169.254";
const ECS_HOST: &str = "http://169.254.170.2";
const GCP_METADATA_HOST: &str = "http://metadata.google.internal";

/// Tokens are refreshed this long before the provider says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// IMDS credentials are valid for at least fifteen minutes; they are reused for less than that.
const AWS_ON_DEMAND_LIFETIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Cached<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> Cached<T> {
    fn live(&self) -> Option<T> {
        (Instant::now() < self.expires_at).then(|| self.value.clone())
    }
}

/// Credentials and access tokens shared by every request a [`super::KmsClient`] makes.
#[derive(Debug, Default)]
pub(crate) struct CredentialCache {
    aws: Mutex<Option<Cached<Credentials>>>,
    tokens: Mutex<HashMap<String, Cached<String>>>,
}

impl CredentialCache {
    /// Returns the cached token for `key`, or runs `fetch` to obtain a token and its lifetime.
    pub(crate) async fn token<F>(&self, key: String, fetch: F) -> Result<String>
    where
        F: Future<Output = Result<(String, Duration)>>,
    {
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(&key).and_then(Cached::live) {
            return Ok(token);
        }
        let (token, lifetime) = fetch.await?;
        tracing::debug!(
            target: KMS_TRACING_EVENT_TARGET,
            key = %key,
            ?lifetime,
            "Obtained KMS access token",
        );
        tokens.insert(
            key,
            Cached {
                value: token.clone(),
                expires_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
            },
        );
        Ok(token)
    }
}

/// The AWS credentials to sign with: explicit if `accessKeyId` is present, otherwise taken from
/// the environment, then the ECS task role, then the EC2 instance role.
pub(crate) async fn aws(ctx: &KmsContext<'_>) -> Result<Credentials> {
    if ctx.credentials.contains_key("accessKeyId") {
        return Ok(Credentials::new(
            ctx.credential_str("accessKeyId")?,
            ctx.credential_str("secretAccessKey")?,
            ctx.credentials
                .get_str("sessionToken")
                .ok()
                .map(str::to_string),
            None,
            "kmsProviders",
        ));
    }
    require_on_demand(ctx)?;

    if let (Ok(key), Ok(secret)) = (
        std::env::var("AWS_ACCESS_KEY_ID"),
        std::env::var("AWS_SECRET_ACCESS_KEY"),
    ) {
        return Ok(Credentials::new(
            key,
            secret,
            std::env::var("AWS_SESSION_TOKEN").ok(),
            None,
            "environment",
        ));
    }

    let mut cached = ctx.cache().aws.lock().await;
    if let Some(credentials) = cached.as_ref().and_then(Cached::live) {
        return Ok(credentials);
    }
    let credentials = match std::env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
        Ok(uri) => {
            aws_role_credentials(ctx, KmsHttpRequest::new("GET", format!("{ECS_HOST}{uri}")))
                .await?
        }
        Err(_) => aws_instance_credentials(ctx).await?,
    };
    *cached = Some(Cached {
        value: credentials.clone(),
        expires_at: Instant::now() + AWS_ON_DEMAND_LIFETIME,
    });
    Ok(credentials)
}

async fn aws_instance_credentials(ctx: &KmsContext<'_>) -> Result<Credentials> {
    let token = ctx
        .send(
            KmsHttpRequest::new("PUT", format!("{IMDS_HOST}/latest/api/token"))
                .header("X-aws-ec2-metadata-token-ttl-seconds", "30"),
        )
        .await?;
    let token = String::from_utf8_lossy(&token).into_owned();
    let roles_url = format!("{IMDS_HOST}/latest/meta-data/iam/security-credentials/");
    let role = ctx
        .send(
            KmsHttpRequest::new("GET", roles_url.clone())
                .header("X-aws-ec2-metadata-token", token.clone()),
        )
        .await?;
    let role = String::from_utf8_lossy(&role);
    let role = role
        .lines()
        .next()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| credentials_not_found(ctx, "no IAM role attached to this instance"))?;
    aws_role_credentials(
        ctx,
        KmsHttpRequest::new("GET", format!("{roles_url}{role}"))
            .header("X-aws-ec2-metadata-token", token),
    )
    .await
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

async fn aws_role_credentials(
    ctx: &KmsContext<'_>,
    request: KmsHttpRequest,
) -> Result<Credentials> {
    let body = ctx.send(request).await?;
    let role: RoleCredentials = serde_json::from_slice(&body)
        .map_err(|e| ctx.response_error(format!("invalid role credentials: {e}")))?;
    Ok(Credentials::new(
        role.access_key_id,
        role.secret_access_key,
        role.token,
        None,
        "instance role",
    ))
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(deserialize_with = "seconds")]
    expires_in: Duration,
}

/// Azure sends `expires_in` as a string, Google as a number.
fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }
    let secs = match Seconds::deserialize(deserializer)? {
        Seconds::Number(n) => n,
        Seconds::Text(s) => s.parse().map_err(serde::de::Error::custom)?,
    };
    Ok(Duration::from_secs(secs))
}

pub(crate) fn parse_token(ctx: &KmsContext<'_>, body: &[u8]) -> Result<(String, Duration)> {
    let token: MetadataToken = serde_json::from_slice(body)
        .map_err(|e| ctx.response_error(format!("invalid access token response: {e}")))?;
    Ok((token.access_token, token.expires_in))
}

/// An Azure Key Vault token from the instance metadata service.
pub(crate) async fn azure_managed_identity(ctx: &KmsContext<'_>) -> Result<(String, Duration)> {
    let body = ctx
        .send(
            KmsHttpRequest::new(
                "GET",
                format!(
                    "{IMDS_HOST}/metadata/identity/oauth2/token?api-version=2018-02-01\
                     &resource=https%3A%2F%2Fvault.azure.net"
                ),
            )
            .header("Metadata", "true")
            .header("Accept", "application/json"),
        )
        .await?;
    parse_token(ctx, &body)
}

/// A Google Cloud token for the default service account of the instance.
pub(crate) async fn gcp_metadata(ctx: &KmsContext<'_>) -> Result<(String, Duration)> {
    let body = ctx
        .send(
            KmsHttpRequest::new(
                "GET",
                format!(
                    "{GCP_METADATA_HOST}/computeMetadata/v1/instance/service-accounts/default/token"
                ),
            )
            .header("Metadata-Flavor", "Google"),
        )
        .await?;
    parse_token(ctx, &body)
}

/// Fails unless the credentials document is empty, which is how on-demand credentials are
/// requested.
pub(crate) fn require_on_demand(ctx: &KmsContext<'_>) -> Result<()> {
    if ctx.credentials.is_empty() {
        Ok(())
    } else {
        Err(credentials_not_found(
            ctx,
            format!(
                "incomplete credentials; expected all required fields or an empty document, got \
                 keys {:?}",
                ctx.credentials.keys().collect::<Vec<_>>()
            ),
        ))
    }
}

fn credentials_not_found(ctx: &KmsContext<'_>, message: impl Into<String>) -> Error {
    Error::kms(ctx.provider, KmsErrorKind::CredentialsNotFound, message)
}
