use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::json;

use super::{credentials, endpoint_url, KmsContext, KmsHttpRequest};
use crate::error::{Error, Result};

const DEFAULT_IDENTITY_PLATFORM: &str = "login.microsoftonline.com";
const VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const API_VERSION: &str = "7.3";
const ALGORITHM: &str = "RSA-OAEP-256";

/// A bearer token for Key Vault: an explicit `accessToken`, a client-credentials grant, or the
/// managed identity of the host when the credentials document is empty.
async fn access_token(ctx: &KmsContext<'_>) -> Result<String> {
    if let Ok(token) = ctx.credentials.get_str("accessToken") {
        return Ok(token.to_string());
    }
    if ctx.credentials.is_empty() {
        return ctx
            .cache()
            .token(ctx.provider.name(), credentials::azure_managed_identity(ctx))
            .await;
    }

    let tenant_id = ctx.credential_str("tenantId")?;
    let client_id = ctx.credential_str("clientId")?;
    let client_secret = ctx.credential_str("clientSecret")?;
    let platform = ctx.credentials.get_str("identityPlatformEndpoint").ok();
    let url = endpoint_url(
        platform,
        DEFAULT_IDENTITY_PLATFORM,
        &format!("/{tenant_id}/oauth2/v2.0/token"),
    );
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_secret", client_secret),
        ("scope", VAULT_SCOPE),
    ]
    .iter()
    .map(|(k, v)| format!("{k}={}", utf8_percent_encode(v, NON_ALPHANUMERIC)))
    .collect::<Vec<_>>()
    .join("&");

    let fetch = async {
        let body = ctx
            .send(
                KmsHttpRequest::new("POST", url)
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .header("Accept", "application/json")
                    .body(form),
            )
            .await?;
        let (token, lifetime) = credentials::parse_token(ctx, &body)?;
        Ok::<_, Error>((token, lifetime.max(Duration::from_secs(1))))
    };
    ctx.cache()
        .token(format!("{}/{tenant_id}/{client_id}", ctx.provider), fetch)
        .await
}

async fn key_operation(
    ctx: &KmsContext<'_>,
    operation: &str,
    vault: &str,
    key_name: &str,
    key_version: Option<&str>,
    value: &[u8],
) -> Result<Vec<u8>> {
    let token = access_token(ctx).await?;
    let version = key_version.map(|v| format!("/{v}")).unwrap_or_default();
    let path = format!("/keys/{key_name}{version}/{operation}?api-version={API_VERSION}");
    let url = endpoint_url(Some(vault), vault, &path);
    let body = json!({ "alg": ALGORITHM, "value": URL_SAFE_NO_PAD.encode(value) }).to_string();

    let response = ctx
        .send_json(
            KmsHttpRequest::new("POST", url)
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "application/json")
                .header("Accept", "application/json")
                .body(body),
        )
        .await?;
    let encoded = response
        .get("value")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ctx.response_error("response is missing value"))?;
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| ctx.response_error(format!("invalid base64url value: {e}")))
}

pub(super) async fn wrap(
    ctx: &KmsContext<'_>,
    vault: &str,
    key_name: &str,
    key_version: Option<&str>,
    data_key: &[u8],
) -> Result<Vec<u8>> {
    key_operation(ctx, "wrapkey", vault, key_name, key_version, data_key).await
}

pub(super) async fn unwrap(
    ctx: &KmsContext<'_>,
    vault: &str,
    key_name: &str,
    key_version: Option<&str>,
    wrapped: &[u8],
) -> Result<Vec<u8>> {
    key_operation(ctx, "unwrapkey", vault, key_name, key_version, wrapped).await
}
