use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use ring::{
    rand::SystemRandom,
    signature::{RsaKeyPair, RSA_PKCS1_SHA256},
};
use serde_json::json;

use super::{credentials, endpoint_url, KmsContext, KmsHttpRequest, MasterKey};
use crate::{
    bson::Bson,
    error::{Error, KmsErrorKind, Result},
};

const DEFAULT_TOKEN_HOST: &str = "oauth2.googleapis.com";
const DEFAULT_KMS_HOST: &str = "cloudkms.googleapis.com";
const SCOPE: &str = "https://www.googleapis.com/auth/cloudkms";
const JWT_LIFETIME: Duration = Duration::from_secs(5 * 60);

fn private_key(ctx: &KmsContext<'_>) -> Result<Vec<u8>> {
    match ctx.credentials.get("privateKey") {
        Some(Bson::Binary(binary)) => Ok(binary.bytes.clone()),
        Some(Bson::String(encoded)) => STANDARD
            .decode(encoded)
            .map_err(|e| Error::invalid_argument(format!("invalid base64 GCP privateKey: {e}"))),
        Some(_) => Err(Error::invalid_argument(
            "GCP privateKey must be a base64 string or binary",
        )),
        None => Err(Error::kms(
            ctx.provider,
            KmsErrorKind::CredentialsNotFound,
            "missing privateKey in credentials",
        )),
    }
}

/// A signed JWT-bearer assertion for the service account `email`.
fn assertion(ctx: &KmsContext<'_>, email: &str, audience: &str) -> Result<String> {
    let key = RsaKeyPair::from_pkcs8(&private_key(ctx)?).map_err(|e| {
        Error::invalid_argument(format!("GCP privateKey is not a PKCS#8 RSA key: {e}"))
    })?;
    let issued_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::internal(format!("system clock before epoch: {e}")))?
        .as_secs();
    let header = json!({ "alg": "RS256", "typ": "JWT" });
    let claims = json!({
        "iss": email,
        "aud": audience,
        "scope": SCOPE,
        "iat": issued_at,
        "exp": issued_at + JWT_LIFETIME.as_secs(),
    });
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );
    let mut signature = vec![0; key.public().modulus_len()];
    key.sign(
        &RSA_PKCS1_SHA256,
        &SystemRandom::new(),
        signing_input.as_bytes(),
        &mut signature,
    )
    .map_err(|_| Error::invalid_argument("failed to sign GCP token request"))?;
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
}

async fn access_token(ctx: &KmsContext<'_>) -> Result<String> {
    if let Ok(token) = ctx.credentials.get_str("accessToken") {
        return Ok(token.to_string());
    }
    if ctx.credentials.is_empty() {
        return ctx
            .cache()
            .token(ctx.provider.name(), credentials::gcp_metadata(ctx))
            .await;
    }

    let email = ctx.credential_str("email")?;
    let token_host = ctx.credentials.get_str("endpoint").ok();
    let url = endpoint_url(token_host, DEFAULT_TOKEN_HOST, "/token");
    let fetch = async {
        let jwt = assertion(ctx, email, &url)?;
        let form = format!(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer&assertion={jwt}"
        );
        let body = ctx
            .send(
                KmsHttpRequest::new("POST", url.clone())
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .header("Accept", "application/json")
                    .body(form),
            )
            .await?;
        credentials::parse_token(ctx, &body)
    };
    ctx.cache()
        .token(format!("{}/{email}", ctx.provider), fetch)
        .await
}

fn key_path(master_key: &MasterKey, with_version: bool) -> Result<(Option<&str>, String)> {
    let MasterKey::Gcp {
        project_id,
        location,
        key_ring,
        key_name,
        key_version,
        endpoint,
        ..
    } = master_key
    else {
        return Err(Error::internal("expected a GCP master key"));
    };
    let mut path = format!(
        "/v1/projects/{project_id}/locations/{location}/keyRings/{key_ring}/cryptoKeys/{key_name}"
    );
    if let (true, Some(version)) = (with_version, key_version) {
        path.push_str(&format!("/cryptoKeyVersions/{version}"));
    }
    Ok((endpoint.as_deref(), path))
}

async fn call(
    ctx: &KmsContext<'_>,
    master_key: &MasterKey,
    operation: &str,
    input_field: &str,
    output_field: &str,
    input: &[u8],
) -> Result<Vec<u8>> {
    let (endpoint, path) = key_path(master_key, operation == "encrypt")?;
    let url = endpoint_url(endpoint, DEFAULT_KMS_HOST, &format!("{path}:{operation}"));
    let token = access_token(ctx).await?;
    let body = json!({ input_field: STANDARD.encode(input) }).to_string();

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
        .get(output_field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ctx.response_error(format!("response is missing {output_field}")))?;
    STANDARD
        .decode(encoded)
        .map_err(|e| ctx.response_error(format!("invalid base64 in {output_field}: {e}")))
}

pub(super) async fn encrypt(
    ctx: &KmsContext<'_>,
    master_key: &MasterKey,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    call(ctx, master_key, "encrypt", "plaintext", "ciphertext", plaintext).await
}

pub(super) async fn decrypt(
    ctx: &KmsContext<'_>,
    master_key: &MasterKey,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    call(ctx, master_key, "decrypt", "ciphertext", "plaintext", ciphertext).await
}
