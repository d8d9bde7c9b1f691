use std::time::SystemTime;

use aws_sigv4::{
    http_request::{sign, SignableBody, SignableRequest, SigningSettings},
    sign::v4::SigningParams,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::json;

use super::{credentials, endpoint_url, KmsContext, KmsHttpRequest};
use crate::error::{Error, Result};

const SERVICE: &str = "kms";

pub(super) async fn encrypt(
    ctx: &KmsContext<'_>,
    region: &str,
    key: &str,
    endpoint: Option<&str>,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let body = json!({ "KeyId": key, "Plaintext": STANDARD.encode(plaintext) });
    call(ctx, region, endpoint, "TrentService.Encrypt", body, "CiphertextBlob").await
}

pub(super) async fn decrypt(
    ctx: &KmsContext<'_>,
    region: &str,
    key: &str,
    endpoint: Option<&str>,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let body = json!({ "KeyId": key, "CiphertextBlob": STANDARD.encode(ciphertext) });
    call(ctx, region, endpoint, "TrentService.Decrypt", body, "Plaintext").await
}

async fn call(
    ctx: &KmsContext<'_>,
    region: &str,
    endpoint: Option<&str>,
    target: &str,
    body: serde_json::Value,
    result_field: &str,
) -> Result<Vec<u8>> {
    let default_host = format!("kms.{region}.amazonaws.com");
    let url = endpoint_url(endpoint, &default_host, "/");
    let body = serde_json::to_vec(&body)
        .map_err(|e| Error::internal(format!("failed to serialize AWS KMS request: {e}")))?;

    let credentials = credentials::aws(ctx).await?;
    let request = signed_request(ctx, &credentials, region, &url, target, body)?;

    let response = ctx.send_json(request).await?;
    let encoded = response
        .get(result_field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ctx.response_error(format!("response is missing {result_field}")))?;
    STANDARD
        .decode(encoded)
        .map_err(|e| ctx.response_error(format!("invalid base64 in {result_field}: {e}")))
}

fn signed_request(
    ctx: &KmsContext<'_>,
    credentials: &aws_credential_types::Credentials,
    region: &str,
    url: &str,
    target: &str,
    body: Vec<u8>,
) -> Result<KmsHttpRequest> {
    let signing_error = |e: &dyn std::fmt::Display| {
        Error::invalid_argument(format!("failed to sign {} request: {e}", ctx.provider))
    };

    let host = url
        .trim_start_matches("https://")
        .split('/')
        .next()
        .unwrap_or_default();
    let mut request = http::Request::builder()
        .method("POST")
        .uri(url)
        .header("host", host)
        .header("content-type", "application/x-amz-json-1.1")
        .header("x-amz-target", target)
        .header("accept", "application/json")
        .body(body)
        .map_err(|e| signing_error(&e))?;

    let identity = credentials.clone().into();
    let signing_params = SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(SERVICE)
        .time(SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| signing_error(&e))?
        .into();

    let headers = request
        .headers()
        .iter()
        .map(|(k, v)| {
            v.to_str()
                .map(|v| (k.as_str(), v))
                .map_err(|e| signing_error(&e))
        })
        .collect::<Result<Vec<_>>>()?;
    let signable = SignableRequest::new(
        request.method().as_str(),
        request.uri().to_string(),
        headers.into_iter(),
        SignableBody::Bytes(request.body()),
    )
    .map_err(|e| signing_error(&e))?;
    let (instructions, _signature) = sign(signable, &signing_params)
        .map_err(|e| signing_error(&e))?
        .into_parts();
    instructions.apply_to_request_http1x(&mut request);

    let headers = request
        .headers()
        .iter()
        .map(|(k, v)| {
            v.to_str()
                .map(|v| (k.as_str().to_string(), v.to_string()))
                .map_err(|e| signing_error(&e))
        })
        .collect::<Result<Vec<_>>>()?;
    let (_, body) = request.into_parts();
    Ok(KmsHttpRequest {
        method: "POST",
        url: url.to_string(),
        headers,
        body,
    })
}
