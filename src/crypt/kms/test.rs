use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use pretty_assertions::assert_eq;

use super::{kmip::test_server::FakeKmip, *};
use crate::{
    bson::{doc, spec::BinarySubtype, Binary},
    crypt::aead::KEY_LEN,
    error::ErrorKind,
};

/// A transport that answers HTTP requests from a script and KMIP requests from a fake server.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    pub(crate) requests: Mutex<Vec<KmsHttpRequest>>,
    responses: Mutex<VecDeque<(u16, Vec<u8>)>>,
    pub(crate) kmip: FakeKmip,
}

impl MockTransport {
    pub(crate) fn respond(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.responses
            .lock()
            .unwrap()
            .push_back((status, body.into()));
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl KmsTransport for MockTransport {
    fn http<'a>(
        &'a self,
        _provider: &'a KmsProvider,
        request: KmsHttpRequest,
    ) -> BoxFuture<'a, Result<KmsHttpResponse>> {
        self.requests.lock().unwrap().push(request);
        let (status, body) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected KMS request");
        Box::pin(async move { Ok(KmsHttpResponse { status, body }) })
    }

    fn kmip<'a>(
        &'a self,
        _provider: &'a KmsProvider,
        _endpoint: &'a str,
        message: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        let response = self.kmip.handle(&message);
        Box::pin(async move { Ok(response) })
    }
}

pub(crate) fn local_key_doc(byte: u8) -> Document {
    doc! { "key": Binary { subtype: BinarySubtype::Generic, bytes: vec![byte; KEY_LEN] } }
}

/// A KMS client with only the local provider configured.
pub(crate) fn local_kms() -> KmsClient {
    let providers = KmsProviders::new([(KmsProvider::local(), local_key_doc(1), None)]).unwrap();
    KmsClient::with_transport(
        providers,
        RetryPolicy::disabled(),
        Arc::new(MockTransport::default()),
    )
}

fn client_with(
    providers: impl IntoIterator<Item = (KmsProvider, Document)>,
    retry: RetryPolicy,
) -> (KmsClient, Arc<MockTransport>) {
    let providers =
        KmsProviders::new(providers.into_iter().map(|(p, d)| (p, d, None))).unwrap();
    let transport = Arc::new(MockTransport::default());
    (
        KmsClient::with_transport(providers, retry, transport.clone()),
        transport,
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_backoff(Duration::from_millis(1), Duration::from_millis(1))
}

fn aws_key() -> MasterKey {
    MasterKey::Aws {
        name: None,
        region: "us-east-1".to_string(),
        key: "arn:aws:kms:us-east-1:579766882180:key/89fcc2c4-08b0-4bd9-9f25-e30687b580d0"
            .to_string(),
        endpoint: None,
    }
}

fn aws_credentials() -> Document {
    doc! { "accessKeyId": "AKIAEXAMPLE", "secretAccessKey": "secret" }
}

#[test]
fn provider_names_round_trip() {
    let named: KmsProvider = "aws:prod".parse().unwrap();
    assert_eq!(named, KmsProvider::aws().with_name("prod"));
    assert_eq!(named.to_string(), "aws:prod");
    assert_eq!(named.provider_type(), KmsProviderType::Aws);
    assert_eq!("local".parse::<KmsProvider>().unwrap(), KmsProvider::local());

    assert!("vault".parse::<KmsProvider>().is_err());
    assert!("aws:".parse::<KmsProvider>().is_err());
    assert!("aws:bad-name".parse::<KmsProvider>().is_err());
}

#[test]
fn master_key_documents() {
    let key = MasterKey::Gcp {
        name: Some("eu".to_string()),
        project_id: "p".to_string(),
        location: "global".to_string(),
        key_ring: "ring".to_string(),
        key_name: "k".to_string(),
        key_version: None,
        endpoint: None,
    };
    let doc = key.to_document().unwrap();
    assert_eq!(
        doc,
        doc! {
            "provider": "gcp:eu",
            "projectId": "p",
            "location": "global",
            "keyRing": "ring",
            "keyName": "k",
        }
    );
    assert_eq!(MasterKey::from_document(&doc).unwrap(), key);
    assert_eq!(key.provider(), KmsProvider::gcp().with_name("eu"));

    assert!(MasterKey::from_document(&doc! { "provider": "aws", "region": "us-east-1" }).is_err());
    assert!(MasterKey::from_document(&doc! { "region": "us-east-1" }).is_err());
}

#[tokio::test]
async fn local_wrap_round_trip() {
    let kms = local_kms();
    let data_key = vec![9u8; KEY_LEN];
    let (wrapped, stored) = kms.wrap_key(&MasterKey::local(), &data_key).await.unwrap();
    assert_eq!(stored, MasterKey::local());
    assert_ne!(wrapped, data_key);
    assert_eq!(
        kms.unwrap_key(&MasterKey::local(), &wrapped).await.unwrap(),
        data_key
    );
}

#[tokio::test]
async fn unconfigured_provider_is_credentials_not_found() {
    let kms = local_kms();
    let error = kms.wrap_key(&aws_key(), &[0; KEY_LEN]).await.unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::Kms {
            kind: KmsErrorKind::CredentialsNotFound,
            ..
        }
    ));
}

#[tokio::test]
async fn wrong_local_key_fails_to_unwrap() {
    let (kms, _) = client_with(
        [(KmsProvider::local(), local_key_doc(1))],
        RetryPolicy::disabled(),
    );
    let (wrapped, _) = kms.wrap_key(&MasterKey::local(), &[3; KEY_LEN]).await.unwrap();

    let (other, _) = client_with(
        [(KmsProvider::local(), local_key_doc(2))],
        RetryPolicy::disabled(),
    );
    let error = other
        .unwrap_key(&MasterKey::local(), &wrapped)
        .await
        .unwrap_err();
    assert!(error.is_encryption_error());
}

#[tokio::test]
async fn aws_requests_are_signed() {
    let (kms, transport) = client_with([(KmsProvider::aws(), aws_credentials())], fast_retry());
    transport.respond(
        200,
        serde_json::json!({ "CiphertextBlob": STANDARD.encode(b"wrapped") }).to_string(),
    );

    let (wrapped, _) = kms.wrap_key(&aws_key(), b"plaintext").await.unwrap();
    assert_eq!(wrapped, b"wrapped");

    let requests = transport.requests.lock().unwrap();
    let request = &requests[0];
    assert_eq!(request.url, "https://kms.us-east-1.amazonaws.com/");
    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    assert_eq!(
        header("x-amz-target").as_deref(),
        Some("TrentService.Encrypt")
    );
    assert!(header("authorization")
        .unwrap()
        .starts_with("AWS4-HMAC-SHA256 Credential=AKIAEXAMPLE/"));
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["Plaintext"], STANDARD.encode(b"plaintext"));
}

#[tokio::test]
async fn transient_statuses_are_retried() {
    let (kms, transport) = client_with([(KmsProvider::aws(), aws_credentials())], fast_retry());
    transport.respond(503, "unavailable");
    transport.respond(429, "slow down");
    transport.respond(
        200,
        serde_json::json!({ "Plaintext": STANDARD.encode(b"data key") }).to_string(),
    );

    let plaintext = kms.unwrap_key(&aws_key(), b"ciphertext").await.unwrap();
    assert_eq!(plaintext, b"data key");
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn retries_are_bounded() {
    let (kms, transport) = client_with([(KmsProvider::aws(), aws_credentials())], fast_retry());
    for _ in 0..3 {
        transport.respond(500, "internal error");
    }
    let error = kms.unwrap_key(&aws_key(), b"ciphertext").await.unwrap_err();
    assert!(error.contains_label(retry::TRANSIENT_KMS_ERROR));
    assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let (kms, transport) = client_with([(KmsProvider::aws(), aws_credentials())], fast_retry());
    transport.respond(403, r#"{"__type":"AccessDeniedException"}"#);

    let error = kms.unwrap_key(&aws_key(), b"ciphertext").await.unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::Kms {
            kind: KmsErrorKind::Auth,
            ..
        }
    ));
    assert_eq!(transport.request_count(), 1);

    transport.respond(400, r#"{"__type":"UnrecognizedClientException"}"#);
    let error = kms.unwrap_key(&aws_key(), b"ciphertext").await.unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::Kms {
            kind: KmsErrorKind::Auth,
            ..
        }
    ));
    assert_eq!(transport.request_count(), 2);
}

#[tokio::test]
async fn azure_tokens_are_cached() {
    let (kms, transport) = client_with(
        [(
            KmsProvider::azure(),
            doc! { "tenantId": "tenant", "clientId": "client", "clientSecret": "secret" },
        )],
        fast_retry(),
    );
    let key = MasterKey::Azure {
        name: None,
        key_vault_endpoint: "vault.example.net".to_string(),
        key_name: "key".to_string(),
        key_version: None,
    };
    let token = serde_json::json!({ "access_token": "tok", "expires_in": "3600" }).to_string();
    let wrapped = serde_json::json!({ "value": URL_SAFE_NO_PAD.encode(b"wrapped") }).to_string();
    transport.respond(200, token);
    transport.respond(200, wrapped.clone());
    transport.respond(200, wrapped);

    kms.wrap_key(&key, b"dek").await.unwrap();
    kms.wrap_key(&key, b"dek").await.unwrap();

    let requests = transport.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[0].url,
        "https://login.microsoftonline.com/tenant/oauth2/v2.0/token"
    );
    assert_eq!(
        requests[1].url,
        "https://vault.example.net/keys/key/wrapkey?api-version=7.3"
    );
    assert!(requests[2]
        .headers
        .contains(&("Authorization".to_string(), "Bearer tok".to_string())));
}

#[tokio::test]
async fn gcp_with_access_token() {
    let (kms, transport) = client_with(
        [(KmsProvider::gcp(), doc! { "accessToken": "ya29.token" })],
        fast_retry(),
    );
    let key = MasterKey::Gcp {
        name: None,
        project_id: "proj".to_string(),
        location: "global".to_string(),
        key_ring: "ring".to_string(),
        key_name: "key".to_string(),
        key_version: Some("2".to_string()),
        endpoint: None,
    };
    transport.respond(
        200,
        serde_json::json!({ "plaintext": STANDARD.encode(b"dek") }).to_string(),
    );
    assert_eq!(kms.unwrap_key(&key, b"wrapped").await.unwrap(), b"dek");

    let requests = transport.requests.lock().unwrap();
    assert_eq!(
        requests[0].url,
        "https://cloudkms.googleapis.com/v1/projects/proj/locations/global/keyRings/ring/\
         cryptoKeys/key:decrypt"
    );
}

#[tokio::test]
async fn kmip_registers_a_key_when_none_is_given() {
    let (kms, transport) = client_with(
        [(KmsProvider::kmip(), doc! { "endpoint": "kmip.example.com" })],
        RetryPolicy::disabled(),
    );
    let key = MasterKey::Kmip {
        name: None,
        key_id: None,
        endpoint: None,
        delegated: None,
    };
    let data_key = vec![5u8; KEY_LEN];
    let (wrapped, stored) = kms.wrap_key(&key, &data_key).await.unwrap();
    let MasterKey::Kmip { key_id: Some(ref key_id), .. } = stored else {
        panic!("expected a key id, got {stored:?}");
    };
    assert_eq!(key_id, "1");
    assert_eq!(kms.unwrap_key(&stored, &wrapped).await.unwrap(), data_key);

    // Register, Activate, Get, then Get again to unwrap.
    assert_eq!(
        *transport.kmip.operations.lock().unwrap(),
        vec![0x03, 0x12, 0x0A, 0x0A]
    );
}
