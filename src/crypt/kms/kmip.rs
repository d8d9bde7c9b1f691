//! A minimal KMIP 1.0 client speaking TTLV (tag, type, length, value) over TLS.
//!
//! Non-delegated keys follow the pattern used by other MongoDB drivers: a 96-byte secret is
//! registered and activated on the server, then fetched with `Get` and used as a local AEAD key.
//! Delegated keys are AES-256 keys created on the server, which performs the `Encrypt` and
//! `Decrypt` operations itself; the stored data key is the IV followed by the ciphertext.

use rand::RngCore;

use super::{KmsContext, MasterKey};
use crate::{
    crypt::aead::{self, IvMode, KEY_LEN},
    error::{Error, Result},
};

pub(super) const DEFAULT_PORT: u16 = 5696;
pub(super) const HEADER_LEN: usize = 8;
const MAX_MESSAGE_LEN: usize = 1024 * 1024;
const IV_LEN: usize = 16;

mod tag {
    pub(super) const ATTRIBUTE: u32 = 0x420008;
    pub(super) const ATTRIBUTE_NAME: u32 = 0x42000A;
    pub(super) const ATTRIBUTE_VALUE: u32 = 0x42000B;
    pub(super) const BATCH_COUNT: u32 = 0x42000D;
    pub(super) const BATCH_ITEM: u32 = 0x42000F;
    pub(super) const BLOCK_CIPHER_MODE: u32 = 0x420011;
    pub(super) const CRYPTOGRAPHIC_ALGORITHM: u32 = 0x420028;
    pub(super) const CRYPTOGRAPHIC_PARAMETERS: u32 = 0x42002B;
    pub(super) const IV_COUNTER_NONCE: u32 = 0x42003D;
    pub(super) const KEY_BLOCK: u32 = 0x420040;
    pub(super) const KEY_FORMAT_TYPE: u32 = 0x420042;
    pub(super) const KEY_MATERIAL: u32 = 0x420043;
    pub(super) const KEY_VALUE: u32 = 0x420045;
    pub(super) const OBJECT_TYPE: u32 = 0x420057;
    pub(super) const OPERATION: u32 = 0x42005C;
    pub(super) const PADDING_METHOD: u32 = 0x42005F;
    pub(super) const PROTOCOL_VERSION: u32 = 0x420069;
    pub(super) const PROTOCOL_VERSION_MAJOR: u32 = 0x42006A;
    pub(super) const PROTOCOL_VERSION_MINOR: u32 = 0x42006B;
    pub(super) const REQUEST_HEADER: u32 = 0x420077;
    pub(super) const REQUEST_MESSAGE: u32 = 0x420078;
    pub(super) const REQUEST_PAYLOAD: u32 = 0x420079;
    pub(super) const RESPONSE_PAYLOAD: u32 = 0x42007C;
    pub(super) const RESULT_MESSAGE: u32 = 0x42007D;
    pub(super) const RESULT_REASON: u32 = 0x42007E;
    pub(super) const RESULT_STATUS: u32 = 0x42007F;
    pub(super) const SECRET_DATA: u32 = 0x420085;
    pub(super) const SECRET_DATA_TYPE: u32 = 0x420086;
    pub(super) const TEMPLATE_ATTRIBUTE: u32 = 0x420091;
    pub(super) const UNIQUE_IDENTIFIER: u32 = 0x420094;
    pub(super) const DATA: u32 = 0x4200C2;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
enum Operation {
    Create = 0x01,
    Register = 0x03,
    Get = 0x0A,
    Activate = 0x12,
    Encrypt = 0x1F,
    Decrypt = 0x20,
}

const OBJECT_TYPE_SYMMETRIC_KEY: u32 = 0x02;
const OBJECT_TYPE_SECRET_DATA: u32 = 0x07;
const SECRET_DATA_TYPE_SEED: u32 = 0x02;
const KEY_FORMAT_OPAQUE: u32 = 0x02;
const ALGORITHM_AES: u32 = 0x03;
const BLOCK_CIPHER_MODE_CBC: u32 = 0x01;
const PADDING_PKCS5: u32 = 0x03;
const USAGE_ENCRYPT_DECRYPT: i32 = 0x04 | 0x08;
const RESULT_SUCCESS: u32 = 0x00;

/// A single TTLV item.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct Item {
    tag: u32,
    value: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub(super) enum Value {
    Structure(Vec<Item>),
    Integer(i32),
    Enumeration(u32),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn type_code(&self) -> u8 {
        match self {
            Self::Structure(_) => 0x01,
            Self::Integer(_) => 0x02,
            Self::Enumeration(_) => 0x05,
            Self::Text(_) => 0x07,
            Self::Bytes(_) => 0x08,
        }
    }
}

fn item(tag: u32, value: Value) -> Item {
    Item { tag, value }
}

fn structure(tag: u32, items: Vec<Item>) -> Item {
    item(tag, Value::Structure(items))
}

fn enumeration(tag: u32, value: u32) -> Item {
    item(tag, Value::Enumeration(value))
}

fn text(tag: u32, value: impl Into<String>) -> Item {
    item(tag, Value::Text(value.into()))
}

fn attribute(name: &str, value: Value) -> Item {
    structure(
        tag::ATTRIBUTE,
        vec![
            text(tag::ATTRIBUTE_NAME, name),
            item(tag::ATTRIBUTE_VALUE, value),
        ],
    )
}

impl Item {
    pub(super) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.to_be_bytes()[1..]);
        out.push(self.value.type_code());
        let len_at = out.len();
        out.extend_from_slice(&[0; 4]);
        let start = out.len();
        match &self.value {
            Value::Structure(items) => items.iter().for_each(|i| i.encode(out)),
            Value::Integer(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Enumeration(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Text(s) => out.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => out.extend_from_slice(b),
        }
        let len = out.len() - start;
        out[len_at..start].copy_from_slice(&(len as u32).to_be_bytes());
        out.resize(start + len.next_multiple_of(8), 0);
    }

    /// Decodes one item from the front of `bytes`, returning it and the number of bytes used.
    pub(super) fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let malformed = |what: &str| Error::invalid_response(format!("malformed KMIP {what}"));
        if bytes.len() < HEADER_LEN {
            return Err(malformed("item header"));
        }
        let tag = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let padded = len.next_multiple_of(8);
        let body = bytes
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or_else(|| malformed("item length"))?;
        let four = || -> Result<[u8; 4]> {
            body.get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| malformed("integer"))
        };
        let value = match bytes[3] {
            0x01 => {
                let mut items = Vec::new();
                let mut offset = 0;
                while offset < body.len() {
                    let (child, used) = Self::decode(&body[offset..])?;
                    items.push(child);
                    offset += used;
                }
                Value::Structure(items)
            }
            0x02 => Value::Integer(i32::from_be_bytes(four()?)),
            0x05 => Value::Enumeration(u32::from_be_bytes(four()?)),
            0x07 => Value::Text(String::from_utf8_lossy(body).into_owned()),
            // Long integers, booleans, date-times and intervals are kept as raw bytes.
            0x03 | 0x06 | 0x08 | 0x09 | 0x0A => Value::Bytes(body.to_vec()),
            other => return Err(malformed(&format!("item type {other:#04x}"))),
        };
        Ok((Item { tag, value }, (HEADER_LEN + padded).min(bytes.len())))
    }

    fn children(&self) -> &[Item] {
        match &self.value {
            Value::Structure(items) => items,
            _ => &[],
        }
    }

    fn child(&self, tag: u32) -> Option<&Item> {
        self.children().iter().find(|i| i.tag == tag)
    }

    /// Follows a path of tags through nested structures.
    fn find(&self, path: &[u32]) -> Option<&Item> {
        path.iter().try_fold(self, |item, tag| item.child(*tag))
    }
}

/// The length of the message whose first [`HEADER_LEN`] bytes are `header`.
pub(super) fn message_len(header: &[u8; HEADER_LEN]) -> Result<usize> {
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::invalid_response(format!(
            "KMIP response of {len} bytes exceeds the maximum of {MAX_MESSAGE_LEN}"
        )));
    }
    Ok(len)
}

fn request(operation: Operation, payload: Vec<Item>) -> Vec<u8> {
    let message = structure(
        tag::REQUEST_MESSAGE,
        vec![
            structure(
                tag::REQUEST_HEADER,
                vec![
                    structure(
                        tag::PROTOCOL_VERSION,
                        vec![
                            item(tag::PROTOCOL_VERSION_MAJOR, Value::Integer(1)),
                            item(tag::PROTOCOL_VERSION_MINOR, Value::Integer(0)),
                        ],
                    ),
                    item(tag::BATCH_COUNT, Value::Integer(1)),
                ],
            ),
            structure(
                tag::BATCH_ITEM,
                vec![
                    enumeration(tag::OPERATION, operation as u32),
                    structure(tag::REQUEST_PAYLOAD, payload),
                ],
            ),
        ],
    );
    let mut out = Vec::new();
    message.encode(&mut out);
    out
}

async fn call(
    ctx: &KmsContext<'_>,
    endpoint: &str,
    operation: Operation,
    payload: Vec<Item>,
) -> Result<Item> {
    let response = ctx
        .send_kmip(endpoint, request(operation, payload))
        .await?;
    let (message, _) = Item::decode(&response)
        .map_err(|e| ctx.response_error(format!("invalid KMIP response: {e}")))?;
    let batch = message
        .child(tag::BATCH_ITEM)
        .ok_or_else(|| ctx.response_error("KMIP response has no batch item"))?;
    match batch.child(tag::RESULT_STATUS).map(|i| &i.value) {
        Some(Value::Enumeration(RESULT_SUCCESS)) => {}
        status => {
            let reason = batch.child(tag::RESULT_REASON).map(|i| &i.value);
            let message = match batch.child(tag::RESULT_MESSAGE).map(|i| &i.value) {
                Some(Value::Text(m)) => m.as_str(),
                _ => "",
            };
            return Err(ctx.response_error(format!(
                "KMIP {operation:?} failed with status {status:?}, reason {reason:?}: {message}"
            )));
        }
    }
    batch
        .child(tag::RESPONSE_PAYLOAD)
        .cloned()
        .ok_or_else(|| ctx.response_error(format!("KMIP {operation:?} response has no payload")))
}

fn text_field(ctx: &KmsContext<'_>, payload: &Item, tag: u32, what: &str) -> Result<String> {
    match payload.child(tag).map(|i| &i.value) {
        Some(Value::Text(s)) => Ok(s.clone()),
        _ => Err(ctx.response_error(format!("KMIP response is missing {what}"))),
    }
}

fn bytes_field(ctx: &KmsContext<'_>, payload: &Item, path: &[u32], what: &str) -> Result<Vec<u8>> {
    match payload.find(path).map(|i| &i.value) {
        Some(Value::Bytes(b)) => Ok(b.clone()),
        _ => Err(ctx.response_error(format!("KMIP response is missing {what}"))),
    }
}

fn usage_mask() -> Item {
    attribute(
        "Cryptographic Usage Mask",
        Value::Integer(USAGE_ENCRYPT_DECRYPT),
    )
}

async fn register_secret(ctx: &KmsContext<'_>, endpoint: &str) -> Result<String> {
    let mut secret = vec![0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut secret);
    let payload = call(
        ctx,
        endpoint,
        Operation::Register,
        vec![
            enumeration(tag::OBJECT_TYPE, OBJECT_TYPE_SECRET_DATA),
            structure(tag::TEMPLATE_ATTRIBUTE, vec![usage_mask()]),
            structure(
                tag::SECRET_DATA,
                vec![
                    enumeration(tag::SECRET_DATA_TYPE, SECRET_DATA_TYPE_SEED),
                    structure(
                        tag::KEY_BLOCK,
                        vec![
                            enumeration(tag::KEY_FORMAT_TYPE, KEY_FORMAT_OPAQUE),
                            structure(
                                tag::KEY_VALUE,
                                vec![item(tag::KEY_MATERIAL, Value::Bytes(secret))],
                            ),
                        ],
                    ),
                ],
            ),
        ],
    )
    .await?;
    text_field(ctx, &payload, tag::UNIQUE_IDENTIFIER, "the unique identifier")
}

async fn create_symmetric_key(ctx: &KmsContext<'_>, endpoint: &str) -> Result<String> {
    let payload = call(
        ctx,
        endpoint,
        Operation::Create,
        vec![
            enumeration(tag::OBJECT_TYPE, OBJECT_TYPE_SYMMETRIC_KEY),
            structure(
                tag::TEMPLATE_ATTRIBUTE,
                vec![
                    attribute(
                        "Cryptographic Algorithm",
                        Value::Enumeration(ALGORITHM_AES),
                    ),
                    attribute("Cryptographic Length", Value::Integer(256)),
                    usage_mask(),
                ],
            ),
        ],
    )
    .await?;
    text_field(ctx, &payload, tag::UNIQUE_IDENTIFIER, "the unique identifier")
}

async fn activate(ctx: &KmsContext<'_>, endpoint: &str, key_id: &str) -> Result<()> {
    call(
        ctx,
        endpoint,
        Operation::Activate,
        vec![text(tag::UNIQUE_IDENTIFIER, key_id)],
    )
    .await
    .map(|_| ())
}

async fn get_secret(ctx: &KmsContext<'_>, endpoint: &str, key_id: &str) -> Result<Vec<u8>> {
    let payload = call(
        ctx,
        endpoint,
        Operation::Get,
        vec![text(tag::UNIQUE_IDENTIFIER, key_id)],
    )
    .await?;
    let secret = bytes_field(
        ctx,
        &payload,
        &[
            tag::SECRET_DATA,
            tag::KEY_BLOCK,
            tag::KEY_VALUE,
            tag::KEY_MATERIAL,
        ],
        "the secret data",
    )?;
    if secret.len() != KEY_LEN {
        return Err(ctx.response_error(format!(
            "KMIP secret {key_id} is {} bytes, expected {KEY_LEN}",
            secret.len()
        )));
    }
    Ok(secret)
}

fn cipher_parameters() -> Item {
    structure(
        tag::CRYPTOGRAPHIC_PARAMETERS,
        vec![
            enumeration(tag::BLOCK_CIPHER_MODE, BLOCK_CIPHER_MODE_CBC),
            enumeration(tag::PADDING_METHOD, PADDING_PKCS5),
            enumeration(tag::CRYPTOGRAPHIC_ALGORITHM, ALGORITHM_AES),
        ],
    )
}

async fn remote_encrypt(
    ctx: &KmsContext<'_>,
    endpoint: &str,
    key_id: &str,
    data: &[u8],
) -> Result<Vec<u8>> {
    let payload = call(
        ctx,
        endpoint,
        Operation::Encrypt,
        vec![
            text(tag::UNIQUE_IDENTIFIER, key_id),
            cipher_parameters(),
            item(tag::DATA, Value::Bytes(data.to_vec())),
        ],
    )
    .await?;
    let mut out = bytes_field(ctx, &payload, &[tag::IV_COUNTER_NONCE], "the IV")?;
    out.extend(bytes_field(ctx, &payload, &[tag::DATA], "the ciphertext")?);
    Ok(out)
}

async fn remote_decrypt(
    ctx: &KmsContext<'_>,
    endpoint: &str,
    key_id: &str,
    wrapped: &[u8],
) -> Result<Vec<u8>> {
    if wrapped.len() <= IV_LEN {
        return Err(Error::encryption("KMIP delegated key material is too short"));
    }
    let (iv, data) = wrapped.split_at(IV_LEN);
    let payload = call(
        ctx,
        endpoint,
        Operation::Decrypt,
        vec![
            text(tag::UNIQUE_IDENTIFIER, key_id),
            cipher_parameters(),
            item(tag::DATA, Value::Bytes(data.to_vec())),
            item(tag::IV_COUNTER_NONCE, Value::Bytes(iv.to_vec())),
        ],
    )
    .await?;
    bytes_field(ctx, &payload, &[tag::DATA], "the plaintext")
}

struct KmipKey<'a> {
    key_id: Option<&'a str>,
    endpoint: String,
    delegated: bool,
}

fn describe<'a>(ctx: &KmsContext<'_>, master_key: &'a MasterKey) -> Result<KmipKey<'a>> {
    let MasterKey::Kmip {
        key_id,
        endpoint,
        delegated,
        ..
    } = master_key
    else {
        return Err(Error::internal("expected a KMIP master key"));
    };
    let endpoint = match endpoint {
        Some(endpoint) => endpoint.clone(),
        None => ctx.credential_str("endpoint")?.to_string(),
    };
    Ok(KmipKey {
        key_id: key_id.as_deref(),
        endpoint,
        delegated: delegated.unwrap_or(false),
    })
}

pub(super) async fn wrap(
    ctx: &KmsContext<'_>,
    master_key: &MasterKey,
    data_key: &[u8],
) -> Result<(Vec<u8>, MasterKey)> {
    let key = describe(ctx, master_key)?;
    let key_id = match key.key_id {
        Some(id) => id.to_string(),
        None => {
            let id = if key.delegated {
                create_symmetric_key(ctx, &key.endpoint).await?
            } else {
                register_secret(ctx, &key.endpoint).await?
            };
            activate(ctx, &key.endpoint, &id).await?;
            id
        }
    };

    let wrapped = if key.delegated {
        remote_encrypt(ctx, &key.endpoint, &key_id, data_key).await?
    } else {
        let kek = get_secret(ctx, &key.endpoint, &key_id).await?;
        aead::encrypt(&kek, data_key, &[], IvMode::Random)?
    };

    let mut stored = master_key.clone();
    if let MasterKey::Kmip { key_id: id, .. } = &mut stored {
        *id = Some(key_id);
    }
    Ok((wrapped, stored))
}

pub(super) async fn unwrap(
    ctx: &KmsContext<'_>,
    master_key: &MasterKey,
    wrapped: &[u8],
) -> Result<Vec<u8>> {
    let key = describe(ctx, master_key)?;
    let key_id = key
        .key_id
        .ok_or_else(|| Error::invalid_argument("KMIP master key is missing keyId"))?;
    if key.delegated {
        remote_decrypt(ctx, &key.endpoint, key_id, wrapped).await
    } else {
        let kek = get_secret(ctx, &key.endpoint, key_id).await?;
        aead::decrypt(&kek, wrapped, &[])
    }
}

#[cfg(test)]
pub(super) mod test_server {
    //! Just enough of a KMIP server to exercise the client.

    use std::{collections::HashMap, sync::Mutex};

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct FakeKmip {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        pub(crate) operations: Mutex<Vec<u32>>,
    }

    fn response(payload: Vec<Item>) -> Vec<u8> {
        let message = structure(
            0x42007B,
            vec![structure(
                tag::BATCH_ITEM,
                vec![
                    enumeration(tag::RESULT_STATUS, RESULT_SUCCESS),
                    structure(tag::RESPONSE_PAYLOAD, payload),
                ],
            )],
        );
        let mut out = Vec::new();
        message.encode(&mut out);
        out
    }

    impl FakeKmip {
        pub(crate) fn handle(&self, message: &[u8]) -> Vec<u8> {
            let (request, _) = Item::decode(message).unwrap();
            let batch = request.child(tag::BATCH_ITEM).unwrap();
            let Some(Value::Enumeration(op)) = batch.child(tag::OPERATION).map(|i| &i.value)
            else {
                panic!("missing operation");
            };
            self.operations.lock().unwrap().push(*op);
            let payload = batch.child(tag::REQUEST_PAYLOAD).unwrap();
            let uid = || match payload.child(tag::UNIQUE_IDENTIFIER).map(|i| &i.value) {
                Some(Value::Text(s)) => s.clone(),
                _ => panic!("missing unique identifier"),
            };
            let mut objects = self.objects.lock().unwrap();
            match *op {
                op if op == Operation::Register as u32 => {
                    let Some(Value::Bytes(secret)) = payload
                        .find(&[
                            tag::SECRET_DATA,
                            tag::KEY_BLOCK,
                            tag::KEY_VALUE,
                            tag::KEY_MATERIAL,
                        ])
                        .map(|i| i.value.clone())
                    else {
                        panic!("missing secret");
                    };
                    let id = (objects.len() + 1).to_string();
                    objects.insert(id.clone(), secret);
                    response(vec![text(tag::UNIQUE_IDENTIFIER, id)])
                }
                op if op == Operation::Activate as u32 => {
                    response(vec![text(tag::UNIQUE_IDENTIFIER, uid())])
                }
                op if op == Operation::Get as u32 => {
                    let secret = objects[&uid()].clone();
                    response(vec![
                        text(tag::UNIQUE_IDENTIFIER, uid()),
                        structure(
                            tag::SECRET_DATA,
                            vec![structure(
                                tag::KEY_BLOCK,
                                vec![structure(
                                    tag::KEY_VALUE,
                                    vec![item(tag::KEY_MATERIAL, Value::Bytes(secret))],
                                )],
                            )],
                        ),
                    ])
                }
                other => panic!("unexpected KMIP operation {other:#x}"),
            }
        }
    }
}
