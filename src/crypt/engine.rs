//! Turns markings into encrypted payloads and encrypted payloads back into values.

use std::{fmt, str::FromStr, sync::Arc};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Uuid};
use rand::Rng;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{
    aead::{self, IvMode},
    key_broker::{EncryptKey, KeyBroker},
    marking::{Marking, QeAlgorithm, RangeBounds, RangeOp, RangeQuery},
    payload::{self, BlobSubtype, CiphertextBlob},
    tokens::{self, CollectionTokens, RangeSpec, Token},
};
use crate::{
    error::{Error, Result},
    trace::ENCRYPTION_TRACING_EVENT_TARGET,
};

/// An encryption algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Algorithm {
    /// Equal plaintexts encrypt to equal ciphertexts, so the field can be queried for equality.
    #[serde(rename = "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic")]
    Deterministic,
    /// Every encryption uses a fresh IV.
    #[serde(rename = "AEAD_AES_256_CBC_HMAC_SHA_512-Random")]
    Random,
    /// Queryable encryption with an equality index.
    Indexed,
    /// Queryable encryption without an index.
    Unindexed,
    /// Queryable encryption with a range index.
    Range,
}

impl Algorithm {
    /// The name used in schemas and commands.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            Self::Random => "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
            Self::Indexed => "Indexed",
            Self::Unindexed => "Unindexed",
            Self::Range => "Range",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::Deterministic,
            Self::Random,
            Self::Indexed,
            Self::Unindexed,
            Self::Range,
        ]
        .into_iter()
        .find(|a| a.as_str() == s)
        .ok_or_else(|| Error::invalid_argument(format!("unknown encryption algorithm {s:?}")))
    }
}

/// The kind of query an explicitly encrypted value is used in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum QueryType {
    /// An equality match on an `Indexed` field.
    Equality,
    /// A `$gt`/`$gte`/`$lt`/`$lte` query on a `Range` field.
    Range,
}

/// Index parameters of a `Range` field. They must match the collection's `encryptedFields`.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct RangeOptions {
    /// The smallest value of the field. Required for doubles with a precision.
    pub min: Option<Bson>,

    /// The largest value of the field.
    pub max: Option<Bson>,

    /// How many bits each stored edge covers. Defaults to 2.
    pub sparsity: Option<u32>,

    /// Decimal digits kept of a double value.
    pub precision: Option<u32>,

    /// How many of the topmost levels of the edge tree are left out. Defaults to 0.
    pub trim_factor: Option<u32>,
}

impl RangeOptions {
    fn spec(&self) -> RangeSpec {
        RangeSpec {
            min: self.min.clone(),
            max: self.max.clone(),
            sparsity: self.sparsity.unwrap_or(RangeSpec::DEFAULT_SPARSITY),
            precision: self.precision,
            trim_factor: self.trim_factor.unwrap_or(0),
        }
    }
}

/// Options for explicit encryption.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct EncryptOptions {
    /// Number of contention buckets. Required for `Indexed` and `Range`.
    pub contention_factor: Option<u64>,

    /// Set when encrypting a query operand rather than a value to store.
    pub query_type: Option<QueryType>,

    /// Required for `Range`.
    pub range_options: Option<RangeOptions>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TypeRules {
    Deterministic,
    Random,
    Indexed,
}

fn check_type(rules: TypeRules, value: &Bson) -> Result<()> {
    let refused = match rules {
        TypeRules::Deterministic | TypeRules::Indexed => matches!(
            value,
            Bson::Double(_)
                | Bson::Decimal128(_)
                | Bson::Document(_)
                | Bson::Array(_)
                | Bson::Null
                | Bson::Undefined
                | Bson::MinKey
                | Bson::MaxKey
        ) || (rules == TypeRules::Deterministic && matches!(value, Bson::Boolean(_))),
        TypeRules::Random => matches!(
            value,
            Bson::Null | Bson::Undefined | Bson::MinKey | Bson::MaxKey
        ),
    };
    if refused {
        let how = match rules {
            TypeRules::Deterministic => "deterministically encrypt",
            TypeRules::Random => "encrypt",
            TypeRules::Indexed => "index",
        };
        return Err(Error::encryption(format!(
            "cannot {how} a value of type {}",
            super::schema::type_name(value)
        )));
    }
    Ok(())
}

fn check_not_encrypted(value: &Bson) -> Result<()> {
    if let Bson::Binary(binary) = value {
        if binary.subtype == BinarySubtype::Encrypted {
            return Err(Error::encryption(
                "cannot encrypt a value that is already encrypted",
            ));
        }
    }
    Ok(())
}

fn token_bson(token: &Token) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: token.to_vec(),
    })
}

fn bytes_bson(bytes: Vec<u8>) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    })
}

/// The edges whose union is the query interval of `bounds`. Ends outside `[min, max]` are
/// clamped, and an interval that misses the domain entirely has no edges.
fn range_cover(range: &RangeSpec, bounds: &RangeBounds) -> Result<Vec<String>> {
    use std::cmp::Ordering;

    let sample = bounds
        .lower
        .as_ref()
        .or(bounds.upper.as_ref())
        .map(|(v, _)| v)
        .ok_or_else(|| Error::encryption("a range query needs at least one bound"))?;
    range.validate(sample)?;
    let domain_max = match (&range.min, &range.max) {
        (Some(min), Some(_)) => range.encode(min)?.domain_max,
        _ => range.encode(sample)?.domain_max,
    };

    let below_min = |v: &Bson| -> Result<bool> {
        Ok(match range.min {
            Some(ref min) => tokens::compare(v, min)? == Ordering::Less,
            None => false,
        })
    };
    let above_max = |v: &Bson| -> Result<bool> {
        Ok(match range.max {
            Some(ref max) => tokens::compare(v, max)? == Ordering::Greater,
            None => false,
        })
    };

    let lower = match bounds.lower {
        None => 0,
        Some((ref v, inclusive)) => {
            if above_max(v)? {
                return Ok(Vec::new());
            }
            if below_min(v)? {
                0
            } else {
                let encoded = range.encode(v)?.value;
                match (inclusive, encoded.checked_add(1)) {
                    (true, _) => encoded,
                    (false, Some(next)) if next <= domain_max => next,
                    (false, _) => return Ok(Vec::new()),
                }
            }
        }
    };
    let upper = match bounds.upper {
        None => domain_max,
        Some((ref v, inclusive)) => {
            if below_min(v)? {
                return Ok(Vec::new());
            }
            if above_max(v)? {
                domain_max
            } else {
                let encoded = range.encode(v)?.value;
                match (inclusive, encoded.checked_sub(1)) {
                    (true, _) => encoded,
                    (false, Some(previous)) => previous,
                    (false, None) => return Ok(Vec::new()),
                }
            }
        }
    };
    range.cover(lower, upper, domain_max)
}

fn operator_pair(query: &RangeQuery, doc: &mut Document) {
    doc.insert("payloadId", query.payload_id);
    doc.insert("firstOperator", query.first_operator as i32);
    if let Some(second) = query.second_operator {
        doc.insert("secondOperator", second as i32);
    }
}

/// Calls `f` on every non-container value below `value`, with its dotted path.
fn for_each_leaf(value: &mut Bson, path: &mut String, f: &mut dyn FnMut(&str, &mut Bson)) {
    let descend = |path: &mut String, key: &str| {
        let len = path.len();
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(key);
        len
    };
    match value {
        Bson::Document(doc) => {
            for (key, child) in doc.iter_mut() {
                let len = descend(path, key);
                for_each_leaf(child, path, f);
                path.truncate(len);
            }
        }
        Bson::Array(items) => {
            for (i, child) in items.iter_mut().enumerate() {
                let len = descend(path, &i.to_string());
                for_each_leaf(child, path, f);
                path.truncate(len);
            }
        }
        leaf => f(path, leaf),
    }
}

/// Encrypts and decrypts values with data keys resolved through a [`KeyBroker`].
#[derive(Debug)]
pub(crate) struct Engine {
    keys: KeyBroker,
}

impl Engine {
    pub(crate) fn new(keys: KeyBroker) -> Self {
        Self { keys }
    }

    pub(crate) fn keys(&self) -> &KeyBroker {
        &self.keys
    }

    async fn key_id(&self, key: EncryptKey) -> Result<Uuid> {
        match key {
            EncryptKey::Id(id) => Ok(id),
            alt_name => Ok(self.keys.resolve(&alt_name).await?.0),
        }
    }

    async fn material(&self, key_id: Uuid) -> Result<Arc<Vec<u8>>> {
        Ok(self.keys.resolve(&EncryptKey::Id(key_id)).await?.1)
    }

    /// The marking explicit encryption of `value` stands for.
    async fn explicit_marking(
        &self,
        value: Bson,
        key: EncryptKey,
        algorithm: Algorithm,
        options: &EncryptOptions,
    ) -> Result<Marking> {
        let queryable = matches!(algorithm, Algorithm::Indexed | Algorithm::Range);
        if !queryable && options.contention_factor.is_some() {
            return Err(Error::invalid_argument(format!(
                "a contention factor cannot be set with the {algorithm} algorithm"
            )));
        }
        if !queryable && options.query_type.is_some() {
            return Err(Error::invalid_argument(format!(
                "a query type cannot be set with the {algorithm} algorithm"
            )));
        }
        if algorithm != Algorithm::Range && options.range_options.is_some() {
            return Err(Error::invalid_argument(format!(
                "range options cannot be set with the {algorithm} algorithm"
            )));
        }
        let contention = || {
            options.contention_factor.ok_or_else(|| {
                Error::invalid_argument(format!(
                    "a contention factor is required for the {algorithm} algorithm"
                ))
            })
        };

        Ok(match algorithm {
            Algorithm::Deterministic | Algorithm::Random => Marking::Fle1 {
                algorithm,
                key,
                value,
            },
            Algorithm::Unindexed => Marking::Insert {
                algorithm: QeAlgorithm::Unindexed,
                key_id: self.key_id(key).await?,
                value,
                contention: 0,
                range: None,
            },
            Algorithm::Indexed => match options.query_type {
                None => Marking::Insert {
                    algorithm: QeAlgorithm::Equality,
                    key_id: self.key_id(key).await?,
                    value,
                    contention: contention()?,
                    range: None,
                },
                Some(QueryType::Equality) => Marking::FindEquality {
                    key_id: self.key_id(key).await?,
                    value,
                    contention: contention()?,
                },
                Some(QueryType::Range) => {
                    return Err(Error::invalid_argument(
                        "the Range query type requires the Range algorithm",
                    ))
                }
            },
            Algorithm::Range => {
                let range = options
                    .range_options
                    .as_ref()
                    .ok_or_else(|| {
                        Error::invalid_argument(
                            "range options are required for the Range algorithm",
                        )
                    })?
                    .spec();
                match options.query_type {
                    None => Marking::Insert {
                        algorithm: QeAlgorithm::Range,
                        key_id: self.key_id(key).await?,
                        value,
                        contention: contention()?,
                        range: Some(range),
                    },
                    Some(QueryType::Range) => {
                        return Err(Error::invalid_argument(
                            "range queries are encrypted with encrypt_expression",
                        ))
                    }
                    Some(QueryType::Equality) => {
                        return Err(Error::invalid_argument(
                            "the Equality query type requires the Indexed algorithm",
                        ))
                    }
                }
            }
        })
    }

    /// Explicitly encrypts a single value.
    pub(crate) async fn encrypt_value(
        &self,
        value: Bson,
        key: EncryptKey,
        algorithm: Algorithm,
        options: &EncryptOptions,
    ) -> Result<Binary> {
        let marking = self
            .explicit_marking(value, key, algorithm, options)
            .await?;
        self.encrypt_marking(&marking).await
    }

    /// Explicitly encrypts the operands of a range predicate: `{$and: [{f: {$gt: a}}, {f: {$lt:
    /// b}}]}`, its aggregate form `{$and: [{$gt: ["$f", a]}, {$lt: ["$f", b]}]}`, or either with
    /// a single bound.
    pub(crate) async fn encrypt_expression(
        &self,
        expression: Document,
        key: EncryptKey,
        options: &EncryptOptions,
    ) -> Result<Document> {
        if options.query_type != Some(QueryType::Range) {
            return Err(Error::invalid_argument(
                "encrypt_expression requires the Range query type",
            ));
        }
        let contention = options.contention_factor.ok_or_else(|| {
            Error::invalid_argument("a contention factor is required for the Range algorithm")
        })?;
        let range = options
            .range_options
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("range options are required for range queries"))?
            .spec();

        let mut expression = expression;
        let mut operands = RangeExpression::parse(&mut expression)?;
        let mut bounds = RangeBounds::default();
        for operand in &operands.items {
            bounds.add(operand.op, operand.value.clone())?;
        }
        let key_id = self.key_id(key).await?;
        let first_operator = operands.items[0].op;
        let second_operator = operands.items.get(1).map(|o| o.op);
        for (i, operand) in operands.items.iter_mut().enumerate() {
            let marking = Marking::FindRange {
                key_id,
                contention,
                range: range.clone(),
                query: RangeQuery {
                    payload_id: 0,
                    first_operator,
                    second_operator,
                    bounds: (i == 0).then(|| bounds.clone()),
                },
            };
            operand.value = Bson::Binary(self.encrypt_marking(&marking).await?);
        }
        operands.write_back(&mut expression)?;
        Ok(expression)
    }

    /// Replaces every marking in `doc` with its encrypted payload.
    pub(crate) async fn encrypt_markings(&self, doc: Document) -> Result<Document> {
        let mut root = Bson::Document(doc);
        let mut found: Vec<(String, Result<Marking>)> = Vec::new();
        for_each_leaf(&mut root, &mut String::new(), &mut |path, value| {
            if let Bson::Binary(binary) = value {
                match Marking::parse(binary) {
                    Ok(Some(marking)) => found.push((path.to_string(), Ok(marking))),
                    Ok(None) => {}
                    Err(e) => found.push((path.to_string(), Err(e))),
                }
            }
        });

        let mut keys = Vec::new();
        for (_, marking) in &found {
            match marking {
                Ok(Marking::Fle1 { key, .. }) => keys.push(key.clone()),
                Ok(
                    Marking::Insert { key_id, .. }
                    | Marking::FindEquality { key_id, .. }
                    | Marking::FindRange { key_id, .. },
                ) => keys.push(EncryptKey::Id(*key_id)),
                Err(_) => {}
            }
        }
        self.keys.prefetch(&keys).await?;

        let mut encrypted = Vec::with_capacity(found.len());
        for (path, marking) in found {
            let payload = match marking {
                Ok(marking) => self.encrypt_marking(&marking).await,
                Err(e) => Err(e),
            };
            encrypted.push(payload.map_err(|e| e.with_field(&path))?);
        }
        tracing::debug!(
            target: ENCRYPTION_TRACING_EVENT_TARGET,
            fields = encrypted.len(),
            "Encrypted marked fields",
        );

        let mut encrypted = encrypted.into_iter();
        for_each_leaf(&mut root, &mut String::new(), &mut |_, value| {
            if let Bson::Binary(binary) = value {
                if payload::blob_subtype(binary) == Some(BlobSubtype::Marking) {
                    if let Some(payload) = encrypted.next() {
                        *value = Bson::Binary(payload);
                    }
                }
            }
        });
        match root {
            Bson::Document(doc) => Ok(doc),
            _ => Err(Error::internal("encrypted document is no longer a document")),
        }
    }

    pub(crate) async fn encrypt_marking(&self, marking: &Marking) -> Result<Binary> {
        match marking {
            Marking::Fle1 {
                algorithm,
                key,
                value,
            } => {
                let (subtype, rules, iv_mode) = match algorithm {
                    Algorithm::Deterministic => (
                        BlobSubtype::Deterministic,
                        TypeRules::Deterministic,
                        IvMode::Deterministic,
                    ),
                    Algorithm::Random => (BlobSubtype::Random, TypeRules::Random, IvMode::Random),
                    other => {
                        return Err(Error::internal(format!(
                            "{other} is not a field level encryption algorithm"
                        )))
                    }
                };
                check_type(rules, value)?;
                let (key_id, material) = self.keys.resolve(key).await?;
                self.ciphertext(subtype, key_id, &material, value, iv_mode)
                    .map(CiphertextBlob::into_binary)
            }
            Marking::Insert {
                algorithm: QeAlgorithm::Unindexed,
                key_id,
                value,
                ..
            } => {
                check_not_encrypted(value)?;
                check_type(TypeRules::Random, value)?;
                let material = self.material(*key_id).await?;
                self.ciphertext(
                    BlobSubtype::Unindexed,
                    *key_id,
                    &material,
                    value,
                    IvMode::Random,
                )
                .map(CiphertextBlob::into_binary)
            }
            Marking::Insert {
                algorithm,
                key_id,
                value,
                contention,
                range,
            } => {
                check_not_encrypted(value)?;
                let edges = match (algorithm, range) {
                    (QeAlgorithm::Range, Some(range)) => Some(range.edges(range.encode(value)?)?),
                    (QeAlgorithm::Range, None) => {
                        return Err(Error::encryption("range marking is missing its index"))
                    }
                    _ => {
                        check_type(TypeRules::Indexed, value)?;
                        None
                    }
                };
                let material = self.material(*key_id).await?;
                self.insert_payload(*key_id, &material, value, *contention, edges)
            }
            Marking::FindEquality {
                key_id,
                value,
                contention,
            } => {
                check_not_encrypted(value)?;
                check_type(TypeRules::Indexed, value)?;
                let material = self.material(*key_id).await?;
                let tokens = CollectionTokens::new(&material)?;
                let (_, bytes) = payload::value_to_bytes(value)?;
                let value_tokens = tokens.for_value(&bytes)?;
                payload::document_payload(
                    BlobSubtype::FindEquality,
                    &doc! {
                        "d": token_bson(&value_tokens.edc),
                        "s": token_bson(&value_tokens.esc),
                        "l": token_bson(&value_tokens.server),
                        "cm": *contention as i64,
                    },
                )
            }
            Marking::FindRange {
                key_id,
                contention,
                range,
                query,
            } => {
                let mut doc = Document::new();
                if let Some(ref bounds) = query.bounds {
                    let material = self.material(*key_id).await?;
                    let tokens = CollectionTokens::new(&material)?;
                    let mut edges = Vec::new();
                    for edge in range_cover(range, bounds)? {
                        let edge_tokens = tokens.for_value(edge.as_bytes())?;
                        edges.push(doc! {
                            "d": token_bson(&edge_tokens.edc),
                            "s": token_bson(&edge_tokens.esc),
                            "l": token_bson(&edge_tokens.server),
                        });
                    }
                    doc.insert(
                        "payload",
                        doc! { "g": edges, "cm": *contention as i64 },
                    );
                }
                operator_pair(query, &mut doc);
                payload::document_payload(BlobSubtype::FindRange, &doc)
            }
        }
    }

    fn ciphertext(
        &self,
        subtype: BlobSubtype,
        key_id: Uuid,
        material: &[u8],
        value: &Bson,
        iv_mode: IvMode,
    ) -> Result<CiphertextBlob> {
        let (bson_type, bytes) = payload::value_to_bytes(value)?;
        let ad = CiphertextBlob::associated_data(subtype, &key_id, bson_type);
        Ok(CiphertextBlob {
            subtype,
            key_id,
            bson_type,
            ciphertext: aead::encrypt(material, &bytes, &ad, iv_mode)?,
        })
    }

    /// The payload written in place of an indexed value. The server stores `v` as an
    /// [`BlobSubtype::IndexedEquality`] blob, or [`BlobSubtype::IndexedRange`] when edges are
    /// present, and indexes the tokens.
    fn insert_payload(
        &self,
        key_id: Uuid,
        material: &[u8],
        value: &Bson,
        contention: u64,
        edges: Option<Vec<String>>,
    ) -> Result<Binary> {
        let tokens = CollectionTokens::new(material)?;
        let bucket = rand::rng().random_range(0..=contention);
        let stored_subtype = if edges.is_some() {
            BlobSubtype::IndexedRange
        } else {
            BlobSubtype::IndexedEquality
        };
        let (bson_type, bytes) = payload::value_to_bytes(value)?;
        let value_tokens = tokens.for_value(&bytes)?;
        let (edc, esc) = value_tokens.with_contention(bucket)?;
        let ad = CiphertextBlob::associated_data(stored_subtype, &key_id, bson_type);

        let mut doc = doc! {
            "d": token_bson(&edc),
            "s": token_bson(&esc),
            "l": token_bson(&value_tokens.server),
            "p": bytes_bson(aead::seal_token(tokens.ecoc(), &esc)?),
            "u": key_id,
            "t": bson_type as i32,
            "v": bytes_bson(aead::encrypt(material, &bytes, &ad, IvMode::Random)?),
            "e": token_bson(&tokens.server_encryption),
            "k": bucket as i64,
        };
        if let Some(edges) = edges {
            let mut g = Vec::with_capacity(edges.len());
            for edge in edges {
                let edge_tokens = tokens.for_value(edge.as_bytes())?;
                let (edc, esc) = edge_tokens.with_contention(bucket)?;
                g.push(doc! {
                    "d": token_bson(&edc),
                    "s": token_bson(&esc),
                    "l": token_bson(&edge_tokens.server),
                    "p": bytes_bson(aead::seal_token(tokens.ecoc(), &esc)?),
                });
            }
            doc.insert("g", g);
        }
        payload::document_payload(BlobSubtype::InsertUpdate, &doc)
    }

    /// Decrypts one payload.
    pub(crate) async fn decrypt_value(&self, binary: &Binary) -> Result<Bson> {
        if binary.subtype != BinarySubtype::Encrypted {
            return Err(Error::encryption("value to decrypt must be binary subtype 6"));
        }
        let blob = CiphertextBlob::parse(&binary.bytes)?;
        let material = self.material(blob.key_id).await?;
        let ad = CiphertextBlob::associated_data(blob.subtype, &blob.key_id, blob.bson_type);
        let plaintext = aead::decrypt(&material, &blob.ciphertext, &ad)?;
        payload::value_from_bytes(blob.bson_type, &plaintext)
    }

    /// Decrypts every decryptable payload in `doc`, at any depth.
    pub(crate) async fn decrypt_document(&self, doc: Document) -> Result<Document> {
        let mut root = Bson::Document(doc);
        let mut found: Vec<(String, Binary)> = Vec::new();
        for_each_leaf(&mut root, &mut String::new(), &mut |path, value| {
            if let Bson::Binary(binary) = value {
                if payload::blob_subtype(binary).is_some_and(BlobSubtype::is_decryptable) {
                    found.push((path.to_string(), binary.clone()));
                }
            }
        });
        if found.is_empty() {
            return match root {
                Bson::Document(doc) => Ok(doc),
                _ => Err(Error::internal("decrypted document is no longer a document")),
            };
        }

        let keys: Vec<EncryptKey> = found
            .iter()
            .filter_map(|(_, binary)| CiphertextBlob::parse(&binary.bytes).ok())
            .map(|blob| EncryptKey::Id(blob.key_id))
            .collect();
        self.keys.prefetch(&keys).await?;

        let mut decrypted = Vec::with_capacity(found.len());
        for (path, binary) in &found {
            decrypted.push(
                self.decrypt_value(binary)
                    .await
                    .map_err(|e| e.with_field(path))?,
            );
        }
        tracing::debug!(
            target: ENCRYPTION_TRACING_EVENT_TARGET,
            fields = decrypted.len(),
            "Decrypted reply fields",
        );

        let mut decrypted = decrypted.into_iter();
        for_each_leaf(&mut root, &mut String::new(), &mut |_, value| {
            if let Bson::Binary(binary) = value {
                if payload::blob_subtype(binary).is_some_and(BlobSubtype::is_decryptable) {
                    if let Some(plaintext) = decrypted.next() {
                        *value = plaintext;
                    }
                }
            }
        });
        match root {
            Bson::Document(doc) => Ok(doc),
            _ => Err(Error::internal("decrypted document is no longer a document")),
        }
    }
}

/// One `op value` operand of a range expression, and where it was found.
#[derive(Debug)]
struct RangeOperand {
    clause: usize,
    op: RangeOp,
    value: Bson,
}

/// The operands of an explicit range expression, lifted out so they can be replaced.
#[derive(Debug)]
struct RangeExpression {
    aggregate: bool,
    items: Vec<RangeOperand>,
}

impl RangeExpression {
    fn clauses(expression: &mut Document) -> Result<Vec<&mut Document>> {
        if !matches!(expression.get("$and"), Some(Bson::Array(_))) {
            return Ok(vec![expression]);
        }
        let Some(Bson::Array(clauses)) = expression.get_mut("$and") else {
            return Err(Error::internal("$and clauses disappeared"));
        };
        clauses
            .iter_mut()
            .map(|c| match c {
                Bson::Document(d) => Ok(d),
                _ => Err(Error::invalid_argument("$and clauses must be documents")),
            })
            .collect()
    }

    fn parse(expression: &mut Document) -> Result<Self> {
        let mut items = Vec::new();
        let mut aggregate = None;
        let mut field: Option<String> = None;
        for (clause, doc) in Self::clauses(expression)?.into_iter().enumerate() {
            let (key, value) = doc
                .iter()
                .next()
                .filter(|_| doc.len() == 1)
                .ok_or_else(|| Error::invalid_argument("each range clause must have one key"))?;
            let (is_aggregate, name, op, operand) = if let Some(op) = RangeOp::parse(key) {
                match value {
                    Bson::Array(args) if args.len() == 2 => match &args[0] {
                        Bson::String(path) if path.starts_with('$') => {
                            (true, path[1..].to_string(), op, args[1].clone())
                        }
                        _ => {
                            return Err(Error::invalid_argument(
                                "aggregate range operands must compare a field path",
                            ))
                        }
                    },
                    _ => {
                        return Err(Error::invalid_argument(
                            "aggregate range operators take two arguments",
                        ))
                    }
                }
            } else {
                let Bson::Document(ops) = value else {
                    return Err(Error::invalid_argument(
                        "range clauses must be {field: {$op: value}}",
                    ));
                };
                let (op, operand) = ops
                    .iter()
                    .next()
                    .filter(|_| ops.len() == 1)
                    .and_then(|(op, v)| RangeOp::parse(op).map(|op| (op, v.clone())))
                    .ok_or_else(|| {
                        Error::invalid_argument("range clauses need one of $gt, $gte, $lt, $lte")
                    })?;
                (false, key.clone(), op, operand)
            };
            if aggregate.is_some_and(|a| a != is_aggregate)
                || field.as_ref().is_some_and(|f| *f != name)
            {
                return Err(Error::invalid_argument(
                    "range clauses must all use the same form and field",
                ));
            }
            aggregate = Some(is_aggregate);
            field = Some(name);
            items.push(RangeOperand {
                clause,
                op,
                value: operand,
            });
        }
        match items.len() {
            1 | 2 => Ok(Self {
                aggregate: aggregate.unwrap_or(false),
                items,
            }),
            _ => Err(Error::invalid_argument(
                "a range expression has one or two bounds",
            )),
        }
    }

    fn write_back(self, expression: &mut Document) -> Result<()> {
        let mut clauses = Self::clauses(expression)?;
        for item in self.items {
            let doc = clauses
                .get_mut(item.clause)
                .ok_or_else(|| Error::internal("range clause disappeared"))?;
            let Some((_, value)) = doc.iter_mut().next() else {
                return Err(Error::internal("range clause is empty"));
            };
            match value {
                Bson::Array(args) if self.aggregate => args[1] = item.value,
                Bson::Document(ops) => {
                    if let Some((_, operand)) = ops.iter_mut().next() {
                        *operand = item.value;
                    }
                }
                _ => return Err(Error::internal("range clause changed shape")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn int_range(min: i32, max: i32) -> RangeSpec {
        RangeSpec {
            min: Some(Bson::Int32(min)),
            max: Some(Bson::Int32(max)),
            sparsity: 1,
            precision: None,
            trim_factor: 0,
        }
    }

    #[test]
    fn algorithm_names() {
        assert_eq!(
            "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"
                .parse::<Algorithm>()
                .unwrap(),
            Algorithm::Deterministic
        );
        assert_eq!("Range".parse::<Algorithm>().unwrap(), Algorithm::Range);
        assert!("Indexd".parse::<Algorithm>().is_err());
    }

    #[test]
    fn deterministic_refuses_unqueryable_types() {
        for value in [
            Bson::Double(1.5),
            Bson::Document(doc! {}),
            Bson::Array(vec![]),
            Bson::Boolean(true),
            Bson::Null,
            Bson::MinKey,
        ] {
            assert!(check_type(TypeRules::Deterministic, &value).is_err(), "{value:?}");
        }
        check_type(TypeRules::Deterministic, &Bson::String("x".into())).unwrap();
        check_type(TypeRules::Indexed, &Bson::Boolean(true)).unwrap();
        check_type(TypeRules::Random, &Bson::Document(doc! { "a": 1 })).unwrap();
        assert!(check_type(TypeRules::Random, &Bson::Undefined).is_err());
    }

    #[test]
    fn range_cover_clamps_to_domain() {
        let range = int_range(0, 7);
        let bounds = |lower: Option<(i32, bool)>, upper: Option<(i32, bool)>| RangeBounds {
            lower: lower.map(|(v, i)| (Bson::Int32(v), i)),
            upper: upper.map(|(v, i)| (Bson::Int32(v), i)),
        };
        assert_eq!(
            range_cover(&range, &bounds(Some((1, false)), Some((6, false)))).unwrap(),
            vec!["01", "10"]
        );
        assert_eq!(
            range_cover(&range, &bounds(Some((-5, true)), None)).unwrap(),
            vec!["root"]
        );
        assert!(range_cover(&range, &bounds(Some((9, true)), None))
            .unwrap()
            .is_empty());
        assert!(range_cover(&range, &bounds(Some((7, false)), None))
            .unwrap()
            .is_empty());
        assert!(range_cover(&range, &bounds(None, None)).is_err());
    }

    #[test]
    fn range_cover_rejects_unbounded_expansion() {
        let from_one = RangeBounds {
            lower: Some((Bson::Int32(1), true)),
            upper: None,
        };

        let sparse = RangeSpec {
            sparsity: 31,
            ..int_range(0, i32::MAX)
        };
        let error = range_cover(&sparse, &from_one).unwrap_err();
        assert!(error.is_encryption_error());
        assert!(error.to_string().contains("sparsity"));

        let trimmed = RangeSpec {
            trim_factor: 40,
            ..int_range(0, i32::MAX)
        };
        let error = range_cover(&trimmed, &from_one).unwrap_err();
        assert!(error.to_string().contains("trim factor"));
    }

    #[test]
    fn range_expressions_in_both_forms() {
        let mut matched = doc! {
            "$and": [ { "age": { "$gt": 5 } }, { "age": { "$lte": 10 } } ]
        };
        let parsed = RangeExpression::parse(&mut matched).unwrap();
        assert!(!parsed.aggregate);
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[1].op, RangeOp::Lte);

        let mut aggregate = doc! { "$and": [ { "$gte": ["$age", 5] } ] };
        let mut parsed = RangeExpression::parse(&mut aggregate).unwrap();
        assert!(parsed.aggregate);
        parsed.items[0].value = Bson::String("replaced".into());
        parsed.write_back(&mut aggregate).unwrap();
        assert_eq!(aggregate, doc! { "$and": [ { "$gte": ["$age", "replaced"] } ] });

        let mut mixed = doc! {
            "$and": [ { "age": { "$gt": 5 } }, { "height": { "$lt": 10 } } ]
        };
        assert!(RangeExpression::parse(&mut mixed).is_err());
    }

    #[test]
    fn leaves_are_visited_with_paths() {
        let mut value = Bson::Document(doc! { "a": { "b": [1, { "c": 2 }] }, "d": 3 });
        let mut paths = Vec::new();
        for_each_leaf(&mut value, &mut String::new(), &mut |path, _| {
            paths.push(path.to_string())
        });
        assert_eq!(paths, vec!["a.b.0", "a.b.1.c", "d"]);
    }
}
