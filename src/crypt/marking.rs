//! Intent-to-encrypt markings: the placeholders query analysis leaves where a value has to be
//! encrypted. They share the layout `mongocryptd` produces, so either analyzer can feed the
//! engine.

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Uuid};

use super::{
    engine::Algorithm,
    key_broker::EncryptKey,
    payload::{self, BlobSubtype},
    tokens::RangeSpec,
};
use crate::error::{Error, Result};

/// `t` of a queryable encryption marking.
const INSERT: i32 = 1;
const FIND: i32 = 2;

/// `a` of a queryable encryption marking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QeAlgorithm {
    Unindexed = 1,
    Equality = 2,
    Range = 3,
}

impl QeAlgorithm {
    fn from_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(Self::Unindexed),
            2 => Ok(Self::Equality),
            3 => Ok(Self::Range),
            other => Err(malformed(format!("unknown algorithm {other}"))),
        }
    }
}

/// A comparison operator of a range query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RangeOp {
    Gt = 1,
    Gte = 2,
    Lt = 3,
    Lte = 4,
}

impl RangeOp {
    pub(crate) fn parse(op: &str) -> Option<Self> {
        match op {
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            _ => None,
        }
    }

    fn from_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(Self::Gt),
            2 => Ok(Self::Gte),
            3 => Ok(Self::Lt),
            4 => Ok(Self::Lte),
            other => Err(malformed(format!("unknown range operator {other}"))),
        }
    }

    pub(crate) fn is_lower(self) -> bool {
        matches!(self, Self::Gt | Self::Gte)
    }

    pub(crate) fn is_inclusive(self) -> bool {
        matches!(self, Self::Gte | Self::Lte)
    }
}

/// The interval of a range query. An absent end is unbounded.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct RangeBounds {
    pub(crate) lower: Option<(Bson, bool)>,
    pub(crate) upper: Option<(Bson, bool)>,
}

impl RangeBounds {
    /// Adds the bound `op value`. Fails if that end is already bounded.
    pub(crate) fn add(&mut self, op: RangeOp, value: Bson) -> Result<()> {
        let end = if op.is_lower() {
            &mut self.lower
        } else {
            &mut self.upper
        };
        if end.is_some() {
            return Err(Error::encryption(
                "a range query may have at most one lower and one upper bound per field",
            ));
        }
        *end = Some((value, op.is_inclusive()));
        Ok(())
    }
}

/// The range predicate a marking stands for. `bounds` is `None` for the stub left in place of the
/// second operator of a two-sided query.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RangeQuery {
    pub(crate) payload_id: i32,
    pub(crate) first_operator: RangeOp,
    pub(crate) second_operator: Option<RangeOp>,
    pub(crate) bounds: Option<RangeBounds>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Marking {
    /// Deterministic or random encryption of a single value.
    Fle1 {
        algorithm: Algorithm,
        key: EncryptKey,
        value: Bson,
    },
    /// A value written to a queryable encryption field.
    Insert {
        algorithm: QeAlgorithm,
        key_id: Uuid,
        value: Bson,
        contention: u64,
        range: Option<RangeSpec>,
    },
    FindEquality {
        key_id: Uuid,
        value: Bson,
        contention: u64,
    },
    FindRange {
        key_id: Uuid,
        contention: u64,
        range: RangeSpec,
        query: RangeQuery,
    },
}

fn malformed(message: impl AsRef<str>) -> Error {
    Error::encryption(format!("malformed marking: {}", message.as_ref()))
}

fn range_fields(doc: &mut Document, range: &RangeSpec) {
    doc.insert("s", range.sparsity as i64);
    if let Some(ref min) = range.min {
        doc.insert("mn", min.clone());
    }
    if let Some(ref max) = range.max {
        doc.insert("mx", max.clone());
    }
    if let Some(precision) = range.precision {
        doc.insert("pn", precision as i32);
    }
    doc.insert("tf", range.trim_factor as i32);
}

fn int(doc: &Document, key: &str) -> Result<i64> {
    doc.get(key)
        .and_then(crate::bson_util::get_int)
        .ok_or_else(|| malformed(format!("missing integer '{key}'")))
}

fn parse_range(doc: &Document) -> Result<RangeSpec> {
    Ok(RangeSpec {
        min: doc.get("mn").cloned(),
        max: doc.get("mx").cloned(),
        sparsity: u32::try_from(int(doc, "s")?).map_err(|_| malformed("sparsity"))?,
        precision: match doc.get("pn") {
            Some(value) => Some(
                crate::bson_util::get_int(value)
                    .and_then(|p| u32::try_from(p).ok())
                    .ok_or_else(|| malformed("precision"))?,
            ),
            None => None,
        },
        trim_factor: match doc.get("tf") {
            Some(_) => u32::try_from(int(doc, "tf")?).map_err(|_| malformed("trim factor"))?,
            None => 0,
        },
    })
}

fn key_id(doc: &Document) -> Result<Uuid> {
    match doc.get("ki") {
        Some(Bson::Binary(binary)) if binary.subtype == BinarySubtype::Uuid => binary
            .to_uuid()
            .map_err(|e| malformed(e.to_string())),
        _ => Err(malformed("missing key id")),
    }
}

fn contention(doc: &Document) -> Result<u64> {
    match doc.get("cm") {
        Some(value) => crate::bson_util::get_u64(value).ok_or_else(|| malformed("contention")),
        None => Ok(0),
    }
}

fn value(doc: &Document) -> Result<Bson> {
    doc.get("v").cloned().ok_or_else(|| malformed("missing value"))
}

impl Marking {
    pub(crate) fn to_document(&self) -> Document {
        match self {
            Self::Fle1 {
                algorithm,
                key,
                value,
            } => {
                let mut doc = doc! {
                    "a": if *algorithm == Algorithm::Deterministic { 1 } else { 2 },
                };
                match key {
                    EncryptKey::Id(id) => doc.insert("ki", *id),
                    EncryptKey::AltName(name) => doc.insert("ka", name.as_str()),
                };
                doc.insert("v", value.clone());
                doc
            }
            Self::Insert {
                algorithm,
                key_id,
                value,
                contention,
                range,
            } => {
                let mut doc = doc! {
                    "t": INSERT,
                    "a": *algorithm as i32,
                    "ki": *key_id,
                    "v": value.clone(),
                    "cm": *contention as i64,
                };
                if let Some(range) = range {
                    range_fields(&mut doc, range);
                }
                doc
            }
            Self::FindEquality {
                key_id,
                value,
                contention,
            } => doc! {
                "t": FIND,
                "a": QeAlgorithm::Equality as i32,
                "ki": *key_id,
                "v": value.clone(),
                "cm": *contention as i64,
            },
            Self::FindRange {
                key_id,
                contention,
                range,
                query,
            } => {
                let mut doc = doc! {
                    "t": FIND,
                    "a": QeAlgorithm::Range as i32,
                    "ki": *key_id,
                    "cm": *contention as i64,
                };
                range_fields(&mut doc, range);
                let mut v = Document::new();
                if let Some(ref bounds) = query.bounds {
                    if let Some((ref lower, inclusive)) = bounds.lower {
                        v.insert("lb", lower.clone());
                        v.insert("lbi", inclusive);
                    } else {
                        v.insert("lbi", true);
                    }
                    if let Some((ref upper, inclusive)) = bounds.upper {
                        v.insert("ub", upper.clone());
                        v.insert("ubi", inclusive);
                    } else {
                        v.insert("ubi", true);
                    }
                }
                v.insert("payloadId", query.payload_id);
                v.insert("firstOperator", query.first_operator as i32);
                if let Some(second) = query.second_operator {
                    v.insert("secondOperator", second as i32);
                }
                doc.insert("v", v);
                doc
            }
        }
    }

    pub(crate) fn to_binary(&self) -> Result<Binary> {
        payload::document_payload(BlobSubtype::Marking, &self.to_document())
    }

    /// Parses the marking held by `binary`, or returns `None` if it is not a marking.
    pub(crate) fn parse(binary: &Binary) -> Result<Option<Self>> {
        if payload::blob_subtype(binary) != Some(BlobSubtype::Marking) {
            return Ok(None);
        }
        let (_, doc) = payload::parse_document_payload(binary)?;
        Self::from_document(&doc).map(Some)
    }

    pub(crate) fn from_document(doc: &Document) -> Result<Self> {
        let algorithm = i32::try_from(int(doc, "a")?).map_err(|_| malformed("algorithm"))?;
        let Some(t) = doc.get("t") else {
            let algorithm = match algorithm {
                1 => Algorithm::Deterministic,
                2 => Algorithm::Random,
                other => return Err(malformed(format!("unknown algorithm {other}"))),
            };
            let key = match (doc.get("ki"), doc.get_str("ka")) {
                (Some(_), _) => EncryptKey::Id(key_id(doc)?),
                (None, Ok(name)) => EncryptKey::AltName(name.to_string()),
                (None, Err(_)) => return Err(malformed("missing key id or alt name")),
            };
            return Ok(Self::Fle1 {
                algorithm,
                key,
                value: value(doc)?,
            });
        };

        let algorithm = QeAlgorithm::from_code(algorithm)?;
        match (crate::bson_util::get_int(t), algorithm) {
            (Some(1), _) => Ok(Self::Insert {
                algorithm,
                key_id: key_id(doc)?,
                value: value(doc)?,
                contention: contention(doc)?,
                range: if algorithm == QeAlgorithm::Range {
                    Some(parse_range(doc)?)
                } else {
                    None
                },
            }),
            (Some(2), QeAlgorithm::Equality) => Ok(Self::FindEquality {
                key_id: key_id(doc)?,
                value: value(doc)?,
                contention: contention(doc)?,
            }),
            (Some(2), QeAlgorithm::Range) => {
                let v = doc
                    .get_document("v")
                    .map_err(|_| malformed("range value must be a document"))?;
                let bounds = if v.contains_key("lbi") {
                    let lower_inclusive = v.get_bool("lbi").unwrap_or(true);
                    let upper_inclusive = v.get_bool("ubi").unwrap_or(true);
                    Some(RangeBounds {
                        lower: v.get("lb").map(|b| (b.clone(), lower_inclusive)),
                        upper: v.get("ub").map(|b| (b.clone(), upper_inclusive)),
                    })
                } else {
                    None
                };
                let operator = |key: &str| -> Result<Option<RangeOp>> {
                    match v.get(key) {
                        Some(op) => crate::bson_util::get_int(op)
                            .and_then(|op| i32::try_from(op).ok())
                            .ok_or_else(|| malformed(key))
                            .and_then(RangeOp::from_code)
                            .map(Some),
                        None => Ok(None),
                    }
                };
                Ok(Self::FindRange {
                    key_id: key_id(doc)?,
                    contention: contention(doc)?,
                    range: parse_range(doc)?,
                    query: RangeQuery {
                        payload_id: i32::try_from(int(v, "payloadId")?)
                            .map_err(|_| malformed("payloadId"))?,
                        first_operator: operator("firstOperator")?
                            .ok_or_else(|| malformed("missing firstOperator"))?,
                        second_operator: operator("secondOperator")?,
                        bounds,
                    },
                })
            }
            _ => Err(malformed("unsupported marking type")),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fle1_marking_layout() {
        let key = Uuid::new();
        let marking = Marking::Fle1 {
            algorithm: Algorithm::Deterministic,
            key: EncryptKey::Id(key),
            value: Bson::String("123-45-6789".into()),
        };
        assert_eq!(
            marking.to_document(),
            doc! { "a": 1, "ki": key, "v": "123-45-6789" }
        );
        let binary = marking.to_binary().unwrap();
        assert_eq!(binary.bytes[0], 0);
        assert_eq!(Marking::parse(&binary).unwrap(), Some(marking));

        let by_name = Marking::from_document(&doc! { "a": 2, "ka": "alt", "v": 1 }).unwrap();
        assert_eq!(
            by_name,
            Marking::Fle1 {
                algorithm: Algorithm::Random,
                key: EncryptKey::AltName("alt".into()),
                value: Bson::Int32(1),
            }
        );
    }

    #[test]
    fn range_stub_has_no_bounds() {
        let range = RangeSpec {
            min: Some(Bson::Int32(0)),
            max: Some(Bson::Int32(200)),
            sparsity: 1,
            precision: None,
            trim_factor: 0,
        };
        let stub = Marking::FindRange {
            key_id: Uuid::new(),
            contention: 4,
            range: range.clone(),
            query: RangeQuery {
                payload_id: 3,
                first_operator: RangeOp::Gt,
                second_operator: Some(RangeOp::Lte),
                bounds: None,
            },
        };
        let doc = stub.to_document();
        assert_eq!(
            doc.get_document("v").unwrap(),
            &doc! { "payloadId": 3, "firstOperator": 1, "secondOperator": 4 }
        );
        assert_eq!(Marking::from_document(&doc).unwrap(), stub);

        let mut bounds = RangeBounds::default();
        bounds.add(RangeOp::Gt, Bson::Int32(5)).unwrap();
        assert!(bounds.add(RangeOp::Gte, Bson::Int32(6)).is_err());
        let full = Marking::FindRange {
            key_id: Uuid::new(),
            contention: 4,
            range,
            query: RangeQuery {
                payload_id: 0,
                first_operator: RangeOp::Gt,
                second_operator: None,
                bounds: Some(bounds),
            },
        };
        assert_eq!(Marking::from_document(&full.to_document()).unwrap(), full);
    }

    #[test]
    fn non_markings_are_skipped() {
        let binary = Binary {
            subtype: BinarySubtype::Generic,
            bytes: vec![0, 1, 2],
        };
        assert_eq!(Marking::parse(&binary).unwrap(), None);
    }
}
