//! Encryption schemas: JSON schemas carrying `encrypt` directives, and `encryptedFields`
//! documents for queryable encryption.

use std::{collections::BTreeMap, sync::Arc};

use bson::{spec::BinarySubtype, Bson, Document, Uuid};

use super::{engine::Algorithm, tokens::RangeSpec};
use crate::error::{Error, Result};

/// Contention factor used for indexed fields whose `queries` omit one.
pub(crate) const DEFAULT_CONTENTION: u64 = 8;

/// How a JSON schema names the data key of a field.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum KeyRef {
    Id(Uuid),
    /// A JSON pointer to a field of the document being written that holds a key alt name.
    Pointer(String),
}

/// An `encrypt` directive of a JSON schema.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EncryptRule {
    pub(crate) algorithm: Algorithm,
    pub(crate) key: KeyRef,
    pub(crate) bson_types: Vec<String>,
}

#[derive(Clone, Debug, Default)]
struct Metadata {
    algorithm: Option<Algorithm>,
    key: Option<KeyRef>,
}

/// A `$jsonSchema`, flattened to the dotted paths of its encrypted fields.
#[derive(Debug)]
pub(crate) struct JsonSchema {
    fields: BTreeMap<String, EncryptRule>,
    raw: Document,
    remote: bool,
}

impl JsonSchema {
    /// Parses a schema. `remote` is set for schemas read from a collection validator.
    pub(crate) fn parse(raw: Document, remote: bool) -> Result<Self> {
        let mut fields = BTreeMap::new();
        walk(&raw, "", Metadata::default(), &mut fields)?;
        Ok(Self {
            fields,
            raw,
            remote,
        })
    }

    pub(crate) fn raw(&self) -> &Document {
        &self.raw
    }

    pub(crate) fn is_remote(&self) -> bool {
        self.remote
    }
}

fn schema_error(path: &str, message: impl AsRef<str>) -> Error {
    let path = if path.is_empty() { "<root>" } else { path };
    Error::invalid_argument(format!("invalid schema at {path}: {}", message.as_ref()))
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn parse_key(path: &str, value: &Bson) -> Result<KeyRef> {
    match value {
        Bson::String(pointer) if pointer.starts_with('/') => {
            Ok(KeyRef::Pointer(pointer[1..].replace('/', ".")))
        }
        Bson::Array(ids) => match ids.as_slice() {
            [Bson::Binary(binary)] if binary.subtype == BinarySubtype::Uuid => binary
                .to_uuid()
                .map(KeyRef::Id)
                .map_err(|e| schema_error(path, e.to_string())),
            _ => Err(schema_error(path, "keyId must be an array of exactly one UUID")),
        },
        _ => Err(schema_error(
            path,
            "keyId must be a UUID array or a JSON pointer string",
        )),
    }
}

fn parse_algorithm(path: &str, value: &Bson) -> Result<Algorithm> {
    let name = value
        .as_str()
        .ok_or_else(|| schema_error(path, "algorithm must be a string"))?;
    match name.parse::<Algorithm>() {
        Ok(algorithm @ (Algorithm::Deterministic | Algorithm::Random)) => Ok(algorithm),
        _ => Err(schema_error(path, format!("unsupported algorithm {name:?}"))),
    }
}

fn parse_metadata(path: &str, doc: &Document, inherited: Metadata) -> Result<Metadata> {
    let mut metadata = inherited;
    if let Some(algorithm) = doc.get("algorithm") {
        metadata.algorithm = Some(parse_algorithm(path, algorithm)?);
    }
    if let Some(key) = doc.get("keyId") {
        metadata.key = Some(parse_key(path, key)?);
    }
    Ok(metadata)
}

fn walk(
    schema: &Document,
    path: &str,
    inherited: Metadata,
    out: &mut BTreeMap<String, EncryptRule>,
) -> Result<()> {
    let metadata = match schema.get("encryptMetadata") {
        Some(Bson::Document(doc)) => parse_metadata(path, doc, inherited)?,
        Some(_) => return Err(schema_error(path, "encryptMetadata must be a document")),
        None => inherited,
    };

    if let Some(encrypt) = schema.get("encrypt") {
        if path.is_empty() {
            return Err(schema_error(path, "the top level cannot be encrypted"));
        }
        let Bson::Document(encrypt) = encrypt else {
            return Err(schema_error(path, "encrypt must be a document"));
        };
        let local = parse_metadata(path, encrypt, metadata)?;
        let bson_types = match encrypt.get("bsonType") {
            None => Vec::new(),
            Some(Bson::String(t)) => vec![t.clone()],
            Some(Bson::Array(types)) => types
                .iter()
                .map(|t| {
                    t.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| schema_error(path, "bsonType entries must be strings"))
                })
                .collect::<Result<_>>()?,
            Some(_) => return Err(schema_error(path, "bsonType must be a string or array")),
        };
        let rule = EncryptRule {
            algorithm: local
                .algorithm
                .ok_or_else(|| schema_error(path, "no algorithm specified"))?,
            key: local
                .key
                .ok_or_else(|| schema_error(path, "no keyId specified"))?,
            bson_types,
        };
        if rule.algorithm == Algorithm::Deterministic && rule.bson_types.len() != 1 {
            return Err(schema_error(
                path,
                "deterministic encryption requires exactly one bsonType",
            ));
        }
        out.insert(path.to_string(), rule);
        return Ok(());
    }

    for keyword in ["patternProperties", "additionalProperties", "items"] {
        if let Some(Bson::Document(sub)) = schema.get(keyword) {
            let mut found = BTreeMap::new();
            walk_children(sub, path, &metadata, &mut found, keyword == "patternProperties")?;
            if !found.is_empty() {
                return Err(schema_error(
                    path,
                    format!("encrypted fields under {keyword} are not supported"),
                ));
            }
        }
    }

    if let Some(properties) = schema.get("properties") {
        let Bson::Document(properties) = properties else {
            return Err(schema_error(path, "properties must be a document"));
        };
        walk_children(properties, path, &metadata, out, true)?;
    }
    Ok(())
}

fn walk_children(
    schema: &Document,
    path: &str,
    metadata: &Metadata,
    out: &mut BTreeMap<String, EncryptRule>,
    named: bool,
) -> Result<()> {
    if !named {
        return walk(schema, &join(path, "*"), metadata.clone(), out);
    }
    for (name, sub) in schema {
        let sub_path = join(path, name);
        match sub {
            Bson::Document(sub) => walk(sub, &sub_path, metadata.clone(), out)?,
            _ => return Err(schema_error(&sub_path, "property schemas must be documents")),
        }
    }
    Ok(())
}

/// The query an indexed queryable encryption field supports.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum QueryKind {
    Equality,
    Range(RangeSpec),
}

/// One entry of `encryptedFields.fields`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct QeField {
    pub(crate) path: String,
    pub(crate) key_id: Uuid,
    pub(crate) bson_type: Option<String>,
    pub(crate) query: Option<QueryKind>,
    pub(crate) contention: u64,
}

/// An `encryptedFields` document.
#[derive(Debug)]
pub(crate) struct EncryptedFields {
    fields: Vec<QeField>,
    raw: Document,
}

fn parse_u32(path: &str, doc: &Document, key: &str) -> Result<Option<u32>> {
    match doc.get(key) {
        None | Some(Bson::Null) => Ok(None),
        Some(value) => crate::bson_util::get_int(value)
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| schema_error(path, format!("{key} must be a non-negative integer"))),
    }
}

fn parse_query(path: &str, query: &Document) -> Result<(QueryKind, u64)> {
    let contention = match query.get("contention") {
        None => DEFAULT_CONTENTION,
        Some(value) => crate::bson_util::get_int(value)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| schema_error(path, "contention must be a non-negative integer"))?,
    };
    let kind = match query.get_str("queryType") {
        Ok("equality") => QueryKind::Equality,
        Ok("range") => QueryKind::Range(RangeSpec {
            min: query.get("min").cloned(),
            max: query.get("max").cloned(),
            sparsity: parse_u32(path, query, "sparsity")?.unwrap_or(RangeSpec::DEFAULT_SPARSITY),
            precision: parse_u32(path, query, "precision")?,
            trim_factor: parse_u32(path, query, "trimFactor")?.unwrap_or(0),
        }),
        Ok(other) => return Err(schema_error(path, format!("unsupported queryType {other:?}"))),
        Err(_) => return Err(schema_error(path, "queries must have a string queryType")),
    };
    Ok((kind, contention))
}

impl EncryptedFields {
    pub(crate) fn parse(raw: Document) -> Result<Self> {
        let entries = raw
            .get_array("fields")
            .map_err(|_| Error::invalid_argument("encryptedFields must have a 'fields' array"))?;
        let mut fields: Vec<QeField> = Vec::with_capacity(entries.len());
        for entry in entries {
            let Bson::Document(entry) = entry else {
                return Err(Error::invalid_argument(
                    "encryptedFields.fields entries must be documents",
                ));
            };
            let path = entry
                .get_str("path")
                .map_err(|_| Error::invalid_argument("encrypted field is missing 'path'"))?
                .to_string();
            let key_id = match entry.get("keyId") {
                Some(Bson::Binary(binary)) if binary.subtype == BinarySubtype::Uuid => binary
                    .to_uuid()
                    .map_err(|e| schema_error(&path, e.to_string()))?,
                _ => return Err(schema_error(&path, "keyId must be a UUID")),
            };
            let bson_type = entry.get_str("bsonType").ok().map(str::to_string);
            let query = match entry.get("queries") {
                None | Some(Bson::Null) => None,
                Some(Bson::Document(query)) => Some(parse_query(&path, query)?),
                Some(Bson::Array(queries)) => match queries.as_slice() {
                    [] => None,
                    [Bson::Document(query)] => Some(parse_query(&path, query)?),
                    _ => return Err(schema_error(&path, "only one query type is supported")),
                },
                Some(_) => return Err(schema_error(&path, "queries must be a document")),
            };
            if fields
                .iter()
                .any(|f| f.path == path || is_prefix(&f.path, &path) || is_prefix(&path, &f.path))
            {
                return Err(schema_error(&path, "encrypted field paths overlap"));
            }
            let (query, contention) = match query {
                Some((kind, contention)) => (Some(kind), contention),
                None => (None, 0),
            };
            fields.push(QeField {
                path,
                key_id,
                bson_type,
                query,
                contention,
            });
        }
        Ok(Self { fields, raw })
    }

    pub(crate) fn raw(&self) -> &Document {
        &self.raw
    }
}

/// Whether `prefix` names an ancestor of `path`.
fn is_prefix(prefix: &str, path: &str) -> bool {
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'.'
}

/// The schema governing one namespace, resolved once per operation.
#[derive(Clone, Debug)]
pub(crate) enum ResolvedSchema {
    JsonSchema(Arc<JsonSchema>),
    EncryptedFields(Arc<EncryptedFields>),
    None,
}

/// The encryption directive for one field.
#[derive(Clone, Copy, Debug)]
pub(crate) enum FieldRule<'a> {
    Fle1(&'a EncryptRule),
    Qe(&'a QeField),
}

impl ResolvedSchema {
    fn paths(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            Self::JsonSchema(schema) => Box::new(schema.fields.keys().map(String::as_str)),
            Self::EncryptedFields(fields) => {
                Box::new(fields.fields.iter().map(|f| f.path.as_str()))
            }
            Self::None => Box::new(std::iter::empty()),
        }
    }

    pub(crate) fn has_encrypted_fields(&self) -> bool {
        self.paths().next().is_some()
    }

    pub(crate) fn rule(&self, path: &str) -> Option<FieldRule<'_>> {
        match self {
            Self::JsonSchema(schema) => schema.fields.get(path).map(FieldRule::Fle1),
            Self::EncryptedFields(fields) => fields
                .fields
                .iter()
                .find(|f| f.path == path)
                .map(FieldRule::Qe),
            Self::None => None,
        }
    }

    /// Whether some encrypted field lies strictly below `path`.
    pub(crate) fn encrypted_below(&self, path: &str) -> bool {
        self.paths().any(|p| path.is_empty() || is_prefix(path, p))
    }

    /// The encrypted field strictly above `path`, if any.
    pub(crate) fn encrypted_ancestor(&self, path: &str) -> Option<&str> {
        self.paths().find(|p| is_prefix(p, path))
    }
}

/// The `$type` alias of a value's BSON type, as used by `bsonType`.
pub(crate) fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::Undefined => "undefined",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::DbPointer(_) => "dbPointer",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::Symbol(_) => "symbol",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        Bson::MinKey => "minKey",
        Bson::MaxKey => "maxKey",
    }
}

#[cfg(test)]
mod test {
    use bson::doc;
    use pretty_assertions::assert_eq;

    use super::*;

    fn uuid_bson(id: Uuid) -> Bson {
        Bson::from(id)
    }

    #[test]
    fn nested_properties_inherit_metadata() {
        let key = Uuid::new();
        let schema = JsonSchema::parse(
            doc! {
                "bsonType": "object",
                "encryptMetadata": { "keyId": [uuid_bson(key)] },
                "properties": {
                    "ssn": {
                        "encrypt": {
                            "bsonType": "string",
                            "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
                        }
                    },
                    "medical": {
                        "bsonType": "object",
                        "encryptMetadata": {
                            "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
                        },
                        "properties": {
                            "notes": { "encrypt": { "keyId": "/owner" } },
                        },
                    },
                },
            },
            false,
        )
        .unwrap();
        let resolved = ResolvedSchema::JsonSchema(Arc::new(schema));

        let Some(FieldRule::Fle1(ssn)) = resolved.rule("ssn") else {
            panic!("ssn should be encrypted");
        };
        assert_eq!(ssn.algorithm, Algorithm::Deterministic);
        assert_eq!(ssn.key, KeyRef::Id(key));

        let Some(FieldRule::Fle1(notes)) = resolved.rule("medical.notes") else {
            panic!("medical.notes should be encrypted");
        };
        assert_eq!(notes.algorithm, Algorithm::Random);
        assert_eq!(notes.key, KeyRef::Pointer("owner".to_string()));

        assert!(resolved.encrypted_below("medical"));
        assert!(!resolved.encrypted_below("ssn"));
        assert_eq!(resolved.encrypted_ancestor("ssn.area"), Some("ssn"));
        assert!(resolved.rule("name").is_none());
    }

    #[test]
    fn invalid_schemas_are_configuration_errors() {
        let missing_key = doc! {
            "properties": {
                "ssn": { "encrypt": { "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Random" } }
            }
        };
        let err = JsonSchema::parse(missing_key, false).unwrap_err();
        assert!(err.to_string().contains("no keyId"));

        let under_items = doc! {
            "properties": {
                "list": {
                    "items": {
                        "encrypt": {
                            "keyId": [uuid_bson(Uuid::new())],
                            "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
                        }
                    }
                }
            }
        };
        assert!(JsonSchema::parse(under_items, false).is_err());
    }

    #[test]
    fn encrypted_fields_defaults() {
        let key = Uuid::new();
        let fields = EncryptedFields::parse(doc! {
            "fields": [
                {
                    "path": "ssn",
                    "keyId": uuid_bson(key),
                    "bsonType": "string",
                    "queries": { "queryType": "equality" },
                },
                {
                    "path": "age",
                    "keyId": uuid_bson(key),
                    "bsonType": "int",
                    "queries": [{ "queryType": "range", "min": 0, "max": 200, "contention": 2 }],
                },
                { "path": "notes", "keyId": uuid_bson(key), "bsonType": "string" },
            ]
        })
        .unwrap();
        let resolved = ResolvedSchema::EncryptedFields(Arc::new(fields));

        let Some(FieldRule::Qe(ssn)) = resolved.rule("ssn") else {
            panic!("ssn should be encrypted");
        };
        assert_eq!(ssn.query, Some(QueryKind::Equality));
        assert_eq!(ssn.contention, DEFAULT_CONTENTION);

        let Some(FieldRule::Qe(age)) = resolved.rule("age") else {
            panic!("age should be encrypted");
        };
        assert_eq!(age.contention, 2);
        let Some(QueryKind::Range(ref spec)) = age.query else {
            panic!("age should be range indexed");
        };
        assert_eq!(spec.sparsity, RangeSpec::DEFAULT_SPARSITY);
        assert_eq!(spec.max, Some(Bson::Int32(200)));

        let Some(FieldRule::Qe(notes)) = resolved.rule("notes") else {
            panic!("notes should be encrypted");
        };
        assert_eq!(notes.query, None);
    }

    #[test]
    fn overlapping_encrypted_fields_are_rejected() {
        let key = Bson::from(Uuid::new());
        let err = EncryptedFields::parse(doc! {
            "fields": [
                { "path": "a", "keyId": key.clone() },
                { "path": "a.b", "keyId": key },
            ]
        })
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }
}
