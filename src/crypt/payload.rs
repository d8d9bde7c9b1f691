//! Binary layouts of encrypted values (BSON binary subtype 6).
//!
//! Every payload starts with a one-byte [`BlobSubtype`]. Ciphertext blobs then carry the 16-byte
//! data key UUID, the original BSON element type and the AEAD output; queryable encryption
//! payloads sent to the server instead carry a BSON document after the subtype byte.

use bson::{spec::BinarySubtype, Binary, Bson, Document, Uuid};

use crate::error::{Error, Result};

/// The first byte of an encrypted binary value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub(crate) enum BlobSubtype {
    /// Intent-to-encrypt marking produced by query analysis. Never sent to the server.
    Marking = 0,
    Deterministic = 1,
    Random = 2,
    InsertUpdate = 11,
    FindEquality = 12,
    FindRange = 13,
    IndexedEquality = 14,
    IndexedRange = 15,
    Unindexed = 16,
}

impl TryFrom<u8> for BlobSubtype {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Marking,
            1 => Self::Deterministic,
            2 => Self::Random,
            11 => Self::InsertUpdate,
            12 => Self::FindEquality,
            13 => Self::FindRange,
            14 => Self::IndexedEquality,
            15 => Self::IndexedRange,
            16 => Self::Unindexed,
            other => {
                return Err(Error::encryption(format!(
                    "unknown encrypted payload subtype {other}"
                )))
            }
        })
    }
}

impl BlobSubtype {
    /// Whether a payload of this subtype holds a ciphertext that can be decrypted client-side.
    pub(crate) fn is_decryptable(self) -> bool {
        matches!(
            self,
            Self::Deterministic
                | Self::Random
                | Self::IndexedEquality
                | Self::IndexedRange
                | Self::Unindexed
        )
    }
}

/// Returns the blob subtype of `binary` if it is an encrypted value.
pub(crate) fn blob_subtype(binary: &Binary) -> Option<BlobSubtype> {
    if binary.subtype != BinarySubtype::Encrypted {
        return None;
    }
    binary
        .bytes
        .first()
        .and_then(|b| BlobSubtype::try_from(*b).ok())
}

/// A decryptable payload: `subtype || key UUID || original BSON type || AEAD ciphertext`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CiphertextBlob {
    pub(crate) subtype: BlobSubtype,
    pub(crate) key_id: Uuid,
    pub(crate) bson_type: u8,
    pub(crate) ciphertext: Vec<u8>,
}

const HEADER_LEN: usize = 1 + 16 + 1;

impl CiphertextBlob {
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= HEADER_LEN {
            return Err(Error::encryption(format!(
                "encrypted payload of {} bytes is too short",
                bytes.len()
            )));
        }
        let subtype = BlobSubtype::try_from(bytes[0])?;
        if !subtype.is_decryptable() {
            return Err(Error::encryption(format!(
                "payload subtype {subtype:?} cannot be decrypted"
            )));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[1..17]);
        Ok(Self {
            subtype,
            key_id: Uuid::from_bytes(uuid),
            bson_type: bytes[17],
            ciphertext: bytes[HEADER_LEN..].to_vec(),
        })
    }

    /// The associated data authenticated with the ciphertext.
    pub(crate) fn associated_data(
        subtype: BlobSubtype,
        key_id: &Uuid,
        bson_type: u8,
    ) -> [u8; HEADER_LEN] {
        let mut ad = [0u8; HEADER_LEN];
        ad[0] = subtype as u8;
        ad[1..17].copy_from_slice(&key_id.bytes());
        ad[17] = bson_type;
        ad
    }

    pub(crate) fn into_binary(self) -> Binary {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&Self::associated_data(
            self.subtype,
            &self.key_id,
            self.bson_type,
        ));
        bytes.extend_from_slice(&self.ciphertext);
        encrypted_binary(bytes)
    }
}

/// A payload whose body is a BSON document: markings and queryable encryption payloads.
pub(crate) fn document_payload(subtype: BlobSubtype, doc: &Document) -> Result<Binary> {
    let mut bytes = vec![subtype as u8];
    doc.to_writer(&mut bytes)?;
    Ok(encrypted_binary(bytes))
}

/// Parses the BSON document following the subtype byte.
pub(crate) fn parse_document_payload(binary: &Binary) -> Result<(BlobSubtype, Document)> {
    let (first, rest) = binary
        .bytes
        .split_first()
        .ok_or_else(|| Error::encryption("empty encrypted payload"))?;
    let subtype = BlobSubtype::try_from(*first)?;
    let doc = Document::from_reader(rest)
        .map_err(|e| Error::encryption(format!("malformed {subtype:?} payload: {e}")))?;
    Ok((subtype, doc))
}

pub(crate) fn encrypted_binary(bytes: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Encrypted,
        bytes,
    }
}

/// Serializes a single BSON value without its element name, returning its element type byte and
/// value bytes.
pub(crate) fn value_to_bytes(value: &Bson) -> Result<(u8, Vec<u8>)> {
    let mut doc = Document::new();
    doc.insert("v", value.clone());
    let mut bytes = Vec::new();
    doc.to_writer(&mut bytes)?;
    // Layout: int32 length, element type, "v\0", value, trailing NUL.
    let element_type = bytes[4];
    Ok((element_type, bytes[7..bytes.len() - 1].to_vec()))
}

/// The inverse of [`value_to_bytes`].
pub(crate) fn value_from_bytes(element_type: u8, value: &[u8]) -> Result<Bson> {
    let len = 4 + 1 + 2 + value.len() + 1;
    let mut bytes = Vec::with_capacity(len);
    bytes.extend_from_slice(&(len as i32).to_le_bytes());
    bytes.push(element_type);
    bytes.extend_from_slice(b"v\0");
    bytes.extend_from_slice(value);
    bytes.push(0);
    let mut doc = Document::from_reader(bytes.as_slice())
        .map_err(|e| Error::encryption(format!("decrypted value is not valid BSON: {e}")))?;
    doc.remove("v")
        .ok_or_else(|| Error::encryption("decrypted value is missing"))
}

/// The BSON element type byte of `value`.
pub(crate) fn element_type(value: &Bson) -> u8 {
    value.element_type() as u8
}

#[cfg(test)]
mod test {
    use bson::{doc, oid::ObjectId, DateTime};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn value_bytes_preserve_type() {
        for value in [
            Bson::String("123-45-6789".to_string()),
            Bson::Int32(-7),
            Bson::Int64(1 << 40),
            Bson::ObjectId(ObjectId::new()),
            Bson::DateTime(DateTime::from_millis(1_700_000_000_000)),
            Bson::Document(doc! { "nested": [1, 2] }),
        ] {
            let (element_type, bytes) = value_to_bytes(&value).unwrap();
            assert_eq!(element_type, super::element_type(&value));
            assert_eq!(value_from_bytes(element_type, &bytes).unwrap(), value);
        }
    }

    #[test]
    fn string_value_bytes_layout() {
        let (element_type, bytes) = value_to_bytes(&Bson::String("ab".into())).unwrap();
        assert_eq!(element_type, 0x02);
        assert_eq!(bytes, vec![3, 0, 0, 0, b'a', b'b', 0]);
    }

    #[test]
    fn ciphertext_blob_layout() {
        let key_id = Uuid::new();
        let blob = CiphertextBlob {
            subtype: BlobSubtype::Deterministic,
            key_id,
            bson_type: 0x02,
            ciphertext: vec![9; 64],
        };
        let binary = blob.clone().into_binary();
        assert_eq!(binary.subtype, BinarySubtype::Encrypted);
        assert_eq!(binary.bytes[0], 1);
        assert_eq!(&binary.bytes[1..17], &key_id.bytes());
        assert_eq!(blob_subtype(&binary), Some(BlobSubtype::Deterministic));
        assert_eq!(CiphertextBlob::parse(&binary.bytes).unwrap(), blob);
    }

    #[test]
    fn non_decryptable_subtypes_are_rejected() {
        let payload = document_payload(BlobSubtype::FindEquality, &doc! { "cm": 4i64 }).unwrap();
        assert!(CiphertextBlob::parse(&payload.bytes).is_err());
        let (subtype, doc) = parse_document_payload(&payload).unwrap();
        assert_eq!(subtype, BlobSubtype::FindEquality);
        assert_eq!(doc, doc! { "cm": 4i64 });
    }

    #[test]
    fn non_encrypted_binaries_have_no_blob_subtype() {
        let generic = Binary {
            subtype: BinarySubtype::Generic,
            bytes: vec![1, 2, 3],
        };
        assert_eq!(blob_subtype(&generic), None);
    }
}
