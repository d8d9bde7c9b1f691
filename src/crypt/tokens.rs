//! Queryable encryption tokens and the order-preserving encoding behind range queries.
//!
//! Tokens form a tree of HMAC-SHA-256 derivations rooted at the last 32 bytes of a data key:
//! collection-level tokens, then tokens bound to a value (or a range edge), then tokens bound to
//! a contention bucket.

use bson::{Bson, Document};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{
    crypt::aead,
    error::{Error, Result},
};

type HmacSha256 = Hmac<Sha256>;

pub(crate) type Token = [u8; 32];

fn hmac(key: &[u8], data: &[u8]) -> Result<Token> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::encryption(format!("invalid token key: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn hmac_u64(key: &[u8], n: u64) -> Result<Token> {
    hmac(key, &n.to_le_bytes())
}

/// Tokens derived from a data key that do not depend on a value.
#[derive(Clone, Debug)]
pub(crate) struct CollectionTokens {
    edc: Token,
    esc: Token,
    ecoc: Token,
    server_derivation: Token,
    pub(crate) server_encryption: Token,
}

impl CollectionTokens {
    pub(crate) fn new(data_key: &[u8]) -> Result<Self> {
        if data_key.len() != aead::KEY_LEN {
            return Err(Error::encryption("queryable encryption requires a 96 byte key"));
        }
        let root = &data_key[64..];
        let collections = hmac_u64(root, 1)?;
        Ok(Self {
            edc: hmac_u64(&collections, 1)?,
            esc: hmac_u64(&collections, 2)?,
            ecoc: hmac_u64(&collections, 4)?,
            server_derivation: hmac_u64(root, 2)?,
            server_encryption: hmac_u64(root, 3)?,
        })
    }

    pub(crate) fn ecoc(&self) -> &Token {
        &self.ecoc
    }

    /// Tokens binding `value` (a serialized BSON value or a range edge).
    pub(crate) fn for_value(&self, value: &[u8]) -> Result<ValueTokens> {
        Ok(ValueTokens {
            edc: hmac(&self.edc, value)?,
            esc: hmac(&self.esc, value)?,
            server: hmac(&self.server_derivation, value)?,
        })
    }
}

/// Tokens bound to one value.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ValueTokens {
    pub(crate) edc: Token,
    pub(crate) esc: Token,
    pub(crate) server: Token,
}

impl ValueTokens {
    /// The EDC and ESC tokens for one contention bucket.
    pub(crate) fn with_contention(&self, bucket: u64) -> Result<(Token, Token)> {
        Ok((hmac_u64(&self.edc, bucket)?, hmac_u64(&self.esc, bucket)?))
    }
}

const MIN_SPARSITY: u32 = 1;
const MAX_SPARSITY: u32 = 4;

/// Range index parameters of a field.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RangeSpec {
    pub(crate) min: Option<Bson>,
    pub(crate) max: Option<Bson>,
    pub(crate) sparsity: u32,
    pub(crate) precision: Option<u32>,
    pub(crate) trim_factor: u32,
}

impl RangeSpec {
    pub(crate) const DEFAULT_SPARSITY: u32 = 2;

    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(ref min) = self.min {
            doc.insert("min", min.clone());
        }
        if let Some(ref max) = self.max {
            doc.insert("max", max.clone());
        }
        doc.insert("sparsity", self.sparsity as i64);
        if let Some(precision) = self.precision {
            doc.insert("precision", precision as i32);
        }
        doc.insert("trimFactor", self.trim_factor as i32);
        doc
    }
}

/// A value mapped onto `[0, domain_max]` so that unsigned order matches the original order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Encoded {
    pub(crate) value: u64,
    pub(crate) domain_max: u64,
}

impl Encoded {
    fn bits(&self) -> u32 {
        64 - self.domain_max.leading_zeros()
    }
}

fn is_floating(value: &Bson) -> bool {
    matches!(value, Bson::Double(_) | Bson::Decimal128(_))
}

fn same_type(a: &Bson, b: &Bson) -> bool {
    a.element_type() == b.element_type()
}

fn as_i128(value: &Bson) -> Option<i128> {
    match value {
        Bson::Int32(v) => Some(*v as i128),
        Bson::Int64(v) => Some(*v as i128),
        Bson::DateTime(d) => Some(d.timestamp_millis() as i128),
        _ => None,
    }
}

/// Maps a double onto the u64 line so that unsigned comparison matches numeric comparison.
fn double_bits(value: f64) -> u64 {
    // -0.0 and 0.0 compare equal.
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

impl RangeSpec {
    /// Checks the parameters against the type of a value to encrypt.
    pub(crate) fn validate(&self, value: &Bson) -> Result<()> {
        match value {
            Bson::Int32(_) | Bson::Int64(_) | Bson::DateTime(_) | Bson::Double(_) => {}
            Bson::Decimal128(_) => {
                return Err(Error::encryption(
                    "Decimal128 range indexes are not supported",
                ))
            }
            other => {
                return Err(Error::encryption(format!(
                    "type {:?} cannot be range encrypted",
                    other.element_type()
                )))
            }
        }
        for bound in [&self.min, &self.max].into_iter().flatten() {
            if !same_type(bound, value) {
                return Err(Error::encryption(format!(
                    "expected matching 'min' and value type. Got range option 'min' of type \
                     {:?} and value of type {:?}",
                    bound.element_type(),
                    value.element_type()
                )));
            }
        }
        if self.precision.is_some() && !is_floating(value) {
            return Err(Error::encryption(format!(
                "expected 'precision' to be set with double or decimal128 index, but got: {:?}",
                value.element_type()
            )));
        }
        if is_floating(value) && self.precision.is_some() != self.min.is_some() {
            return Err(Error::encryption(
                "'precision', 'min' and 'max' must all be set together for double indexes",
            ));
        }
        if !(MIN_SPARSITY..=MAX_SPARSITY).contains(&self.sparsity) {
            return Err(Error::encryption(format!(
                "sparsity must be between {MIN_SPARSITY} and {MAX_SPARSITY}, got {}",
                self.sparsity
            )));
        }
        Ok(())
    }

    /// The order-preserving encoding of `value`, which must lie within `[min, max]`.
    pub(crate) fn encode(&self, value: &Bson) -> Result<Encoded> {
        self.validate(value)?;
        if let (Some(min), Some(max)) = (&self.min, &self.max) {
            if compare(value, min)? == std::cmp::Ordering::Less {
                return Err(Error::encryption(
                    "value must be greater than or equal to the minimum value",
                ));
            }
            if compare(value, max)? == std::cmp::Ordering::Greater {
                return Err(Error::encryption(
                    "value must be less than or equal to the maximum value",
                ));
            }
        }

        if let Bson::Double(v) = value {
            return match (self.precision, &self.min, &self.max) {
                (Some(precision), Some(Bson::Double(min)), Some(Bson::Double(max))) => {
                    let scale = 10f64.powi(precision as i32);
                    let domain_max = ((max - min) * scale).round();
                    if domain_max >= u64::MAX as f64 {
                        return Err(Error::encryption("precision is too large for the range"));
                    }
                    Ok(Encoded {
                        value: ((v - min) * scale).round() as u64,
                        domain_max: domain_max as u64,
                    })
                }
                _ => Ok(Encoded {
                    value: double_bits(*v),
                    domain_max: u64::MAX,
                }),
            };
        }

        let v = as_i128(value).ok_or_else(|| Error::internal("validated range value"))?;
        let (min, max) = match (&self.min, &self.max) {
            (Some(min), Some(max)) => (
                as_i128(min).ok_or_else(|| Error::internal("validated range min"))?,
                as_i128(max).ok_or_else(|| Error::internal("validated range max"))?,
            ),
            _ => match value {
                Bson::Int32(_) => (i32::MIN as i128, i32::MAX as i128),
                _ => (i64::MIN as i128, i64::MAX as i128),
            },
        };
        Ok(Encoded {
            value: (v - min) as u64,
            domain_max: (max - min) as u64,
        })
    }

    /// The edges stored for an inserted value: `"root"` (unless trimmed) followed by every
    /// prefix of the value's bit string whose length is a multiple of the sparsity, and the full
    /// bit string.
    pub(crate) fn edges(&self, encoded: Encoded) -> Result<Vec<String>> {
        let bits = encoded.bits();
        self.check_trim_factor(bits)?;
        let leaf = bit_string(encoded.value, bits);
        let mut edges = Vec::new();
        if self.trim_factor == 0 {
            edges.push("root".to_string());
        }
        for len in self.trim_factor.max(1)..=bits {
            if len % self.sparsity == 0 || len == bits {
                edges.push(leaf[..len as usize].to_string());
            }
        }
        Ok(edges)
    }

    /// The minimal set of edges covering `[lower, upper]`, expanded so every edge has a length
    /// that could have been stored.
    pub(crate) fn cover(&self, lower: u64, upper: u64, domain_max: u64) -> Result<Vec<String>> {
        let bits = Encoded {
            value: 0,
            domain_max,
        }
        .bits();
        self.check_trim_factor(bits)?;
        let mut out = Vec::new();
        if lower > upper {
            return Ok(out);
        }
        let mut prefixes = Vec::new();
        minimal_cover(lower, upper, 0, bits, &mut prefixes);
        for (prefix, len) in prefixes {
            self.expand(prefix, len, bits, &mut out);
        }
        Ok(out)
    }

    fn check_trim_factor(&self, bits: u32) -> Result<()> {
        if self.trim_factor > 0 && self.trim_factor >= bits.max(1) {
            return Err(Error::encryption(format!(
                "trim factor must be less than the number of bits ({bits}) used to represent \
                 the domain"
            )));
        }
        Ok(())
    }

    fn expand(&self, prefix: u64, len: u32, bits: u32, out: &mut Vec<String>) {
        let storable = if len == 0 {
            self.trim_factor == 0 || bits == 0
        } else {
            len >= bits || (len >= self.trim_factor && len % self.sparsity == 0)
        };
        if storable {
            out.push(if len == 0 {
                "root".to_string()
            } else {
                bit_string(prefix, len)
            });
            return;
        }
        self.expand(prefix << 1, len + 1, bits, out);
        self.expand((prefix << 1) | 1, len + 1, bits, out);
    }
}

/// Collects `(prefix, length)` pairs of the smallest set of aligned subtrees covering
/// `[lower, upper]` within the subtree `prefix` of length `len`.
fn minimal_cover(lower: u64, upper: u64, len: u32, bits: u32, out: &mut Vec<(u64, u32)>) {
    fn walk(prefix: u64, len: u32, bits: u32, lower: u64, upper: u64, out: &mut Vec<(u64, u32)>) {
        let span = bits - len;
        let start = if span == 64 { 0 } else { prefix << span };
        let end = if span == 64 {
            u64::MAX
        } else {
            start | ((1u64 << span) - 1)
        };
        if end < lower || start > upper {
            return;
        }
        if lower <= start && end <= upper {
            out.push((prefix, len));
            return;
        }
        walk(prefix << 1, len + 1, bits, lower, upper, out);
        walk((prefix << 1) | 1, len + 1, bits, lower, upper, out);
    }
    walk(0, len, bits, lower, upper, out);
}

fn bit_string(value: u64, bits: u32) -> String {
    if bits == 0 {
        return String::new();
    }
    format!("{:0width$b}", value, width = 64)[(64 - bits) as usize..].to_string()
}

/// Compares two range values of the same type.
pub(crate) fn compare(a: &Bson, b: &Bson) -> Result<std::cmp::Ordering> {
    match (a, b) {
        (Bson::Double(x), Bson::Double(y)) => x
            .partial_cmp(y)
            .ok_or_else(|| Error::encryption("NaN cannot be range encrypted")),
        _ => match (as_i128(a), as_i128(b)) {
            (Some(x), Some(y)) => Ok(x.cmp(&y)),
            _ => Err(Error::encryption(format!(
                "cannot compare range values of types {:?} and {:?}",
                a.element_type(),
                b.element_type()
            ))),
        },
    }
}

#[cfg(test)]
mod test {
    use bson::DateTime;
    use pretty_assertions::assert_eq;

    use super::*;

    fn int_spec(min: i32, max: i32, sparsity: u32) -> RangeSpec {
        RangeSpec {
            min: Some(Bson::Int32(min)),
            max: Some(Bson::Int32(max)),
            sparsity,
            precision: None,
            trim_factor: 0,
        }
    }

    #[test]
    fn bounds_are_inclusive() {
        let spec = int_spec(0, 200, 1);
        assert_eq!(spec.encode(&Bson::Int32(0)).unwrap().value, 0);
        assert_eq!(spec.encode(&Bson::Int32(200)).unwrap().value, 200);
        assert!(spec.encode(&Bson::Int32(201)).is_err());
        assert!(spec.encode(&Bson::Int32(-1)).is_err());
    }

    #[test]
    fn type_mismatch_and_precision_misuse() {
        let spec = int_spec(0, 200, 1);
        let err = spec.encode(&Bson::Int64(5)).unwrap_err();
        assert!(err.to_string().contains("expected matching 'min' and value type"));

        let mut with_precision = int_spec(0, 200, 1);
        with_precision.precision = Some(2);
        let err = with_precision.encode(&Bson::Int32(5)).unwrap_err();
        assert!(err.to_string().contains("precision"));
    }

    #[test]
    fn encoding_preserves_order() {
        let doubles = RangeSpec {
            min: None,
            max: None,
            sparsity: 1,
            precision: None,
            trim_factor: 0,
        };
        let values = [-1e10, -2.5, -0.0, 0.0, 1e-9, 3.5, 1e300];
        let encoded: Vec<u64> = values
            .iter()
            .map(|v| doubles.encode(&Bson::Double(*v)).unwrap().value)
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        assert_eq!(encoded[2], encoded[3]);

        let dates = RangeSpec {
            min: Some(Bson::DateTime(DateTime::from_millis(0))),
            max: Some(Bson::DateTime(DateTime::from_millis(1000))),
            ..doubles
        };
        assert_eq!(
            dates
                .encode(&Bson::DateTime(DateTime::from_millis(250)))
                .unwrap()
                .value,
            250
        );
    }

    #[test]
    fn edges_follow_sparsity() {
        let spec = int_spec(0, 7, 2);
        let encoded = spec.encode(&Bson::Int32(5)).unwrap();
        assert_eq!(encoded.bits(), 3);
        assert_eq!(spec.edges(encoded).unwrap(), vec!["root", "10", "101"]);

        let trimmed = RangeSpec {
            trim_factor: 1,
            ..int_spec(0, 7, 1)
        };
        assert_eq!(trimmed.edges(encoded).unwrap(), vec!["1", "10", "101"]);
    }

    #[test]
    fn sparsity_outside_one_to_four_is_rejected() {
        for sparsity in [0, 5, 31] {
            let error = int_spec(0, 7, sparsity)
                .encode(&Bson::Int32(3))
                .unwrap_err();
            assert!(error.is_encryption_error(), "{sparsity}");
        }
        int_spec(0, 7, 4).encode(&Bson::Int32(3)).unwrap();
    }

    #[test]
    fn cover_checks_trim_factor() {
        let spec = RangeSpec {
            trim_factor: 3,
            ..int_spec(0, 7, 1)
        };
        assert!(spec.cover(0, 7, 7).is_err());
    }

    #[test]
    fn cover_is_minimal() {
        let spec = int_spec(0, 7, 1);
        assert_eq!(spec.cover(0, 7, 7).unwrap(), vec!["root"]);
        assert_eq!(spec.cover(2, 5, 7).unwrap(), vec!["01", "10"]);
        assert_eq!(spec.cover(3, 3, 7).unwrap(), vec!["011"]);
        assert!(spec.cover(5, 4, 7).unwrap().is_empty());

        // Length one prefixes are not stored with sparsity 2, so they are split.
        let sparse = int_spec(0, 7, 2);
        assert_eq!(sparse.cover(4, 7, 7).unwrap(), vec!["10", "11"]);
    }

    #[test]
    fn tokens_depend_on_value_and_bucket() {
        let key: Vec<u8> = (0..96).collect();
        let tokens = CollectionTokens::new(&key).unwrap();
        let a = tokens.for_value(b"a").unwrap();
        let b = tokens.for_value(b"b").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, tokens.for_value(b"a").unwrap());
        assert_ne!(a.with_contention(0).unwrap(), a.with_contention(1).unwrap());
        assert!(CollectionTokens::new(&key[..32]).is_err());
    }
}
