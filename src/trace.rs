use crate::bson::{spec::BinarySubtype, Bson, Document};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_csfle::command";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_csfle::connection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_csfle::topology";
pub(crate) const ENCRYPTION_TRACING_EVENT_TARGET: &str = "mongodb_csfle::encryption";
pub(crate) const KMS_TRACING_EVENT_TARGET: &str = "mongodb_csfle::kms";

/// Documents logged in command events are cut off at this many bytes.
pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        let mut s = redact_encrypted(Bson::Document(self.clone()))
            .into_relaxed_extjson()
            .to_string();
        truncate_on_char_boundary(&mut s, DEFAULT_MAX_DOCUMENT_LENGTH_BYTES);
        s
    }
}

impl TracingRepresentation for crate::error::Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

/// Replaces encrypted values (and intent-to-encrypt markings, which carry plaintext) with a
/// placeholder.
fn redact_encrypted(value: Bson) -> Bson {
    match value {
        Bson::Binary(ref binary) if binary.subtype == BinarySubtype::Encrypted => {
            Bson::String("<encrypted>".to_string())
        }
        Bson::Document(doc) => Bson::Document(
            doc.into_iter()
                .map(|(k, v)| (k, redact_encrypted(v)))
                .collect(),
        ),
        Bson::Array(values) => Bson::Array(values.into_iter().map(redact_encrypted).collect()),
        other => other,
    }
}

/// Truncates the given string at the closest UTF-8 character boundary >= the provided length.
/// If the new length is >= the current length, does nothing.
pub(crate) fn truncate_on_char_boundary(s: &mut String, new_len: usize) {
    let original_len = s.len();
    if original_len > new_len {
        // to avoid generating invalid UTF-8, find the first index >= max_length_bytes that is
        // the end of a character.
        let mut truncation_index = new_len;
        while !s.is_char_boundary(truncation_index) {
            truncation_index += 1;
        }
        s.truncate(truncation_index);
        // due to the "rounding up" behavior we might not actually end up truncating anything.
        // if we did, mark the cut with a trailing "...".
        if truncation_index < original_len {
            s.push_str("...")
        }
    }
}
