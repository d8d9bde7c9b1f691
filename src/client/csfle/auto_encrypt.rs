//! Rewriting of outgoing commands and replies for automatic encryption.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Analyzer, ClientState};
use crate::{
    bson::{doc, spec::BinarySubtype, Bson, Document},
    crypt::{
        analysis,
        schema::{EncryptedFields, JsonSchema, ResolvedSchema},
    },
    error::{Error, ErrorKind, Result},
    results::CollectionType,
    trace::ENCRYPTION_TRACING_EVENT_TARGET,
    Namespace,
};

/// Commands that never carry user data and are sent as-is.
const BYPASSED_COMMANDS: &[&str] = &[
    "hello",
    "isMaster",
    "ismaster",
    "ping",
    "buildInfo",
    "buildinfo",
    "getMore",
    "killCursors",
    "listCollections",
    "listIndexes",
    "create",
    "drop",
    "createIndexes",
    "dropIndexes",
    "endSessions",
    "commitTransaction",
    "abortTransaction",
    "saslStart",
    "saslContinue",
    "listDatabases",
];

const SUPPORTED_COMMANDS: &[&str] = &[
    "insert",
    "update",
    "delete",
    "find",
    "aggregate",
    "count",
    "distinct",
    "findAndModify",
    "explain",
];

/// Where a command is in its trip through automatic encryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Received,
    SchemaResolved,
    Encrypted,
    PassthroughUnencrypted,
    ReplyReceived,
    Decrypted,
    PassthroughReply,
}

fn trace_stage(stage: Stage, command: &str) {
    tracing::trace!(
        target: ENCRYPTION_TRACING_EVENT_TARGET,
        ?stage,
        command,
        "Automatic encryption stage",
    );
}

fn command_name(command: &Document) -> Result<&str> {
    crate::bson_util::first_key(command).ok_or_else(|| Error::invalid_argument("empty command"))
}

/// The command whose target collection decides the schema: the command itself, or the one an
/// `explain` wraps.
fn target_command(command: &Document) -> Result<&Document> {
    match command_name(command)? {
        "explain" => command
            .get_document("explain")
            .map_err(|_| Error::invalid_argument("explain must wrap a command")),
        _ => Ok(command),
    }
}

fn encryption_information(ns: &Namespace, fields: &EncryptedFields) -> Document {
    let mut schema = fields.raw().clone();
    for key in ["esc", "ecoc"] {
        let name = format!("{key}Collection");
        if !schema.contains_key(&name) {
            schema.insert(name, format!("enxcol_.{}.{key}", ns.coll));
        }
    }
    let mut schemas = Document::new();
    schemas.insert(ns.to_string(), schema);
    doc! {
        "type": 1,
        "schema": schemas,
    }
}

fn has_encrypted_values(value: &Bson) -> bool {
    match value {
        Bson::Binary(binary) => binary.subtype == BinarySubtype::Encrypted,
        Bson::Document(doc) => doc.values().any(has_encrypted_values),
        Bson::Array(items) => items.iter().any(has_encrypted_values),
        _ => false,
    }
}

/// Attaches `encryptionInformation` to the command, or to the command an `explain` wraps.
fn add_encryption_information(command: &mut Document, info: Document) -> Result<()> {
    if command_name(command)? == "explain" {
        if let Some(Bson::Document(inner)) = command.get_mut("explain") {
            inner.insert("encryptionInformation", info);
            return Ok(());
        }
    }
    command.insert("encryptionInformation", info);
    Ok(())
}

impl ClientState {
    /// Encrypts the fields of `command` that the target namespace's schema marks for encryption.
    pub(crate) async fn encrypt_command(&self, db: &str, command: Document) -> Result<Document> {
        let name = command_name(&command)?.to_string();
        trace_stage(Stage::Received, &name);

        if BYPASSED_COMMANDS.contains(&name.as_str())
            || self.opts.bypass_auto_encryption == Some(true)
        {
            trace_stage(Stage::PassthroughUnencrypted, &name);
            return Ok(command);
        }
        let target = target_command(&command)?;
        let target_name = command_name(target)?;
        if !SUPPORTED_COMMANDS.contains(&target_name) || target_name == "explain" {
            return Err(Error::encryption(format!(
                "command not supported for auto encryption: {target_name}"
            )));
        }

        let schema = match target.get(target_name) {
            Some(Bson::String(coll)) => self.resolve_schema(&Namespace::new(db, coll)).await?,
            // Database-level aggregations have no collection of their own.
            _ => ResolvedSchema::None,
        };
        trace_stage(Stage::SchemaResolved, &name);

        let info = match (&schema, target.get_str(target_name)) {
            (ResolvedSchema::EncryptedFields(fields), Ok(coll)) => Some(encryption_information(
                &Namespace::new(db, coll),
                fields,
            )),
            _ => None,
        };

        let mut command = match self.analyzer {
            Some(ref analyzer) if schema.has_encrypted_fields() => {
                let marked = match analyzer {
                    Analyzer::Builtin => analysis::mark_command(command, &schema)?,
                    Analyzer::Mongocryptd(mongocryptd) => {
                        let mut command = command;
                        if let Some(ref info) = info {
                            add_encryption_information(&mut command, info.clone())?;
                        }
                        mongocryptd.mark(db, command, &schema).await?
                    }
                };
                let encrypted = self.engine.encrypt_markings(marked).await?;
                trace_stage(Stage::Encrypted, &name);
                encrypted
            }
            _ => {
                trace_stage(Stage::PassthroughUnencrypted, &name);
                command
            }
        };
        if let Some(info) = info {
            add_encryption_information(&mut command, info)?;
        }
        Ok(command)
    }

    /// Decrypts every encrypted value in a reply.
    pub(crate) async fn decrypt_reply(&self, reply: Document) -> Result<Document> {
        trace_stage(Stage::ReplyReceived, "reply");
        if !reply.values().any(has_encrypted_values) {
            trace_stage(Stage::PassthroughReply, "reply");
            return Ok(reply);
        }
        let decrypted = self.engine.decrypt_document(reply).await?;
        trace_stage(Stage::Decrypted, "reply");
        Ok(decrypted)
    }

    /// The schema of `ns`: a locally configured one first, then whatever `listCollections`
    /// reports. Remote lookups are cached per namespace.
    async fn resolve_schema(&self, ns: &Namespace) -> Result<ResolvedSchema> {
        let key = ns.to_string();
        if let Some(schema) = self.local_schemas.get(&key) {
            return Ok(schema.clone());
        }
        let cached = cache_guard(&self.remote_schemas).get(&key).cloned();
        if let Some(schema) = cached {
            return Ok(schema);
        }

        let Some(client) = self.metadata_client.as_ref() else {
            return Ok(ResolvedSchema::None);
        };
        let client = client.upgrade().ok_or(ErrorKind::Shutdown)?;
        let mut cursor = client
            .database(&ns.db)
            .list_collections(doc! { "name": &ns.coll })
            .await?;
        let schema = if cursor.advance().await? {
            let spec = cursor.deserialize_current()?;
            if spec.collection_type == CollectionType::View {
                return Err(Error::encryption(format!("cannot auto encrypt a view: {ns}")));
            }
            if let Ok(fields) = spec.options.get_document("encryptedFields") {
                ResolvedSchema::EncryptedFields(Arc::new(EncryptedFields::parse(fields.clone())?))
            } else if let Ok(schema) = spec
                .options
                .get_document("validator")
                .and_then(|v| v.get_document("$jsonSchema"))
            {
                ResolvedSchema::JsonSchema(Arc::new(JsonSchema::parse(schema.clone(), true)?))
            } else {
                ResolvedSchema::None
            }
        } else {
            ResolvedSchema::None
        };
        tracing::debug!(
            target: ENCRYPTION_TRACING_EVENT_TARGET,
            namespace = %ns,
            encrypted = schema.has_encrypted_fields(),
            "Resolved remote schema",
        );

        cache_guard(&self.remote_schemas).insert(key, schema.clone());
        Ok(schema)
    }
}

/// Locks a cache whose entries are replaced whole, so a panic elsewhere cannot leave one
/// half-written and a poisoned lock is still safe to use.
fn cache_guard<T>(cache: &Mutex<T>) -> MutexGuard<'_, T> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn poisoned_schema_cache_stays_usable() {
        let cache: Mutex<HashMap<String, ResolvedSchema>> = Mutex::new(HashMap::new());
        let _ = std::panic::catch_unwind(|| {
            let _held = cache.lock().unwrap();
            panic!("panicked while holding the schema cache");
        });
        assert!(cache.is_poisoned());

        cache_guard(&cache).insert("db.coll".to_string(), ResolvedSchema::None);
        assert!(cache_guard(&cache).contains_key("db.coll"));
    }

    #[test]
    fn encryption_information_names_state_collections() {
        let fields = EncryptedFields::parse(doc! {
            "escCollection": "custom_esc",
            "fields": [],
        })
        .unwrap();
        let info = encryption_information(&Namespace::new("db", "coll"), &fields);
        assert_eq!(
            info,
            doc! {
                "type": 1,
                "schema": {
                    "db.coll": {
                        "escCollection": "custom_esc",
                        "fields": [],
                        "ecocCollection": "enxcol_.coll.ecoc",
                    }
                }
            }
        );
    }

    #[test]
    fn explain_carries_information_inside() {
        let mut command = doc! { "explain": { "find": "coll" }, "verbosity": "queryPlanner" };
        add_encryption_information(&mut command, doc! { "type": 1 }).unwrap();
        assert_eq!(
            command,
            doc! {
                "explain": { "find": "coll", "encryptionInformation": { "type": 1 } },
                "verbosity": "queryPlanner",
            }
        );
        assert_eq!(
            command_name(target_command(&command).unwrap()).unwrap(),
            "find"
        );
    }
}
