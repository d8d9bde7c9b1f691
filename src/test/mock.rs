//! An in-process deployment that speaks OP_MSG over in-memory streams. It keeps collections in
//! memory and answers the subset of commands the client sends, with `failCommand` fail points
//! for exercising retries and error handling.

mod store;

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::io::DuplexStream;

use self::store::{Collection, WriteFailure};
use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    client::options::TestOptions,
    cmap::conn::wire::Message,
    error::{ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    runtime::AsyncStream,
    Client,
};

const DEFAULT_BATCH_SIZE: usize = 101;
const MAX_WIRE_VERSION: i32 = 21;

type Reply = std::result::Result<Document, WriteFailure>;

fn code_name(code: i32) -> &'static str {
    match code {
        2 => "BadValue",
        6 => "HostUnreachable",
        9 => "FailedToParse",
        26 => "NamespaceNotFound",
        43 => "CursorNotFound",
        48 => "NamespaceExists",
        59 => "CommandNotFound",
        91 => "ShutdownInProgress",
        166 => "CommandNotSupportedOnView",
        189 => "PrimarySteppedDown",
        10107 => "NotWritablePrimary",
        11000 => "DuplicateKey",
        11600 => "InterruptedAtShutdown",
        _ => "UnknownError",
    }
}

fn command_error(code: i32, message: impl Into<String>) -> Document {
    doc! {
        "ok": 0,
        "code": code,
        "codeName": code_name(code),
        "errmsg": message.into(),
    }
}

fn ok(mut reply: Document) -> Document {
    reply.insert("ok", 1);
    reply
}

fn get_usize(body: &Document, key: &str) -> Option<usize> {
    body.get(key)
        .and_then(bson_util::get_int)
        .and_then(|n| usize::try_from(n).ok())
}

fn documents(value: Option<&Bson>) -> Vec<Document> {
    value
        .and_then(Bson::as_array)
        .into_iter()
        .flatten()
        .filter_map(Bson::as_document)
        .cloned()
        .collect()
}

/// A `failCommand` fail point as configured through `configureFailPoint`.
#[derive(Clone, Debug)]
struct FailCommand {
    commands: Vec<String>,
    remaining: Option<i64>,
    error_code: Option<i32>,
    error_labels: Vec<Bson>,
    close_connection: bool,
    write_concern_error: Option<Document>,
}

/// What a tripped fail point does to a command.
enum Failure {
    Close,
    Reply(Document),
    WriteConcern(Document),
}

#[derive(Debug)]
struct State {
    hello: Document,
    collections: HashMap<String, Collection>,
    cursors: HashMap<i64, (String, VecDeque<Document>)>,
    next_cursor_id: i64,
    commands: Vec<Document>,
    fail_points: Vec<FailCommand>,
    refuse_connections: bool,
    connections_opened: usize,
}

/// A mock deployment shared by every connection a test client opens to it.
#[derive(Clone, Debug)]
pub(crate) struct MockDeployment {
    state: Arc<Mutex<State>>,
}

impl MockDeployment {
    fn with_hello(hello: Document) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                hello,
                collections: HashMap::new(),
                cursors: HashMap::new(),
                next_cursor_id: 1,
                commands: Vec::new(),
                fail_points: Vec::new(),
                refuse_connections: false,
                connections_opened: 0,
            })),
        }
    }

    pub(crate) fn standalone() -> Self {
        Self::with_hello(doc! {
            "ismaster": true,
            "isWritablePrimary": true,
            "helloOk": true,
            "maxWireVersion": MAX_WIRE_VERSION,
            "minWireVersion": 0,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxMessageSizeBytes": 48_000_000,
            "maxWriteBatchSize": 100_000,
            "logicalSessionTimeoutMinutes": 30,
        })
    }

    /// A single-member replica set, so that writes are retryable.
    pub(crate) fn replica_set() -> Self {
        let mock = Self::standalone();
        mock.update_hello(|hello| {
            hello.insert("setName", "rs");
            hello.insert("setVersion", 1);
            hello.insert("hosts", vec!["localhost:27017"]);
            hello.insert("primary", "localhost:27017");
            hello.insert("me", "localhost:27017");
        });
        mock
    }

    pub(crate) fn with_max_wire_version(self, version: i32) -> Self {
        self.update_hello(|hello| {
            hello.insert("maxWireVersion", version);
        });
        self
    }

    pub(crate) fn with_max_write_batch_size(self, size: i32) -> Self {
        self.update_hello(|hello| {
            hello.insert("maxWriteBatchSize", size);
        });
        self
    }

    fn update_hello(&self, f: impl FnOnce(&mut Document)) {
        f(&mut self.lock().hello);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread poisons the lock; the state itself stays usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Options for a client that connects to this deployment.
    pub(crate) fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::builder()
            .hosts(vec![ServerAddress::default()])
            .server_selection_timeout(Duration::from_secs(2))
            .build();
        if let Ok(set_name) = self.lock().hello.get_str("setName") {
            options.repl_set_name = Some(set_name.to_string());
        }
        options.test_options = Some(TestOptions {
            mock: Some(self.clone()),
            heartbeat_freq: Some(Duration::from_millis(10)),
        });
        options
    }

    pub(crate) fn client(&self) -> Client {
        Client::with_options(self.client_options()).unwrap()
    }

    /// Opens a new connection, served by its own task.
    pub(crate) fn connect(&self, _address: &ServerAddress) -> Result<AsyncStream> {
        {
            let mut state = self.lock();
            if state.refuse_connections {
                let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
                return Err(ErrorKind::Io(Arc::new(refused)).into());
            }
            state.connections_opened += 1;
        }
        let (client, server) = tokio::io::duplex(1 << 16);
        tokio::spawn(self.clone().serve(server));
        Ok(AsyncStream::Duplex(client))
    }

    async fn serve(self, mut stream: DuplexStream) {
        while let Ok(message) = Message::read_from(&mut stream, None).await {
            let request_id = message.request_id.unwrap_or_default();
            let Some(reply) = self.handle(message.into_command_document()) else {
                return;
            };
            let mut reply = Message::with_body(reply, None);
            reply.response_to = request_id;
            if reply.write_to(&mut stream).await.is_err() {
                return;
            }
        }
    }

    /// Every command received other than handshakes and heartbeats.
    pub(crate) fn commands(&self) -> Vec<Document> {
        self.lock().commands.clone()
    }

    pub(crate) fn commands_named(&self, name: &str) -> Vec<Document> {
        self.commands()
            .into_iter()
            .filter(|command| bson_util::first_key(command) == Some(name))
            .collect()
    }

    pub(crate) fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// The documents stored in `ns`, as the server holds them.
    pub(crate) fn documents(&self, ns: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(ns)
            .map(|coll| coll.docs.clone())
            .unwrap_or_default()
    }

    /// Creates a collection with the given `create` options, as `listCollections` reports them.
    pub(crate) fn add_collection(&self, ns: &str, options: Document) {
        self.lock().collections.insert(
            ns.to_string(),
            Collection {
                options,
                ..Default::default()
            },
        );
    }

    pub(crate) fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().collections.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    pub(crate) fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// Builds the reply to one command, or `None` to drop the connection.
    fn handle(&self, command: Document) -> Option<Document> {
        let name = bson_util::first_key(&command)?.to_string();
        let mut state = self.lock();
        if matches!(name.as_str(), "hello" | "isMaster" | "ismaster") {
            return Some(ok(state.hello.clone()));
        }
        state.commands.push(command.clone());

        let write_concern_error = match state.trip_fail_point(&name) {
            Some(Failure::Close) => return None,
            Some(Failure::Reply(reply)) => return Some(reply),
            Some(Failure::WriteConcern(error)) => Some(error),
            None => None,
        };

        let db = command.get_str("$db").unwrap_or("test").to_string();
        let mut reply = state.dispatch(&name, &db, &command);
        if let Some(error) = write_concern_error {
            reply.insert("writeConcernError", error);
        }
        Some(reply)
    }
}

impl State {
    fn trip_fail_point(&mut self, name: &str) -> Option<Failure> {
        let index = self
            .fail_points
            .iter()
            .position(|fp| fp.commands.iter().any(|c| c == name))?;
        let fail_point = self.fail_points[index].clone();
        if let Some(remaining) = fail_point.remaining {
            if remaining <= 1 {
                self.fail_points.remove(index);
            } else {
                self.fail_points[index].remaining = Some(remaining - 1);
            }
        }

        if fail_point.close_connection {
            return Some(Failure::Close);
        }
        if let Some(code) = fail_point.error_code {
            let mut reply = command_error(code, format!("failing command {name} via fail point"));
            if !fail_point.error_labels.is_empty() {
                reply.insert("errorLabels", fail_point.error_labels);
            }
            return Some(Failure::Reply(reply));
        }
        fail_point.write_concern_error.map(Failure::WriteConcern)
    }

    fn dispatch(&mut self, name: &str, db: &str, body: &Document) -> Document {
        let target = body.get_str(name).ok().map(|coll| format!("{db}.{coll}"));
        let result = match (name, target) {
            ("ping" | "endSessions", _) => Ok(ok(Document::new())),
            ("buildInfo" | "buildinfo", _) => Ok(ok(doc! { "version": "7.0.0" })),
            ("configureFailPoint", _) => self.configure_fail_point(body),
            ("listCollections", _) => Ok(self.list_collections(db, body)),
            ("getMore", _) => self.get_more(body),
            ("killCursors", _) => Ok(self.kill_cursors(body)),
            ("aggregate", None) => {
                Ok(self.cursor_reply(format!("{db}.$cmd.aggregate"), Vec::new(), body))
            }
            ("insert", Some(ns)) => self.insert(&ns, body),
            ("find", Some(ns)) => Ok(self.find(ns, body)),
            ("update", Some(ns)) => self.update(&ns, body),
            ("delete", Some(ns)) => Ok(self.delete(&ns, body)),
            ("findAndModify", Some(ns)) => self.find_and_modify(&ns, body),
            ("aggregate", Some(ns)) => self.aggregate(ns, body),
            ("count", Some(ns)) => {
                let query = body.get_document("query").cloned().unwrap_or_default();
                Ok(ok(doc! { "n": self.matching(&ns, &query).len() as i64 }))
            }
            ("distinct", Some(ns)) => Ok(self.distinct(&ns, body)),
            ("create", Some(ns)) => self.create(ns, body),
            ("drop", Some(ns)) => self.drop_collection(&ns),
            ("createIndexes", Some(ns)) => Ok(self.create_indexes(ns, body)),
            ("explain", _) => Ok(Self::explain(db, body)),
            (other, _) => Err(WriteFailure {
                code: 59,
                message: format!("no such command: '{other}'"),
            }),
        };
        result.unwrap_or_else(|failure| command_error(failure.code, failure.message))
    }

    fn configure_fail_point(&mut self, body: &Document) -> Reply {
        if body.get_str("configureFailPoint") != Ok("failCommand") {
            return Err(WriteFailure {
                code: 2,
                message: "only failCommand is supported".into(),
            });
        }
        let remaining = match body.get("mode") {
            Some(Bson::String(mode)) if mode == "off" => {
                self.fail_points.clear();
                return Ok(ok(Document::new()));
            }
            Some(Bson::Document(mode)) => mode.get("times").and_then(bson_util::get_int),
            _ => None,
        };
        let data = body.get_document("data").cloned().unwrap_or_default();
        self.fail_points.push(FailCommand {
            commands: data
                .get_array("failCommands")
                .into_iter()
                .flatten()
                .filter_map(Bson::as_str)
                .map(String::from)
                .collect(),
            remaining,
            error_code: data.get("errorCode").and_then(bson_util::get_int).map(|c| c as i32),
            error_labels: data.get_array("errorLabels").cloned().unwrap_or_default(),
            close_connection: data.get_bool("closeConnection").unwrap_or(false),
            write_concern_error: data.get_document("writeConcernError").ok().cloned(),
        });
        Ok(ok(Document::new()))
    }

    fn cursor_reply(&mut self, ns: String, mut docs: Vec<Document>, body: &Document) -> Document {
        let batch_size = get_usize(body, "batchSize")
            .or_else(|| body.get_document("cursor").ok().and_then(|c| get_usize(c, "batchSize")))
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let single_batch = body.get_bool("singleBatch").unwrap_or(false);
        let rest = if docs.len() > batch_size {
            docs.split_off(batch_size)
        } else {
            Vec::new()
        };
        let id = if rest.is_empty() || single_batch {
            0
        } else {
            let id = self.next_cursor_id;
            self.next_cursor_id += 1;
            self.cursors.insert(id, (ns.clone(), rest.into()));
            id
        };
        ok(doc! {
            "cursor": {
                "firstBatch": docs,
                "id": id,
                "ns": ns,
            }
        })
    }

    fn get_more(&mut self, body: &Document) -> Reply {
        let id = body.get("getMore").and_then(bson_util::get_int).unwrap_or(0);
        let Some((ns, mut remaining)) = self.cursors.remove(&id) else {
            return Err(WriteFailure {
                code: 43,
                message: format!("cursor id {id} not found"),
            });
        };
        let batch_size = get_usize(body, "batchSize").unwrap_or(remaining.len());
        let batch: Vec<Document> = remaining.drain(..batch_size.min(remaining.len())).collect();
        let next_id = if remaining.is_empty() {
            0
        } else {
            self.cursors.insert(id, (ns.clone(), remaining));
            id
        };
        Ok(ok(doc! {
            "cursor": {
                "nextBatch": batch,
                "id": next_id,
                "ns": ns,
            }
        }))
    }

    fn kill_cursors(&mut self, body: &Document) -> Document {
        let mut killed = Vec::new();
        for id in body
            .get_array("cursors")
            .into_iter()
            .flatten()
            .filter_map(bson_util::get_int)
        {
            if self.cursors.remove(&id).is_some() {
                killed.push(Bson::Int64(id));
            }
        }
        ok(doc! { "cursorsKilled": killed })
    }

    fn matching(&self, ns: &str, filter: &Document) -> Vec<Document> {
        self.collections
            .get(ns)
            .map(|coll| coll.matching(filter))
            .unwrap_or_default()
    }

    fn writable(&mut self, ns: &str) -> std::result::Result<&mut Collection, WriteFailure> {
        let coll = self.collections.entry(ns.to_string()).or_default();
        if coll.is_view() {
            return Err(WriteFailure {
                code: 166,
                message: format!("namespace {ns} is a view, not a collection"),
            });
        }
        Ok(coll)
    }

    fn insert(&mut self, ns: &str, body: &Document) -> Reply {
        let ordered = body.get_bool("ordered").unwrap_or(true);
        let coll = self.writable(ns)?;
        let mut n = 0;
        let mut write_errors = Vec::new();
        for (index, doc) in documents(body.get("documents")).into_iter().enumerate() {
            match coll.insert(doc) {
                Ok(()) => n += 1,
                Err(failure) => {
                    write_errors.push(failure.indexed(index));
                    if ordered {
                        break;
                    }
                }
            }
        }
        let mut reply = doc! { "n": n };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        Ok(ok(reply))
    }

    fn find(&mut self, ns: String, body: &Document) -> Document {
        let filter = body.get_document("filter").cloned().unwrap_or_default();
        let mut docs = self.matching(&ns, &filter);
        if let Ok(sort) = body.get_document("sort") {
            store::sort(&mut docs, sort);
        }
        let skip = get_usize(body, "skip").unwrap_or(0);
        let limit = get_usize(body, "limit").filter(|l| *l > 0).unwrap_or(usize::MAX);
        let mut docs: Vec<Document> = docs.into_iter().skip(skip).take(limit).collect();
        if let Ok(projection) = body.get_document("projection") {
            for doc in &mut docs {
                project(doc, projection);
            }
        }
        self.cursor_reply(ns, docs, body)
    }

    fn update(&mut self, ns: &str, body: &Document) -> Reply {
        let ordered = body.get_bool("ordered").unwrap_or(true);
        let coll = self.writable(ns)?;
        let (mut n, mut modified) = (0, 0);
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();
        for (index, statement) in documents(body.get("updates")).into_iter().enumerate() {
            let query = statement.get_document("q").cloned().unwrap_or_default();
            let update = statement.get("u").cloned().unwrap_or(Bson::Null);
            let multi = statement.get_bool("multi").unwrap_or(false);
            let upsert = statement.get_bool("upsert").unwrap_or(false);
            match coll.update(&query, &update, multi, upsert) {
                Ok(outcome) => {
                    n += outcome.matched;
                    modified += outcome.modified;
                    if let Some(id) = outcome.upserted {
                        n += 1;
                        upserted.push(doc! { "index": index as i32, "_id": id });
                    }
                }
                Err(failure) => {
                    write_errors.push(failure.indexed(index));
                    if ordered {
                        break;
                    }
                }
            }
        }
        let mut reply = doc! { "n": n, "nModified": modified };
        if !upserted.is_empty() {
            reply.insert("upserted", upserted);
        }
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        Ok(ok(reply))
    }

    fn delete(&mut self, ns: &str, body: &Document) -> Document {
        let mut n = 0;
        if let Some(coll) = self.collections.get_mut(ns) {
            for statement in documents(body.get("deletes")) {
                let query = statement.get_document("q").cloned().unwrap_or_default();
                let limit = statement.get("limit").and_then(bson_util::get_int).unwrap_or(0);
                loop {
                    let Some(index) = coll.first_match(&query, None) else {
                        break;
                    };
                    coll.docs.remove(index);
                    n += 1;
                    if limit == 1 {
                        break;
                    }
                }
            }
        }
        ok(doc! { "n": n })
    }

    fn find_and_modify(&mut self, ns: &str, body: &Document) -> Reply {
        let query = body.get_document("query").cloned().unwrap_or_default();
        let sort = body.get_document("sort").ok().cloned();
        let return_new = body.get_bool("new").unwrap_or(false);
        let coll = self.writable(ns)?;

        let (value, n, updated_existing) = match coll.first_match(&query, sort.as_ref()) {
            Some(index) if body.get_bool("remove").unwrap_or(false) => {
                (Bson::Document(coll.docs.remove(index)), 1, false)
            }
            Some(index) => {
                let update = body.get("update").cloned().unwrap_or(Bson::Null);
                let (before, after) = coll.update_at(index, &update)?;
                let value = if return_new { after } else { before };
                (Bson::Document(value), 1, true)
            }
            None if body.get_bool("upsert").unwrap_or(false) => {
                let update = body.get("update").cloned().unwrap_or(Bson::Null);
                let inserted = coll.upsert(&query, &update)?;
                let value = if return_new {
                    Bson::Document(inserted)
                } else {
                    Bson::Null
                };
                (value, 1, false)
            }
            None => (Bson::Null, 0, false),
        };
        let value = match (value, body.get_document("fields")) {
            (Bson::Document(mut doc), Ok(projection)) => {
                project(&mut doc, projection);
                Bson::Document(doc)
            }
            (value, _) => value,
        };
        Ok(ok(doc! {
            "lastErrorObject": { "n": n, "updatedExisting": updated_existing },
            "value": value,
        }))
    }

    fn aggregate(&mut self, ns: String, body: &Document) -> Reply {
        let mut docs = self.collections.get(&ns).map(|c| c.docs.clone()).unwrap_or_default();
        for stage in documents(body.get("pipeline")) {
            let Some(name) = bson_util::first_key(&stage) else {
                continue;
            };
            let argument = &stage[name];
            match name {
                "$match" => {
                    let filter = argument.as_document().cloned().unwrap_or_default();
                    docs.retain(|doc| store::matches(doc, &filter));
                }
                "$sort" => {
                    if let Some(sort) = argument.as_document() {
                        store::sort(&mut docs, sort);
                    }
                }
                "$skip" => {
                    let skip = bson_util::get_int(argument).unwrap_or(0).max(0) as usize;
                    docs = docs.into_iter().skip(skip).collect();
                }
                "$limit" => {
                    let limit = bson_util::get_int(argument).unwrap_or(0).max(0) as usize;
                    docs.truncate(limit);
                }
                "$project" => {
                    if let Some(projection) = argument.as_document() {
                        for doc in &mut docs {
                            project(doc, projection);
                        }
                    }
                }
                "$count" => {
                    let field = argument.as_str().unwrap_or("count");
                    docs = if docs.is_empty() {
                        Vec::new()
                    } else {
                        let mut counted = Document::new();
                        counted.insert(field, docs.len() as i32);
                        vec![counted]
                    };
                }
                "$group" => {
                    docs = group(&docs, argument.as_document().cloned().unwrap_or_default())
                }
                other => {
                    return Err(WriteFailure {
                        code: 40324,
                        message: format!("Unrecognized pipeline stage name: '{other}'"),
                    })
                }
            }
        }
        Ok(self.cursor_reply(ns, docs, body))
    }

    fn distinct(&self, ns: &str, body: &Document) -> Document {
        let key = body.get_str("key").unwrap_or_default();
        let query = body.get_document("query").cloned().unwrap_or_default();
        let mut values: Vec<Bson> = Vec::new();
        for doc in self.matching(ns, &query) {
            for value in store::candidates(&doc, key) {
                if !matches!(value, Bson::Array(_)) && !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        ok(doc! { "values": values })
    }

    fn create(&mut self, ns: String, body: &Document) -> Reply {
        if self.collections.contains_key(&ns) {
            return Err(WriteFailure {
                code: 48,
                message: format!("Collection {ns} already exists."),
            });
        }
        let mut options = body.clone();
        for key in ["create", "$db", "writeConcern", "lsid", "$readPreference"] {
            options.remove(key);
        }
        self.collections.insert(
            ns,
            Collection {
                options,
                ..Default::default()
            },
        );
        Ok(ok(Document::new()))
    }

    fn drop_collection(&mut self, ns: &str) -> Reply {
        match self.collections.remove(ns) {
            Some(_) => Ok(ok(Document::new())),
            None => Err(WriteFailure {
                code: 26,
                message: "ns not found".into(),
            }),
        }
    }

    fn create_indexes(&mut self, ns: String, body: &Document) -> Document {
        let coll = self.collections.entry(ns).or_default();
        for index in documents(body.get("indexes")) {
            if index.get_bool("unique").unwrap_or(false) {
                if let Ok(keys) = index.get_document("key") {
                    coll.unique.extend(keys.keys().cloned());
                }
            }
        }
        ok(doc! {
            "createdCollectionAutomatically": false,
            "numIndexesBefore": 1,
            "numIndexesAfter": 2,
        })
    }

    fn list_collections(&mut self, db: &str, body: &Document) -> Document {
        let name_only = body.get_bool("nameOnly").unwrap_or(false);
        let filter = body.get_document("filter").cloned().unwrap_or_default();
        let prefix = format!("{db}.");
        let mut specs = Vec::new();
        let mut names: Vec<&String> = self.collections.keys().collect();
        names.sort();
        for ns in names {
            let Some(name) = ns.strip_prefix(&prefix) else {
                continue;
            };
            let coll = &self.collections[ns];
            let kind = if coll.is_view() { "view" } else { "collection" };
            let spec = if name_only {
                doc! { "name": name, "type": kind }
            } else {
                doc! { "name": name, "type": kind, "options": coll.options.clone() }
            };
            if store::matches(&spec, &filter) {
                specs.push(spec);
            }
        }
        self.cursor_reply(format!("{db}.$cmd.listCollections"), specs, body)
    }

    fn explain(db: &str, body: &Document) -> Document {
        let inner = body.get_document("explain").cloned().unwrap_or_default();
        let coll = bson_util::first_key(&inner)
            .and_then(|name| inner.get_str(name).ok())
            .unwrap_or_default();
        let parsed = inner
            .get_document("filter")
            .or_else(|_| inner.get_document("query"))
            .cloned()
            .unwrap_or_default();
        ok(doc! {
            "queryPlanner": {
                "namespace": format!("{db}.{coll}"),
                "parsedQuery": parsed,
            },
            "command": inner,
        })
    }
}

/// Applies a top-level inclusion or exclusion projection.
fn project(doc: &mut Document, projection: &Document) {
    let including = projection
        .iter()
        .any(|(key, value)| key != "_id" && bson_util::get_int(value) == Some(1));
    let keep_id = projection.get("_id").and_then(bson_util::get_int) != Some(0);
    let keys: Vec<String> = doc.keys().cloned().collect();
    for key in keys {
        let listed = projection.get(&key).and_then(bson_util::get_int);
        let keep = if key == "_id" {
            keep_id
        } else if including {
            listed == Some(1)
        } else {
            listed != Some(0)
        };
        if !keep {
            doc.remove(&key);
        }
    }
}

/// `$group` with a constant `_id` and `$sum` accumulators.
fn group(docs: &[Document], spec: Document) -> Vec<Document> {
    if docs.is_empty() {
        return Vec::new();
    }
    let mut out = Document::new();
    for (field, accumulator) in spec {
        if field == "_id" {
            out.insert("_id", accumulator);
            continue;
        }
        let Some(summand) = accumulator.as_document().and_then(|a| a.get("$sum")) else {
            continue;
        };
        let total: i64 = docs
            .iter()
            .filter_map(|doc| match store::eval(summand, doc, None) {
                Some(value) => bson_util::get_int(&value),
                None => None,
            })
            .sum();
        out.insert(field, i32::try_from(total).map(Bson::Int32).unwrap_or(Bson::Int64(total)));
    }
    vec![out]
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn projection() {
        let mut doc = doc! { "_id": 1, "a": 1, "b": 2 };
        project(&mut doc, &doc! { "a": 1 });
        assert_eq!(doc, doc! { "_id": 1, "a": 1 });

        let mut doc = doc! { "_id": 1, "a": 1, "b": 2 };
        project(&mut doc, &doc! { "b": 0, "_id": 0 });
        assert_eq!(doc, doc! { "a": 1 });
    }

    #[test]
    fn count_group() {
        let docs = vec![doc! { "x": 1 }, doc! { "x": 2 }];
        assert_eq!(
            group(&docs, doc! { "_id": 1, "n": { "$sum": 1 } }),
            vec![doc! { "_id": 1, "n": 2 }]
        );
        assert!(group(&[], doc! { "_id": 1, "n": { "$sum": 1 } }).is_empty());
    }

    #[test]
    fn fail_point_counts_down() {
        let mock = MockDeployment::standalone();
        mock.handle(doc! {
            "configureFailPoint": "failCommand",
            "mode": { "times": 1 },
            "data": { "failCommands": ["find"], "errorCode": 91 },
            "$db": "admin",
        })
        .unwrap();
        let failed = mock.handle(doc! { "find": "c", "$db": "db" }).unwrap();
        assert_eq!(failed.get_i32("code"), Ok(91));
        let succeeded = mock.handle(doc! { "find": "c", "$db": "db" }).unwrap();
        assert_eq!(succeeded.get_i32("ok"), Ok(1));
    }
}
