//! Collections, query matching and update application for the mock deployment.
//!
//! Queryable encryption is simulated the way a server would handle it: insert payloads are
//! replaced by their stored ciphertext and their EDC tokens become `__safeContent__` tags, and
//! find payloads match a document when one of the tags they derive is present.

use std::cmp::Ordering;

use crate::{
    bson::{oid::ObjectId, spec::BinarySubtype, Binary, Bson, DateTime, Document},
    bson_util,
    crypt::{
        payload::{self, BlobSubtype, CiphertextBlob},
        tokens::{Token, ValueTokens},
    },
};

pub(super) const DUPLICATE_KEY: i32 = 11000;
const BAD_VALUE: i32 = 2;
const FAILED_TO_PARSE: i32 = 9;

/// A write that the mock refuses, reported as a write error or a command error.
#[derive(Debug)]
pub(super) struct WriteFailure {
    pub(super) code: i32,
    pub(super) message: String,
}

impl WriteFailure {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub(super) fn indexed(&self, index: usize) -> Document {
        let mut error = Document::new();
        error.insert("index", index as i32);
        error.insert("code", self.code);
        error.insert("errmsg", self.message.clone());
        error
    }
}

#[derive(Debug, Default)]
pub(super) struct UpdateOutcome {
    pub(super) matched: i32,
    pub(super) modified: i32,
    pub(super) upserted: Option<Bson>,
}

#[derive(Clone, Debug, Default)]
pub(super) struct Collection {
    pub(super) docs: Vec<Document>,
    pub(super) options: Document,
    pub(super) unique: Vec<String>,
}

impl Collection {
    pub(super) fn is_view(&self) -> bool {
        self.options.contains_key("viewOn")
    }

    pub(super) fn insert(&mut self, mut doc: Document) -> Result<(), WriteFailure> {
        store_encrypted_values(&mut doc)?;
        self.check_unique(&doc, None)?;
        self.docs.push(doc);
        Ok(())
    }

    pub(super) fn matching(&self, filter: &Document) -> Vec<Document> {
        self.docs
            .iter()
            .filter(|doc| matches(doc, filter))
            .cloned()
            .collect()
    }

    pub(super) fn first_match(&self, filter: &Document, sort: Option<&Document>) -> Option<usize> {
        let mut indexes: Vec<usize> = (0..self.docs.len())
            .filter(|&i| matches(&self.docs[i], filter))
            .collect();
        if let Some(sort) = sort {
            indexes.sort_by(|&a, &b| compare_by(&self.docs[a], &self.docs[b], sort));
        }
        indexes.first().copied()
    }

    fn check_unique(&self, doc: &Document, skip: Option<usize>) -> Result<(), WriteFailure> {
        let fields = std::iter::once("_id").chain(self.unique.iter().map(String::as_str));
        for field in fields {
            let values = candidates(doc, field);
            if values.is_empty() {
                continue;
            }
            let clash = self.docs.iter().enumerate().any(|(i, other)| {
                Some(i) != skip && candidates(other, field).iter().any(|v| values.contains(v))
            });
            if clash {
                return Err(WriteFailure::new(
                    DUPLICATE_KEY,
                    format!("E11000 duplicate key error dup key: {{ {field}: ... }}"),
                ));
            }
        }
        Ok(())
    }

    /// Replaces the document at `index` with the result of `update`, returning the document as
    /// it was before.
    pub(super) fn update_at(
        &mut self,
        index: usize,
        update: &Bson,
    ) -> Result<(Document, Document), WriteFailure> {
        let before = self.docs[index].clone();
        let mut after = apply_update(&before, update, false)?;
        store_encrypted_values(&mut after)?;
        self.check_unique(&after, Some(index))?;
        self.docs[index] = after.clone();
        Ok((before, after))
    }

    /// Inserts the document an upsert creates when nothing matched `query`.
    pub(super) fn upsert(
        &mut self,
        query: &Document,
        update: &Bson,
    ) -> Result<Document, WriteFailure> {
        let mut seed = Document::new();
        for (key, value) in query {
            let is_operator = matches!(value, Bson::Document(d) if is_operator_doc(d));
            if !key.starts_with('$') && !is_operator {
                seed.insert(key.clone(), value.clone());
            }
        }
        let mut doc = apply_update(&seed, update, true)?;
        if !doc.contains_key("_id") {
            let mut with_id = Document::new();
            with_id.insert("_id", ObjectId::new());
            with_id.extend(doc);
            doc = with_id;
        }
        self.insert(doc.clone())?;
        self.docs.last().cloned().ok_or_else(|| WriteFailure::new(BAD_VALUE, "upsert lost"))
    }

    pub(super) fn update(
        &mut self,
        query: &Document,
        update: &Bson,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome, WriteFailure> {
        let targets: Vec<usize> = (0..self.docs.len())
            .filter(|&i| matches(&self.docs[i], query))
            .take(if multi { usize::MAX } else { 1 })
            .collect();
        let mut outcome = UpdateOutcome::default();
        if targets.is_empty() {
            if upsert {
                let doc = self.upsert(query, update)?;
                outcome.upserted = doc.get("_id").cloned();
            }
            return Ok(outcome);
        }
        for index in targets {
            let (before, after) = self.update_at(index, update)?;
            outcome.matched += 1;
            if before != after {
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }
}

/// Every value `path` reaches in `doc`, with the elements of arrays listed alongside the arrays.
pub(super) fn candidates(doc: &Document, path: &str) -> Vec<Bson> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut found = Vec::new();
    if let Some(first) = doc.get(parts[0]) {
        lookup(first, &parts[1..], &mut found);
    }
    let mut out = Vec::with_capacity(found.len());
    for value in found {
        if let Bson::Array(ref items) = value {
            out.extend(items.iter().cloned());
        }
        out.push(value);
    }
    out
}

fn lookup(value: &Bson, parts: &[&str], out: &mut Vec<Bson>) {
    let Some((first, rest)) = parts.split_first() else {
        out.push(value.clone());
        return;
    };
    match value {
        Bson::Document(doc) => {
            if let Some(next) = doc.get(*first) {
                lookup(next, rest, out);
            }
        }
        Bson::Array(items) => match first.parse::<usize>() {
            Ok(i) => {
                if let Some(next) = items.get(i) {
                    lookup(next, rest, out);
                }
            }
            Err(_) => {
                for item in items.iter().filter(|item| matches!(item, Bson::Document(_))) {
                    lookup(item, parts, out);
                }
            }
        },
        _ => {}
    }
}

fn clauses(value: &Bson) -> impl Iterator<Item = &Document> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Bson::as_document)
}

/// Whether `doc` satisfies a query filter.
pub(super) fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => clauses(condition).all(|c| matches(doc, c)),
        "$or" => clauses(condition).any(|c| matches(doc, c)),
        "$nor" => !clauses(condition).any(|c| matches(doc, c)),
        "$expr" => truthy(&eval(condition, doc, None)),
        "$comment" => true,
        path => field_matches(doc, path, condition),
    })
}

fn field_matches(doc: &Document, path: &str, condition: &Bson) -> bool {
    let values = candidates(doc, path);
    match condition {
        Bson::Document(ops) if bson_util::first_key(ops).is_some_and(|k| k.starts_with('$')) => ops
            .iter()
            .all(|(op, operand)| operator_matches(doc, &values, op, operand)),
        _ => equals(doc, &values, condition),
    }
}

fn equals(doc: &Document, values: &[Bson], target: &Bson) -> bool {
    if let Some(tags) = equality_tags(target) {
        return has_tag(doc, &tags);
    }
    if *target == Bson::Null {
        return values.is_empty() || values.contains(&Bson::Null);
    }
    values.contains(target)
}

fn operator_matches(doc: &Document, values: &[Bson], op: &str, operand: &Bson) -> bool {
    match op {
        "$eq" => equals(doc, values, operand),
        "$ne" => !equals(doc, values, operand),
        "$in" => clauses_or_values(operand).any(|item| equals(doc, values, item)),
        "$nin" => !clauses_or_values(operand).any(|item| equals(doc, values, item)),
        "$exists" => values.is_empty() != truthy(&Some(operand.clone())),
        "$gt" | "$gte" | "$lt" | "$lte" => match range_tags(operand) {
            Some(Some(tags)) => has_tag(doc, &tags),
            // The second half of a two-sided range query is decided by the first.
            Some(None) => true,
            None => values.iter().any(|value| {
                compare(value, operand).is_some_and(|ordering| ordering_matches(op, ordering))
            }),
        },
        _ => false,
    }
}

fn clauses_or_values(value: &Bson) -> impl Iterator<Item = &Bson> {
    value.as_array().into_iter().flatten()
}

fn ordering_matches(op: &str, ordering: Ordering) -> bool {
    match op {
        "$gt" => ordering == Ordering::Greater,
        "$gte" => ordering != Ordering::Less,
        "$lt" => ordering == Ordering::Less,
        _ => ordering != Ordering::Greater,
    }
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}

pub(super) fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
        (Bson::DateTime(a), Bson::DateTime(b)) => Some(a.cmp(b)),
        _ => number(a)?.partial_cmp(&number(b)?),
    }
}

fn compare_by(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (path, direction) in sort {
        let (x, y) = (candidates(a, path), candidates(b, path));
        let ordering = match (x.first(), y.first()) {
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        let ordering = if bson_util::get_int(direction) == Some(-1) {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

pub(super) fn sort(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| compare_by(a, b, sort));
}

fn truthy(value: &Option<Bson>) -> bool {
    match value {
        None | Some(Bson::Null) | Some(Bson::Undefined) | Some(Bson::Boolean(false)) => false,
        Some(Bson::Int32(0)) | Some(Bson::Int64(0)) => false,
        Some(Bson::Double(d)) => *d != 0.0,
        Some(_) => true,
    }
}

/// Evaluates an aggregation expression. `None` stands for a missing value and for `$$REMOVE`.
pub(super) fn eval(expr: &Bson, root: &Document, this: Option<&Bson>) -> Option<Bson> {
    match expr {
        Bson::String(s) if s == "$$REMOVE" => None,
        Bson::String(s) if s == "$$ROOT" => Some(Bson::Document(root.clone())),
        Bson::String(s) if s.starts_with("$$this") => {
            let this = this?;
            match s.strip_prefix("$$this.") {
                Some(path) => {
                    let mut found = Vec::new();
                    let parts: Vec<&str> = path.split('.').collect();
                    lookup(this, &parts, &mut found);
                    found.into_iter().next()
                }
                None => Some(this.clone()),
            }
        }
        Bson::String(s) if s.starts_with('$') => {
            let parts: Vec<&str> = s[1..].split('.').collect();
            let mut found = Vec::new();
            lookup(&Bson::Document(root.clone()), &parts, &mut found);
            found.into_iter().next()
        }
        Bson::Array(items) => Some(Bson::Array(
            items
                .iter()
                .map(|item| eval(item, root, this).unwrap_or(Bson::Null))
                .collect(),
        )),
        Bson::Document(doc) => match bson_util::first_key(doc) {
            Some(op) if op.starts_with('$') => eval_operator(op, doc.get(op)?, root, this),
            _ => Some(Bson::Document(
                doc.iter()
                    .filter_map(|(k, v)| eval(v, root, this).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        },
        other => Some(other.clone()),
    }
}

fn eval_operator(op: &str, args: &Bson, root: &Document, this: Option<&Bson>) -> Option<Bson> {
    let arg = |i: usize| {
        args.as_array()
            .and_then(|items| items.get(i))
            .and_then(|item| eval(item, root, this))
    };
    match op {
        "$literal" => Some(args.clone()),
        "$eq" => Some(Bson::Boolean(arg(0) == arg(1))),
        "$ne" => Some(Bson::Boolean(arg(0) != arg(1))),
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let ordering = compare(&arg(0)?, &arg(1)?)?;
            Some(Bson::Boolean(ordering_matches(op, ordering)))
        }
        "$and" => Some(Bson::Boolean(
            args.as_array()?
                .iter()
                .all(|e| truthy(&eval(e, root, this))),
        )),
        "$or" => Some(Bson::Boolean(
            args.as_array()?
                .iter()
                .any(|e| truthy(&eval(e, root, this))),
        )),
        "$not" => Some(Bson::Boolean(!truthy(&arg(0)))),
        "$cond" => {
            let (condition, then, otherwise) = match args {
                Bson::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                Bson::Document(d) => (d.get("if")?, d.get("then")?, d.get("else")?),
                _ => return None,
            };
            if truthy(&eval(condition, root, this)) {
                eval(then, root, this)
            } else {
                eval(otherwise, root, this)
            }
        }
        "$filter" => {
            let spec = args.as_document()?;
            let Bson::Array(items) = eval(spec.get("input")?, root, this)? else {
                return Some(Bson::Null);
            };
            let condition = spec.get("cond")?;
            Some(Bson::Array(
                items
                    .into_iter()
                    .filter(|item| truthy(&eval(condition, root, Some(item))))
                    .collect(),
            ))
        }
        "$size" => match arg(0).or_else(|| eval(args, root, this))? {
            Bson::Array(items) => Some(Bson::Int32(items.len() as i32)),
            _ => None,
        },
        _ => None,
    }
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                unset_path(inner, rest);
            }
        }
    }
}

fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Bson> {
    match path.split_once('.') {
        None => doc.get_mut(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Bson::Document(inner)) => get_path_mut(inner, rest),
            _ => None,
        },
    }
}

fn push_values(
    doc: &mut Document,
    path: &str,
    value: &Bson,
    unique: bool,
) -> Result<(), WriteFailure> {
    let items: Vec<Bson> = match value {
        Bson::Document(spec) if spec.contains_key("$each") => spec
            .get_array("$each")
            .map_err(|_| WriteFailure::new(BAD_VALUE, "$each must be an array"))?
            .clone(),
        other => vec![other.clone()],
    };
    if get_path_mut(doc, path).is_none() {
        set_path(doc, path, Bson::Array(Vec::new()));
    }
    let Some(Bson::Array(existing)) = get_path_mut(doc, path) else {
        return Err(WriteFailure::new(
            BAD_VALUE,
            format!("cannot apply an array operator to non-array field {path}"),
        ));
    };
    for item in items {
        if !unique || !existing.contains(&item) {
            existing.push(item);
        }
    }
    Ok(())
}

fn fields(value: &Bson, op: &str) -> Result<Document, WriteFailure> {
    value
        .as_document()
        .cloned()
        .ok_or_else(|| WriteFailure::new(FAILED_TO_PARSE, format!("{op} needs a document")))
}

fn is_operator_doc(doc: &Document) -> bool {
    bson_util::first_key(doc).is_some_and(|k| k.starts_with('$'))
}

/// Applies an update document, an aggregation pipeline or a replacement.
pub(super) fn apply_update(
    doc: &Document,
    update: &Bson,
    inserting: bool,
) -> Result<Document, WriteFailure> {
    let mut out = doc.clone();
    match update {
        Bson::Array(_) => {
            for stage in clauses(update) {
                let current = out.clone();
                match bson_util::first_key(stage) {
                    Some(op @ ("$set" | "$addFields")) => {
                        for (path, expr) in fields(&stage[op], op)? {
                            match eval(&expr, &current, None) {
                                Some(value) => set_path(&mut out, &path, value),
                                None => unset_path(&mut out, &path),
                            }
                        }
                    }
                    Some("$unset") => match &stage["$unset"] {
                        Bson::String(path) => unset_path(&mut out, path),
                        paths => {
                            for path in clauses_or_values(paths).filter_map(Bson::as_str) {
                                unset_path(&mut out, path);
                            }
                        }
                    },
                    other => {
                        return Err(WriteFailure::new(
                            FAILED_TO_PARSE,
                            format!("unsupported update pipeline stage {other:?}"),
                        ))
                    }
                }
            }
        }
        Bson::Document(update) if is_operator_doc(update) => {
            for (op, value) in update {
                let fields = fields(value, op)?;
                for (path, value) in fields {
                    match op.as_str() {
                        "$set" => set_path(&mut out, &path, value),
                        "$setOnInsert" if inserting => set_path(&mut out, &path, value),
                        "$setOnInsert" => {}
                        "$unset" => unset_path(&mut out, &path),
                        "$currentDate" => {
                            set_path(&mut out, &path, Bson::DateTime(DateTime::now()))
                        }
                        "$inc" => {
                            let current = get_path_mut(&mut out, &path).and_then(|v| number(v));
                            let sum = match (current, &value) {
                                (None, v) => v.clone(),
                                (Some(c), Bson::Int32(i)) if c.fract() == 0.0 => {
                                    Bson::Int64(c as i64 + i64::from(*i))
                                }
                                (Some(c), v) => Bson::Double(c + number(v).unwrap_or(0.0)),
                            };
                            set_path(&mut out, &path, sum);
                        }
                        "$addToSet" => push_values(&mut out, &path, &value, true)?,
                        "$push" => push_values(&mut out, &path, &value, false)?,
                        other => {
                            return Err(WriteFailure::new(
                                FAILED_TO_PARSE,
                                format!("unknown update operator {other}"),
                            ))
                        }
                    }
                }
            }
        }
        Bson::Document(replacement) => {
            out = Document::new();
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
            for (key, value) in replacement {
                out.insert(key.clone(), value.clone());
            }
        }
        _ => {
            return Err(WriteFailure::new(
                FAILED_TO_PARSE,
                "update must be a document or pipeline",
            ))
        }
    }
    Ok(out)
}

fn token(doc: &Document, key: &str) -> Option<Token> {
    match doc.get(key) {
        Some(Bson::Binary(binary)) => Token::try_from(binary.bytes.as_slice()).ok(),
        _ => None,
    }
}

fn tag(token: Token) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: token.to_vec(),
    })
}

/// The tags an EDC token derives for each contention bucket up to `contention`.
fn bucket_tags(edc: Token, contention: u64, out: &mut Vec<Bson>) {
    let tokens = ValueTokens {
        edc,
        esc: [0; 32],
        server: [0; 32],
    };
    for bucket in 0..=contention {
        if let Ok((derived, _)) = tokens.with_contention(bucket) {
            out.push(tag(derived));
        }
    }
}

fn document_payload(value: &Bson, subtype: BlobSubtype) -> Option<Document> {
    let Bson::Binary(binary) = value else {
        return None;
    };
    if payload::blob_subtype(binary) != Some(subtype) {
        return None;
    }
    payload::parse_document_payload(binary).ok().map(|(_, doc)| doc)
}

fn equality_tags(value: &Bson) -> Option<Vec<Bson>> {
    let payload = document_payload(value, BlobSubtype::FindEquality)?;
    let contention = payload.get("cm").and_then(bson_util::get_u64).unwrap_or(0);
    let mut tags = Vec::new();
    bucket_tags(token(&payload, "d")?, contention, &mut tags);
    Some(tags)
}

/// `Some(None)` for the stub operand of a two-sided range query.
fn range_tags(value: &Bson) -> Option<Option<Vec<Bson>>> {
    let payload = document_payload(value, BlobSubtype::FindRange)?;
    let Ok(body) = payload.get_document("payload") else {
        return Some(None);
    };
    let contention = body.get("cm").and_then(bson_util::get_u64).unwrap_or(0);
    let mut tags = Vec::new();
    for edge in clauses(body.get("g").unwrap_or(&Bson::Null)) {
        if let Some(edc) = token(edge, "d") {
            bucket_tags(edc, contention, &mut tags);
        }
    }
    Some(Some(tags))
}

fn has_tag(doc: &Document, tags: &[Bson]) -> bool {
    doc.get_array("__safeContent__")
        .is_ok_and(|stored| stored.iter().any(|t| tags.contains(t)))
}

/// Replaces queryable encryption insert payloads with the ciphertext a server stores and records
/// their tags in `__safeContent__`.
pub(super) fn store_encrypted_values(doc: &mut Document) -> Result<(), WriteFailure> {
    let mut tags = Vec::new();
    for (_, value) in doc.iter_mut() {
        convert(value, &mut tags)?;
    }
    if tags.is_empty() {
        return Ok(());
    }
    match doc.get_mut("__safeContent__") {
        Some(Bson::Array(existing)) => existing.extend(tags),
        _ => {
            doc.insert("__safeContent__", tags);
        }
    }
    Ok(())
}

fn convert(value: &mut Bson, tags: &mut Vec<Bson>) -> Result<(), WriteFailure> {
    match value {
        Bson::Document(doc) => {
            for (_, inner) in doc.iter_mut() {
                convert(inner, tags)?;
            }
        }
        Bson::Array(items) => {
            for inner in items {
                convert(inner, tags)?;
            }
        }
        Bson::Binary(_) => {
            if let Some(payload) = document_payload(value, BlobSubtype::InsertUpdate) {
                *value = Bson::Binary(stored_value(&payload, tags)?);
            }
        }
        _ => {}
    }
    Ok(())
}

fn stored_value(payload: &Document, tags: &mut Vec<Bson>) -> Result<Binary, WriteFailure> {
    let malformed = || WriteFailure::new(BAD_VALUE, "malformed queryable encryption payload");
    let key_id = match payload.get("u") {
        Some(Bson::Binary(binary)) => binary.to_uuid().map_err(|_| malformed())?,
        _ => return Err(malformed()),
    };
    let bson_type = payload
        .get_i32("t")
        .ok()
        .and_then(|t| u8::try_from(t).ok())
        .ok_or_else(malformed)?;
    let ciphertext = payload.get_binary_generic("v").map_err(|_| malformed())?.clone();

    tags.push(tag(token(payload, "d").ok_or_else(malformed)?));
    let subtype = match payload.get("g") {
        Some(edges) => {
            for edge in clauses(edges) {
                tags.push(tag(token(edge, "d").ok_or_else(malformed)?));
            }
            BlobSubtype::IndexedRange
        }
        None => BlobSubtype::IndexedEquality,
    };
    Ok(CiphertextBlob {
        subtype,
        key_id,
        bson_type,
        ciphertext,
    }
    .into_binary())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bson::doc;

    #[test]
    fn filters() {
        let doc = doc! { "a": 5, "tags": ["x", "y"], "sub": { "b": "z" }, "list": [{ "c": 1 }] };
        assert!(matches(&doc, &doc! { "a": 5 }));
        assert!(matches(&doc, &doc! { "tags": "y" }));
        assert!(matches(&doc, &doc! { "sub.b": "z", "list.c": 1 }));
        assert!(matches(&doc, &doc! { "a": { "$gte": 5, "$lt": 6 } }));
        assert!(matches(&doc, &doc! { "$or": [{ "a": 1 }, { "tags": { "$in": ["x"] } }] }));
        assert!(matches(&doc, &doc! { "missing": { "$exists": false } }));
        assert!(!matches(&doc, &doc! { "a": { "$ne": 5 } }));
        assert!(!matches(&doc, &doc! { "$nor": [{ "a": 5 }] }));
    }

    #[test]
    fn pipeline_update_removes_alt_name() {
        let pipeline = Bson::Array(vec![Bson::Document(doc! {
            "$set": {
                "keyAltNames": {
                    "$cond": [
                        { "$eq": ["$keyAltNames", ["a"]] },
                        "$$REMOVE",
                        {
                            "$filter": {
                                "input": "$keyAltNames",
                                "cond": { "$ne": ["$$this", "a"] },
                            }
                        },
                    ]
                }
            }
        })]);
        let two = doc! { "_id": 1, "keyAltNames": ["a", "b"] };
        assert_eq!(
            apply_update(&two, &pipeline, false).unwrap(),
            doc! { "_id": 1, "keyAltNames": ["b"] }
        );
        let one = doc! { "_id": 1, "keyAltNames": ["a"] };
        assert_eq!(apply_update(&one, &pipeline, false).unwrap(), doc! { "_id": 1 });
    }

    #[test]
    fn operator_updates() {
        let doc = doc! { "_id": 1, "n": 1 };
        let updated = apply_update(
            &doc,
            &Bson::Document(doc! {
                "$set": { "a.b": "c" },
                "$inc": { "n": 2 },
                "$addToSet": { "names": "x" },
            }),
            false,
        )
        .unwrap();
        assert_eq!(
            updated,
            doc! { "_id": 1, "n": 3_i64, "a": { "b": "c" }, "names": ["x"] }
        );
        let replaced =
            apply_update(&doc, &Bson::Document(doc! { "other": true }), false).unwrap();
        assert_eq!(replaced, doc! { "_id": 1, "other": true });
    }

    #[test]
    fn unique_fields() {
        let mut coll = Collection {
            unique: vec!["keyAltNames".to_string()],
            ..Default::default()
        };
        coll.insert(doc! { "_id": 1, "keyAltNames": ["a"] }).unwrap();
        coll.insert(doc! { "_id": 2 }).unwrap();
        let error = coll
            .insert(doc! { "_id": 3, "keyAltNames": ["b", "a"] })
            .unwrap_err();
        assert_eq!(error.code, DUPLICATE_KEY);
        assert!(coll.insert(doc! { "_id": 1 }).is_err());
    }
}
