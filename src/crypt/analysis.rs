//! In-process query analysis: walks a command against the namespace's schema and replaces every
//! value that must be encrypted with an intent-to-encrypt marking.

use std::collections::BTreeMap;

use bson::{Bson, Document};

use super::{
    engine::Algorithm,
    key_broker::EncryptKey,
    marking::{Marking, QeAlgorithm, RangeBounds, RangeOp, RangeQuery},
    schema::{self, EncryptRule, FieldRule, KeyRef, QeField, QueryKind, ResolvedSchema},
};
use crate::error::{Error, Result};

/// Returns `command` with markings in place of the values `schema` says to encrypt.
pub(crate) fn mark_command(command: Document, schema: &ResolvedSchema) -> Result<Document> {
    Analyzer {
        schema,
        next_payload_id: 0,
    }
    .command(command)
}

fn is_operator(key: &str) -> bool {
    key.starts_with('$')
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn check_declared_type(path: &str, declared: &[&str], value: &Bson) -> Result<()> {
    let actual = schema::type_name(value);
    if declared.is_empty() || declared.contains(&actual) {
        return Ok(());
    }
    Err(Error::encryption_field(
        format!(
            "type mismatch: expected {}, found {actual}",
            declared.join(" or ")
        ),
        path,
    ))
}

struct Analyzer<'a> {
    schema: &'a ResolvedSchema,
    next_payload_id: i32,
}

impl Analyzer<'_> {
    fn command(&mut self, mut command: Document) -> Result<Document> {
        let name = crate::bson_util::first_key(&command)
            .ok_or_else(|| Error::invalid_argument("empty command"))?
            .to_string();
        match name.as_str() {
            "insert" => {
                for doc in documents_mut(&mut command, "documents")? {
                    let root = doc.clone();
                    self.write(doc, "", &root)?;
                }
            }
            "update" => {
                for statement in documents_mut(&mut command, "updates")? {
                    self.query_field(statement, "q")?;
                    self.update(statement, "u")?;
                }
            }
            "delete" => {
                for statement in documents_mut(&mut command, "deletes")? {
                    self.query_field(statement, "q")?;
                }
            }
            "find" => self.query_field(&mut command, "filter")?,
            "count" => self.query_field(&mut command, "query")?,
            "distinct" => {
                if let Ok(key) = command.get_str("key") {
                    self.check_distinct_key(key)?;
                }
                self.query_field(&mut command, "query")?;
            }
            "findAndModify" => {
                self.query_field(&mut command, "query")?;
                self.update(&mut command, "update")?;
            }
            "aggregate" => {
                if let Some(Bson::Array(pipeline)) = command.get_mut("pipeline") {
                    self.pipeline(pipeline)?;
                }
            }
            "explain" => {
                let inner = match command.remove("explain") {
                    Some(Bson::Document(inner)) => inner,
                    _ => return Err(Error::invalid_argument("explain must wrap a command")),
                };
                let marked = self.command(inner)?;
                let mut out = Document::new();
                out.insert("explain", marked);
                for (key, value) in command {
                    out.insert(key, value);
                }
                return Ok(out);
            }
            other => {
                return Err(Error::encryption(format!(
                    "command not supported for auto encryption: {other}"
                )))
            }
        }
        Ok(command)
    }

    fn check_distinct_key(&self, key: &str) -> Result<()> {
        match self.schema.rule(key) {
            Some(FieldRule::Fle1(rule)) if rule.algorithm == Algorithm::Random => Err(
                Error::encryption_field("cannot run distinct on a randomly encrypted field", key),
            ),
            Some(FieldRule::Qe(_)) => Err(Error::encryption_field(
                "cannot run distinct on a queryable encryption field",
                key,
            )),
            _ => Ok(()),
        }
    }

    fn pipeline(&mut self, pipeline: &mut [Bson]) -> Result<()> {
        for stage in pipeline {
            let Bson::Document(stage) = stage else {
                return Err(Error::invalid_argument("pipeline stages must be documents"));
            };
            let name = crate::bson_util::first_key(stage).unwrap_or_default();
            match name {
                "$match" => self.query_field(stage, "$match")?,
                "$lookup" | "$graphLookup" | "$unionWith" | "$facet"
                    if self.schema.has_encrypted_fields() =>
                {
                    return Err(Error::encryption(format!(
                        "{name} is not supported on a collection with encrypted fields"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    // Writes

    /// Marks the fields of a document about to be stored under `prefix`. `root` is the whole
    /// document, which JSON pointer key references are resolved against.
    fn write(&mut self, doc: &mut Document, prefix: &str, root: &Document) -> Result<()> {
        for (key, value) in doc.iter_mut() {
            let path = join(prefix, key);
            self.write_value(value, &path, root)?;
        }
        Ok(())
    }

    fn write_value(&mut self, value: &mut Bson, path: &str, root: &Document) -> Result<()> {
        let schema = self.schema;
        if let Some(rule) = schema.rule(path) {
            let marking = match rule {
                FieldRule::Fle1(rule) => self.fle1_marking(rule, path, value.clone(), Some(root))?,
                FieldRule::Qe(field) => {
                    check_declared_type(path, field.bson_type.as_deref().as_slice(), value)?;
                    let (algorithm, range) = match field.query {
                        None => (QeAlgorithm::Unindexed, None),
                        Some(QueryKind::Equality) => (QeAlgorithm::Equality, None),
                        Some(QueryKind::Range(ref spec)) => {
                            (QeAlgorithm::Range, Some(spec.clone()))
                        }
                    };
                    Marking::Insert {
                        algorithm,
                        key_id: field.key_id,
                        value: value.clone(),
                        contention: field.contention,
                        range,
                    }
                }
            };
            *value = Bson::Binary(marking.to_binary()?);
            return Ok(());
        }
        if !self.schema.encrypted_below(path) {
            return Ok(());
        }
        match value {
            Bson::Document(doc) => self.write(doc, path, root),
            Bson::Array(_) => Err(Error::encryption_field(
                "cannot encrypt fields below an array",
                path,
            )),
            _ => Ok(()),
        }
    }

    fn fle1_marking(
        &self,
        rule: &EncryptRule,
        path: &str,
        value: Bson,
        root: Option<&Document>,
    ) -> Result<Marking> {
        let declared: Vec<&str> = rule.bson_types.iter().map(String::as_str).collect();
        check_declared_type(path, &declared, &value)?;
        let key = match rule.key {
            KeyRef::Id(id) => EncryptKey::Id(id),
            KeyRef::Pointer(ref pointer) => {
                let root = root.ok_or_else(|| {
                    Error::encryption_field(
                        "cannot query a field whose key is given by a JSON pointer",
                        path,
                    )
                })?;
                match crate::bson_util::get_path(root, pointer) {
                    Some(Bson::String(name)) => EncryptKey::AltName(name.clone()),
                    _ => {
                        return Err(Error::encryption_field(
                            format!("key alt name pointer {pointer:?} must name a string field"),
                            path,
                        ))
                    }
                }
            }
        };
        Ok(Marking::Fle1 {
            algorithm: rule.algorithm,
            key,
            value,
        })
    }

    fn update(&mut self, statement: &mut Document, field: &str) -> Result<()> {
        match statement.get_mut(field) {
            None => Ok(()),
            Some(Bson::Array(_)) if self.schema.has_encrypted_fields() => Err(Error::encryption(
                "pipeline updates are not supported on a collection with encrypted fields",
            )),
            Some(Bson::Array(_)) => Ok(()),
            Some(Bson::Document(update)) => {
                if crate::bson_util::first_key(update).is_some_and(is_operator) {
                    self.update_operators(update)
                } else {
                    let root = update.clone();
                    self.write(update, "", &root)
                }
            }
            Some(_) => Err(Error::invalid_argument("update must be a document or pipeline")),
        }
    }

    fn update_operators(&mut self, update: &mut Document) -> Result<()> {
        for (op, fields) in update.iter_mut() {
            let Bson::Document(fields) = fields else {
                continue;
            };
            match op.as_str() {
                "$set" | "$setOnInsert" => {
                    let root = fields.clone();
                    for (path, value) in fields.iter_mut() {
                        if let Some(ancestor) = self.schema.encrypted_ancestor(path) {
                            return Err(Error::encryption_field(
                                format!("cannot update a field inside encrypted field {ancestor}"),
                                path,
                            ));
                        }
                        self.write_value(value, path, &root)?;
                    }
                }
                "$unset" => {}
                _ => {
                    if let Some(path) = fields.keys().find(|p| self.touches_encrypted(p)) {
                        return Err(Error::encryption_field(
                            format!("{op} is not allowed on an encrypted field"),
                            path,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn touches_encrypted(&self, path: &str) -> bool {
        self.schema.rule(path).is_some()
            || self.schema.encrypted_below(path)
            || self.schema.encrypted_ancestor(path).is_some()
    }

    // Queries

    fn query_field(&mut self, parent: &mut Document, key: &str) -> Result<()> {
        match parent.get_mut(key) {
            Some(Bson::Document(filter)) => self.query(filter, ""),
            _ => Ok(()),
        }
    }

    fn query(&mut self, filter: &mut Document, prefix: &str) -> Result<()> {
        for (key, value) in filter.iter_mut() {
            match key.as_str() {
                "$and" => self.conjunction(value, prefix)?,
                "$or" | "$nor" => {
                    for clause in clauses_mut(value)? {
                        self.query(clause, prefix)?;
                    }
                }
                "$expr" => self.check_expr(value)?,
                k if is_operator(k) => {}
                field => self.predicate(&join(prefix, field), value)?,
            }
        }
        Ok(())
    }

    /// `$and` clauses. Single range operators on the same field in different clauses form one
    /// range query.
    fn conjunction(&mut self, value: &mut Bson, prefix: &str) -> Result<()> {
        let schema = self.schema;
        let mut clauses = clauses_mut(value)?;
        let mut ranges: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, clause) in clauses.iter().enumerate() {
            if let Some((field, _)) = single_range_clause(clause) {
                let path = join(prefix, &field);
                if let Some(FieldRule::Qe(qe)) = schema.rule(&path) {
                    if matches!(qe.query, Some(QueryKind::Range(_))) {
                        ranges.entry(path).or_default().push(i);
                    }
                }
            }
        }

        let mut paired = Vec::new();
        for (path, indexes) in ranges {
            if indexes.len() < 2 {
                continue;
            }
            let Some(FieldRule::Qe(field)) = schema.rule(&path) else {
                continue;
            };
            let mut operands: Vec<(RangeOp, &mut Bson)> = Vec::new();
            for (i, clause) in clauses.iter_mut().enumerate() {
                if !indexes.contains(&i) {
                    continue;
                }
                for (_, ops) in clause.iter_mut() {
                    if let Bson::Document(ops) = ops {
                        for (op, operand) in ops.iter_mut() {
                            if let Some(op) = RangeOp::parse(op) {
                                operands.push((op, operand));
                            }
                        }
                    }
                }
            }
            self.mark_range(field, &path, operands)?;
            paired.extend(indexes);
        }

        for (i, clause) in clauses.into_iter().enumerate() {
            if !paired.contains(&i) {
                self.query(clause, prefix)?;
            }
        }
        Ok(())
    }

    fn check_expr(&self, expr: &Bson) -> Result<()> {
        if !self.schema.has_encrypted_fields() {
            return Ok(());
        }
        match expr {
            Bson::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
                if self.touches_encrypted(&s[1..]) {
                    return Err(Error::encryption_field(
                        "comparisons on encrypted fields are not supported inside $expr",
                        &s[1..],
                    ));
                }
                Ok(())
            }
            Bson::Document(doc) => doc.values().try_for_each(|v| self.check_expr(v)),
            Bson::Array(items) => items.iter().try_for_each(|v| self.check_expr(v)),
            _ => Ok(()),
        }
    }

    fn predicate(&mut self, path: &str, value: &mut Bson) -> Result<()> {
        if let Some(ancestor) = self.schema.encrypted_ancestor(path) {
            return Err(Error::encryption_field(
                format!("cannot query a field inside encrypted field {ancestor}"),
                path,
            ));
        }
        let schema = self.schema;
        let Some(rule) = schema.rule(path) else {
            return self.unencrypted_predicate(path, value);
        };
        let has_operators = matches!(
            value,
            Bson::Document(d) if d.keys().next().is_some_and(|k| is_operator(k))
        );
        match rule {
            FieldRule::Fle1(rule) if rule.algorithm == Algorithm::Random => Err(
                Error::encryption_field("cannot query a randomly encrypted field", path),
            ),
            FieldRule::Qe(QeField { query: None, .. }) => Err(Error::encryption_field(
                "cannot query an unindexed encrypted field",
                path,
            )),
            FieldRule::Qe(
                field @ QeField {
                    query: Some(QueryKind::Range(_)),
                    ..
                },
            ) => {
                let Bson::Document(ops) = value else {
                    return Err(Error::encryption_field(
                        "range fields only support $gt, $gte, $lt and $lte",
                        path,
                    ));
                };
                let mut operands = Vec::new();
                for (op, operand) in ops.iter_mut() {
                    match RangeOp::parse(op) {
                        Some(op) => operands.push((op, operand)),
                        None => {
                            return Err(Error::encryption_field(
                                format!("{op} is not supported on a range field"),
                                path,
                            ))
                        }
                    }
                }
                self.mark_range(field, path, operands)
            }
            rule if has_operators => {
                let Bson::Document(ops) = value else {
                    return Ok(());
                };
                for (op, operand) in ops.iter_mut() {
                    match op.as_str() {
                        "$eq" | "$ne" => *operand = self.equality_marking(rule, path, operand)?,
                        "$in" | "$nin" => {
                            let Bson::Array(items) = operand else {
                                return Err(Error::invalid_argument(format!(
                                    "{op} needs an array"
                                )));
                            };
                            for item in items {
                                *item = self.equality_marking(rule, path, item)?;
                            }
                        }
                        "$exists" => {}
                        other => {
                            return Err(Error::encryption_field(
                                format!("{other} is not supported on an encrypted field"),
                                path,
                            ))
                        }
                    }
                }
                Ok(())
            }
            rule => {
                *value = self.equality_marking(rule, path, value)?;
                Ok(())
            }
        }
    }

    fn unencrypted_predicate(&mut self, path: &str, value: &mut Bson) -> Result<()> {
        if !self.schema.encrypted_below(path) {
            return Ok(());
        }
        match value {
            Bson::Document(doc) if doc.keys().next().is_some_and(|k| is_operator(k)) => {
                match doc.keys().find(|k| k.as_str() == "$elemMatch" || k.as_str() == "$eq") {
                    Some(op) => Err(Error::encryption_field(
                        format!("{op} cannot compare a document holding encrypted fields"),
                        path,
                    )),
                    None => Ok(()),
                }
            }
            Bson::Document(_) | Bson::Array(_) => Err(Error::encryption_field(
                "cannot compare a value holding encrypted fields",
                path,
            )),
            _ => Ok(()),
        }
    }

    fn equality_marking(&self, rule: FieldRule<'_>, path: &str, value: &Bson) -> Result<Bson> {
        let marking = match rule {
            FieldRule::Fle1(rule) => self.fle1_marking(rule, path, value.clone(), None)?,
            FieldRule::Qe(field) => {
                check_declared_type(path, field.bson_type.as_deref().as_slice(), value)?;
                Marking::FindEquality {
                    key_id: field.key_id,
                    value: value.clone(),
                    contention: field.contention,
                }
            }
        };
        Ok(Bson::Binary(marking.to_binary()?))
    }

    /// Replaces one or two range operands with a full marking and, for the second, a stub that
    /// only names the operators.
    fn mark_range(
        &mut self,
        field: &QeField,
        path: &str,
        mut operands: Vec<(RangeOp, &mut Bson)>,
    ) -> Result<()> {
        let Some(QueryKind::Range(ref range)) = field.query else {
            return Err(Error::internal("range marking for a field without a range index"));
        };
        if operands.is_empty() || operands.len() > 2 {
            return Err(Error::encryption_field(
                "a range query has one lower and one upper bound at most",
                path,
            ));
        }
        let mut bounds = RangeBounds::default();
        for (op, operand) in &operands {
            if let Some(declared) = field.bson_type.as_deref() {
                check_declared_type(path, &[declared], operand)?;
            }
            bounds
                .add(*op, (**operand).clone())
                .map_err(|e| e.with_field(path))?;
        }
        let payload_id = self.next_payload_id;
        self.next_payload_id += 1;
        let first_operator = operands[0].0;
        let second_operator = operands.get(1).map(|(op, _)| *op);
        for (i, (_, operand)) in operands.iter_mut().enumerate() {
            let marking = Marking::FindRange {
                key_id: field.key_id,
                contention: field.contention,
                range: range.clone(),
                query: RangeQuery {
                    payload_id,
                    first_operator,
                    second_operator,
                    bounds: (i == 0).then(|| bounds.clone()),
                },
            };
            **operand = Bson::Binary(marking.to_binary()?);
        }
        Ok(())
    }
}

fn documents_mut<'a>(command: &'a mut Document, key: &str) -> Result<Vec<&'a mut Document>> {
    match command.get_mut(key) {
        Some(Bson::Array(items)) => items
            .iter_mut()
            .map(|item| match item {
                Bson::Document(doc) => Ok(doc),
                _ => Err(Error::invalid_argument(format!("{key} must hold documents"))),
            })
            .collect(),
        _ => Err(Error::invalid_argument(format!("command is missing {key}"))),
    }
}

fn clauses_mut(value: &mut Bson) -> Result<Vec<&mut Document>> {
    match value {
        Bson::Array(items) => items
            .iter_mut()
            .map(|item| match item {
                Bson::Document(doc) => Ok(doc),
                _ => Err(Error::invalid_argument("logical operator clauses must be documents")),
            })
            .collect(),
        _ => Err(Error::invalid_argument("logical operators take an array")),
    }
}

/// `{field: {$op: value}}` with a single range operator.
fn single_range_clause(clause: &Document) -> Option<(String, RangeOp)> {
    if clause.len() != 1 {
        return None;
    }
    let (field, ops) = clause.iter().next()?;
    if is_operator(field) {
        return None;
    }
    let Bson::Document(ops) = ops else {
        return None;
    };
    if ops.len() != 1 {
        return None;
    }
    let op = RangeOp::parse(ops.keys().next()?)?;
    Some((field.clone(), op))
}
