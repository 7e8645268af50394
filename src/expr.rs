/*!
 * @file expr.rs
 * @brief Expression evaluator (spec component 2)
 *
 * Walks an expression tree — a literal, a `$field` path, a `$$variable`
 * reference, an operator document, an array, or a literal sub-document —
 * and reduces it to a `Value` against a current document and variable
 * environment.
 */

use crate::error::Result;
use crate::value::{get_path, Value};
use bson::{Bson, DateTime as BsonDateTime, Document};
use std::collections::HashMap;

/// The variable environment an expression sees: the pipeline-wide `NOW`,
/// the `ROOT`/`CURRENT` documents, and any `$let`- or accumulator-bound
/// names layered on top.
#[derive(Debug, Clone)]
pub struct Variables {
    pub now: BsonDateTime,
    pub root: Document,
    pub bindings: HashMap<String, Value>,
}

impl Variables {
    pub fn new(now: BsonDateTime, root: Document) -> Self {
        Self {
            now,
            root,
            bindings: HashMap::new(),
        }
    }

    pub fn with_binding(&self, name: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        next.bindings.insert(name.into(), value);
        next
    }

    /// Resolves a `$$name` reference. An undefined name is *missing*, not an
    /// error — mirroring how an ordinary absent field path behaves.
    fn lookup(&self, name: &str, current: &Document) -> Value {
        match name {
            "NOW" | "CLUSTER_TIME" => Value::Value(Bson::DateTime(self.now)),
            "ROOT" => Value::Value(Bson::Document(self.root.clone())),
            "CURRENT" => Value::Value(Bson::Document(current.clone())),
            "REMOVE" => Value::Remove,
            // $redact sentinels: system variables that evaluate to themselves.
            "PRUNE" => Value::Value(Bson::String("$$PRUNE".to_string())),
            "KEEP" => Value::Value(Bson::String("$$KEEP".to_string())),
            "DESCEND" => Value::Value(Bson::String("$$DESCEND".to_string())),
            "" => Value::Value(Bson::Document(current.clone())),
            _ => self.bindings.get(name).cloned().unwrap_or(Value::Missing),
        }
    }
}

/// Evaluates an expression against `doc` (the `CURRENT` document at this
/// point in the pipeline — usually, but not always, the same as
/// `vars.root`).
pub fn evaluate(expr: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    match expr {
        Bson::String(s) => evaluate_string(s, doc, vars),
        Bson::Document(d) => evaluate_document(d, doc, vars),
        Bson::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate(item, doc, vars)?.into_bson_or_null());
            }
            Ok(Value::Value(Bson::Array(out)))
        }
        other => Ok(Value::Value(other.clone())),
    }
}

fn evaluate_string(s: &str, doc: &Document, vars: &Variables) -> Result<Value> {
    if let Some(path) = s.strip_prefix("$$") {
        let (name, rest) = split_first_segment(path);
        let base = vars.lookup(name, doc);
        if rest.is_empty() {
            return Ok(base);
        }
        match base {
            Value::Value(Bson::Document(d)) => Ok(get_path(&d, rest)),
            Value::Missing | Value::Remove => Ok(Value::Missing),
            _ => Ok(Value::Missing),
        }
    } else if let Some(path) = s.strip_prefix('$') {
        Ok(get_path(doc, path))
    } else {
        Ok(Value::Value(Bson::String(s.to_string())))
    }
}

fn split_first_segment(path: &str) -> (&str, &str) {
    match path.find('.') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (path, ""),
    }
}

fn evaluate_document(d: &Document, doc: &Document, vars: &Variables) -> Result<Value> {
    if d.len() == 1 {
        let (key, value) = d.iter().next().unwrap();
        if key == "$literal" {
            return Ok(Value::Value(value.clone()));
        }
        if key.starts_with('$') {
            return crate::operators::apply(key, value, doc, vars);
        }
    }

    let mut out = Document::new();
    for (key, value) in d {
        match evaluate(value, doc, vars)? {
            Value::Remove | Value::Missing => continue,
            Value::Value(b) => {
                out.insert(key.clone(), b);
            }
        }
    }
    Ok(Value::Value(Bson::Document(out)))
}

/// Evaluates an expression and collapses missing/remove to `Bson::Null`,
/// for call sites (array elements, accumulator inputs) that can't carry
/// an absent value.
pub fn evaluate_or_null(expr: &Bson, doc: &Document, vars: &Variables) -> Result<Bson> {
    Ok(evaluate(expr, doc, vars)?.into_bson_or_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn vars() -> Variables {
        Variables::new(BsonDateTime::now(), Document::new())
    }

    #[test]
    fn field_path_reads_current_document() {
        let d = doc! { "a": 5 };
        let v = evaluate(&Bson::String("$a".into()), &d, &vars()).unwrap();
        assert_eq!(v, Value::Value(Bson::Int32(5)));
    }

    #[test]
    fn literal_blocks_dollar_interpretation() {
        let d = Document::new();
        let expr = doc! { "$literal": "$notAField" };
        let v = evaluate(&Bson::Document(expr), &d, &vars()).unwrap();
        assert_eq!(v, Value::Value(Bson::String("$notAField".into())));
    }

    #[test]
    fn remove_variable_propagates() {
        let d = Document::new();
        let v = evaluate(&Bson::String("$$REMOVE".into()), &d, &vars()).unwrap();
        assert!(v.is_remove());
    }

    #[test]
    fn current_variable_with_subpath() {
        let d = doc! { "a": { "b": 9 } };
        let v = evaluate(&Bson::String("$$CURRENT.a.b".into()), &d, &vars()).unwrap();
        assert_eq!(v, Value::Value(Bson::Int32(9)));
    }

    #[test]
    fn undefined_variable_is_missing_not_an_error() {
        let d = Document::new();
        let v = evaluate(&Bson::String("$$notBound".into()), &d, &vars()).unwrap();
        assert!(v.is_missing());
    }
}
