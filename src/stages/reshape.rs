/*!
 * @file stages/reshape.rs
 * @brief Per-document reshaping stages: $match, $project, $set/$addFields,
 * $unset, $replaceRoot/$replaceWith, $redact, $unwind
 */

use crate::bson_order::truthy;
use crate::collection::FilterMatcher;
use crate::error::{DocPipeError, Result};
use crate::expr::{evaluate, Variables};
use crate::value::{self, Value};
use bson::{Bson, Document};

pub fn run_match(docs: Vec<Document>, filter: &Document, matcher: &dyn FilterMatcher) -> Result<Vec<Document>> {
    docs.into_iter()
        .map(|d| Ok((matcher.matches(filter, &d)?, d)))
        .collect::<Result<Vec<(bool, Document)>>>()
        .map(|v| v.into_iter().filter(|(keep, _)| *keep).map(|(_, d)| d).collect())
}

/// `true` for an inclusion spec (`{field: 1}`), `false` for exclusion
/// (`{field: 0}`). Mixed specs are rejected, except that `_id` may always
/// be excluded from an otherwise-inclusion spec.
fn is_inclusion(spec: &Document) -> Result<bool> {
    let mut saw_inclusion = false;
    let mut saw_exclusion = false;
    for (key, value) in spec {
        let is_computed = matches!(value, Bson::Document(_) | Bson::Array(_));
        if is_computed {
            saw_inclusion = true;
            continue;
        }
        let truthy_flag = truthy(value);
        if key == "_id" && !truthy_flag {
            continue;
        }
        if truthy_flag {
            saw_inclusion = true;
        } else {
            saw_exclusion = true;
        }
    }
    if saw_inclusion && saw_exclusion {
        return Err(DocPipeError::pipeline("$project", "cannot mix inclusion and exclusion (other than excluding _id)"));
    }
    Ok(!saw_exclusion || saw_inclusion)
}

pub fn run_project(docs: Vec<Document>, spec: &Document, vars_base: &Variables) -> Result<Vec<Document>> {
    let inclusion = is_inclusion(spec)?;
    docs.into_iter().map(|doc| project_one(&doc, spec, inclusion, vars_base)).collect()
}

fn project_one(doc: &Document, spec: &Document, inclusion: bool, vars_base: &Variables) -> Result<Document> {
    let vars = Variables { root: doc.clone(), ..vars_base.clone() };

    if inclusion {
        let mut out = Document::new();
        let exclude_id = matches!(spec.get("_id"), Some(v) if !truthy(v)) && !matches!(spec.get("_id"), Some(Bson::Document(_)));
        if !exclude_id {
            if let Value::Value(id) = value::get_path(doc, "_id") {
                out.insert("_id", id);
            }
        }
        for (key, value_spec) in spec {
            if key == "_id" {
                continue;
            }
            let computed = match value_spec {
                Bson::Boolean(true) | Bson::Int32(1) | Bson::Int64(1) | Bson::Double(_) => value::get_path(doc, key),
                other => evaluate(other, doc, &vars)?,
            };
            match computed {
                Value::Value(b) => value::set_path(&mut out, key, b),
                Value::Missing | Value::Remove => {}
            }
        }
        Ok(out)
    } else {
        let mut out = doc.clone();
        for (key, value_spec) in spec {
            if !truthy(value_spec) {
                value::delete_path(&mut out, key);
            }
        }
        Ok(out)
    }
}

pub fn run_set(docs: Vec<Document>, spec: &Document, vars_base: &Variables) -> Result<Vec<Document>> {
    docs.into_iter()
        .map(|doc| {
            let vars = Variables { root: doc.clone(), ..vars_base.clone() };
            let mut out = doc.clone();
            for (key, expr) in spec {
                match evaluate(expr, &doc, &vars)? {
                    Value::Value(b) => value::set_path(&mut out, key, b),
                    Value::Remove => value::delete_path(&mut out, key),
                    Value::Missing => {}
                }
            }
            Ok(out)
        })
        .collect()
}

pub fn run_unset(docs: Vec<Document>, fields: &[String]) -> Vec<Document> {
    docs.into_iter()
        .map(|mut doc| {
            for field in fields {
                value::delete_path(&mut doc, field);
            }
            doc
        })
        .collect()
}

pub fn run_replace_root(docs: Vec<Document>, new_root_expr: &Bson, vars_base: &Variables) -> Result<Vec<Document>> {
    docs.into_iter()
        .map(|doc| {
            let vars = Variables { root: doc.clone(), ..vars_base.clone() };
            match evaluate(new_root_expr, &doc, &vars)?.into_bson_or_null() {
                Bson::Document(d) => Ok(d),
                other => Err(DocPipeError::type_error("$replaceRoot", format!("'newRoot' expression must evaluate to a document, got {other:?}"))),
            }
        })
        .collect()
}

pub fn run_redact(docs: Vec<Document>, expr: &Bson, vars_base: &Variables) -> Result<Vec<Document>> {
    docs.into_iter().map(|doc| redact_document(&doc, expr, vars_base)).collect()
}

fn redact_document(doc: &Document, expr: &Bson, vars_base: &Variables) -> Result<Document> {
    redact_inner(doc, doc, expr, vars_base).map(|opt| opt.unwrap_or_default())
}

fn redact_inner(current: &Document, root: &Document, expr: &Bson, vars_base: &Variables) -> Result<Option<Document>> {
    let vars = Variables { root: root.clone(), ..vars_base.clone() };
    let verdict = evaluate(expr, current, &vars)?;
    let verdict_str = match verdict.as_bson() {
        Some(Bson::String(s)) => s.clone(),
        _ => return Err(DocPipeError::operator("$redact", "expression must evaluate to $$DESCEND, $$PRUNE, or $$KEEP")),
    };

    match verdict_str.as_str() {
        "$$PRUNE" => Ok(None),
        "$$KEEP" => Ok(Some(current.clone())),
        "$$DESCEND" => {
            let mut out = Document::new();
            for (key, value) in current {
                match value {
                    Bson::Document(sub) => {
                        if let Some(kept) = redact_inner(sub, root, expr, vars_base)? {
                            out.insert(key.clone(), Bson::Document(kept));
                        }
                    }
                    Bson::Array(arr) => {
                        let mut kept_arr = Vec::new();
                        for item in arr {
                            if let Bson::Document(sub) = item {
                                if let Some(kept) = redact_inner(sub, root, expr, vars_base)? {
                                    kept_arr.push(Bson::Document(kept));
                                }
                            } else {
                                kept_arr.push(item.clone());
                            }
                        }
                        out.insert(key.clone(), Bson::Array(kept_arr));
                    }
                    other => {
                        out.insert(key.clone(), other.clone());
                    }
                }
            }
            Ok(Some(out))
        }
        other => Err(DocPipeError::operator("$redact", format!("unrecognized redact verdict '{other}'"))),
    }
}

pub fn run_unwind(
    docs: Vec<Document>,
    path: &str,
    include_array_index: Option<&str>,
    preserve_null_and_empty: bool,
) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    for doc in docs {
        match value::get_path(&doc, path) {
            Value::Value(Bson::Array(items)) => {
                if items.is_empty() {
                    if preserve_null_and_empty {
                        out.push(strip_index(doc.clone(), path, include_array_index));
                    }
                    continue;
                }
                for (i, item) in items.into_iter().enumerate() {
                    let mut clone = doc.clone();
                    value::set_path(&mut clone, path, item);
                    if let Some(idx_field) = include_array_index {
                        value::set_path(&mut clone, idx_field, Bson::Int64(i as i64));
                    }
                    out.push(clone);
                }
            }
            Value::Value(Bson::Null) | Value::Missing => {
                if preserve_null_and_empty {
                    out.push(strip_index(doc, path, include_array_index));
                }
            }
            Value::Value(other) => {
                // A non-array, non-nullish value unwinds to itself, per
                // this engine's $unwind contract.
                let mut clone = doc.clone();
                value::set_path(&mut clone, path, other);
                out.push(clone);
            }
            Value::Remove => {}
        }
    }
    Ok(out)
}

fn strip_index(mut doc: Document, path: &str, include_array_index: Option<&str>) -> Document {
    if let Some(idx_field) = include_array_index {
        value::set_path(&mut doc, idx_field, Bson::Null);
    }
    let _ = path;
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SimpleEqualityMatcher;
    use bson::doc;

    fn vars() -> Variables {
        Variables::new(bson::DateTime::now(), Document::new())
    }

    #[test]
    fn match_filters_by_equality() {
        let docs = vec![doc! {"a": 1}, doc! {"a": 2}];
        let matcher = SimpleEqualityMatcher;
        let result = run_match(docs, &doc! {"a": 1}, &matcher).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn project_inclusion_keeps_only_listed_fields_plus_id() {
        let docs = vec![doc! {"_id": 1, "a": 2, "b": 3}];
        let result = run_project(docs, &doc! {"a": 1}, &vars()).unwrap();
        assert_eq!(result[0], doc! {"_id": 1, "a": 2});
    }

    #[test]
    fn unwind_expands_array_elements() {
        let docs = vec![doc! {"a": [1, 2, 3]}];
        let result = run_unwind(docs, "a", None, false).unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn unwind_preserves_empty_when_requested() {
        let docs = vec![doc! {"a": []}];
        let result = run_unwind(docs, "a", None, true).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn redact_prunes_restricted_subdocuments() {
        let docs = vec![doc! {"a": 1, "secret": {"level": "classified", "v": 2}}];
        let expr = doc! {
            "$cond": {
                "if": { "$eq": ["$level", "classified"] },
                "then": "$$PRUNE",
                "else": "$$DESCEND",
            }
        };
        let result = run_redact(docs, &Bson::Document(expr), &vars()).unwrap();
        assert!(!result[0].contains_key("secret"));
    }
}
