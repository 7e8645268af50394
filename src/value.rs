/*!
 * @file value.rs
 * @brief Value model and dot-path utilities (spec components 1-2)
 *
 * `Value` wraps `bson::Bson` with the two extra states the evaluator needs
 * that BSON itself has no room for: a field that is simply absent
 * (`Missing`, distinct from a present `null`), and the `$$REMOVE` marker an
 * expression can return to mean "omit this field from the projection".
 */

use bson::{Array, Bson, Document};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The referenced field or variable does not exist.
    Missing,
    /// `$$REMOVE` — an expression result meaning "omit this field".
    Remove,
    /// Any ordinary BSON value, including `Bson::Null`.
    Value(Bson),
}

impl Value {
    pub fn null() -> Self {
        Value::Value(Bson::Null)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, Value::Remove)
    }

    /// Missing and null collapse for most operators; this is that check.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Missing | Value::Value(Bson::Null))
    }

    pub fn as_bson(&self) -> Option<&Bson> {
        match self {
            Value::Value(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_bson(self) -> Option<Bson> {
        match self {
            Value::Value(b) => Some(b),
            _ => None,
        }
    }

    /// Converts to a `Bson`, mapping Missing/Remove to `Null` — used when a
    /// value must occupy an array slot, which cannot have "holes".
    pub fn into_bson_or_null(self) -> Bson {
        match self {
            Value::Value(b) => b,
            _ => Bson::Null,
        }
    }
}

impl From<Bson> for Value {
    fn from(b: Bson) -> Self {
        Value::Value(b)
    }
}

impl From<Option<Bson>> for Value {
    fn from(b: Option<Bson>) -> Self {
        match b {
            Some(b) => Value::Value(b),
            None => Value::Missing,
        }
    }
}

/// Reads a dot-path from a document, following MongoDB's implicit array
/// traversal: a numeric path segment indexes into an array, while a
/// non-numeric segment encountered at an array maps the remaining path
/// across every element and collects the non-missing results.
pub fn get_path(doc: &Document, path: &str) -> Value {
    get_path_bson(&Bson::Document(doc.clone()), path)
}

fn get_path_bson(value: &Bson, path: &str) -> Value {
    let mut segments = path.split('.');
    let first = match segments.next() {
        Some(s) => s,
        None => return Value::Missing,
    };
    let rest: Vec<&str> = segments.collect();
    descend(value, first, &rest)
}

fn descend(value: &Bson, segment: &str, rest: &[&str]) -> Value {
    let next_value = match value {
        Bson::Document(doc) => match doc.get(segment) {
            Some(v) => v.clone(),
            None => return Value::Missing,
        },
        Bson::Array(arr) => {
            if let Ok(idx) = segment.parse::<usize>() {
                match arr.get(idx) {
                    Some(v) => v.clone(),
                    None => return Value::Missing,
                }
            } else {
                // Map the remaining path across every element.
                let mut out = Vec::new();
                for elem in arr {
                    let v = descend(elem, segment, rest);
                    if let Value::Value(b) = v {
                        out.push(b);
                    }
                }
                return Value::Value(Bson::Array(out));
            }
        }
        _ => return Value::Missing,
    };

    if rest.is_empty() {
        Value::Value(next_value)
    } else {
        descend(&next_value, rest[0], &rest[1..])
    }
}

/// Writes a value at a dot-path, creating intermediate documents as needed.
/// Only descends through documents; an intermediate non-document/non-missing
/// value is overwritten with a fresh document (MongoDB's own `$set`
/// behavior when the path conflicts with a scalar).
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(doc, &segments, value);
}

fn set_segments(doc: &mut Document, segments: &[&str], value: Bson) {
    debug_assert!(!segments.is_empty());
    let (head, rest) = (segments[0], &segments[1..]);

    if rest.is_empty() {
        doc.insert(head, value);
        return;
    }

    let entry = doc.entry(head.to_string()).or_insert_with(|| Bson::Document(Document::new()));
    if !matches!(entry, Bson::Document(_)) {
        *entry = Bson::Document(Document::new());
    }
    if let Bson::Document(inner) = entry {
        set_segments(inner, rest, value);
    }
}

/// Deletes a dot-path, descending only through documents (never arrays),
/// per `$project` exclusion semantics.
pub fn delete_path(doc: &mut Document, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    delete_segments(doc, &segments);
}

fn delete_segments(doc: &mut Document, segments: &[&str]) {
    if segments.is_empty() {
        return;
    }
    let (head, rest) = (segments[0], &segments[1..]);
    if rest.is_empty() {
        doc.remove(head);
        return;
    }
    if let Some(Bson::Document(inner)) = doc.get_mut(head) {
        delete_segments(inner, rest);
    }
}

/// Builds a document from a flat list of dot-paths, used by `$densify`'s
/// partition-key passthrough and similar "copy just these fields" needs.
pub fn pick_paths(doc: &Document, paths: &[String]) -> Document {
    let mut out = Document::new();
    for path in paths {
        if let Value::Value(v) = get_path(doc, path) {
            set_path(&mut out, path, v);
        }
    }
    out
}

pub type BsonArray = Array;

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn reads_nested_field() {
        let d = doc! { "a": { "b": { "c": 7 } } };
        assert_eq!(get_path(&d, "a.b.c"), Value::Value(Bson::Int32(7)));
    }

    #[test]
    fn missing_field_is_missing_not_null() {
        let d = doc! { "a": 1 };
        assert_eq!(get_path(&d, "b"), Value::Missing);
    }

    #[test]
    fn numeric_segment_indexes_array() {
        let d = doc! { "a": [10, 20, 30] };
        assert_eq!(get_path(&d, "a.1"), Value::Value(Bson::Int32(20)));
    }

    #[test]
    fn non_numeric_segment_maps_over_array() {
        let d = doc! { "a": [ { "b": 1 }, { "b": 2 }, { "c": 3 } ] };
        assert_eq!(
            get_path(&d, "a.b"),
            Value::Value(Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]))
        );
    }

    #[test]
    fn set_path_creates_intermediate_documents() {
        let mut d = Document::new();
        set_path(&mut d, "a.b.c", Bson::Int32(5));
        assert_eq!(get_path(&d, "a.b.c"), Value::Value(Bson::Int32(5)));
    }

    #[test]
    fn delete_path_descends_through_objects_only() {
        let mut d = doc! { "a": [ { "b": 1 } ], "c": { "d": 1 } };
        delete_path(&mut d, "a.b");
        assert!(d.contains_key("a"));
        delete_path(&mut d, "c.d");
        assert_eq!(d.get_document("c").unwrap().len(), 0);
    }
}
