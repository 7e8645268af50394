/*!
 * @file partition.rs
 * @brief Partition key extraction and canonical serialization
 *
 * `$group`, `$setWindowFields`, and `$bucketAuto` all need to bucket
 * documents by a key that may be a single field, a compound object
 * expression, or absent entirely. The canonical byte form below exists so
 * a `HashMap<Vec<u8>, _>` can be used for grouping without losing the
 * distinction between BSON types that compare equal under naive string
 * conversion (`1` vs `"1"`).
 */

use crate::expr::{evaluate, Variables};
use crate::value::Value;
use bson::{Bson, Document};
use std::collections::HashMap;

/// Computes the grouping key expression (`_id` for `$group`, `partitionBy`
/// for `$setWindowFields`) against one document.
pub fn extract_key(key_expr: Option<&Bson>, doc: &Document, vars: &Variables) -> crate::error::Result<Bson> {
    match key_expr {
        None => Ok(Bson::Null),
        Some(expr) => Ok(evaluate(expr, doc, vars)?.into_bson_or_null()),
    }
}

/// Type-tagged byte encoding so the same textual value under different
/// BSON types never collides, and so keys can be used in a `HashMap`
/// (BSON itself isn't `Hash`/`Eq` in the general case).
pub fn canonical_bytes(b: &Bson) -> Vec<u8> {
    let mut out = Vec::new();
    encode(b, &mut out);
    out
}

fn encode(b: &Bson, out: &mut Vec<u8>) {
    match b {
        Bson::Null | Bson::Undefined => out.push(0),
        Bson::Boolean(v) => {
            out.push(1);
            out.push(*v as u8);
        }
        Bson::Int32(v) => {
            out.push(2);
            out.extend_from_slice(&(*v as f64).to_bits().to_be_bytes());
        }
        Bson::Int64(v) => {
            out.push(2);
            out.extend_from_slice(&(*v as f64).to_bits().to_be_bytes());
        }
        Bson::Double(v) => {
            out.push(2);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Bson::String(s) => {
            out.push(3);
            out.extend_from_slice(s.as_bytes());
        }
        Bson::Document(doc) => {
            out.push(4);
            for (k, v) in doc {
                out.extend_from_slice(k.as_bytes());
                out.push(b':');
                encode(v, out);
                out.push(b';');
            }
        }
        Bson::Array(arr) => {
            out.push(5);
            for v in arr {
                encode(v, out);
                out.push(b',');
            }
        }
        Bson::DateTime(dt) => {
            out.push(6);
            out.extend_from_slice(&dt.timestamp_millis().to_be_bytes());
        }
        Bson::ObjectId(oid) => {
            out.push(7);
            out.extend_from_slice(&oid.bytes());
        }
        other => {
            out.push(255);
            out.extend_from_slice(format!("{other:?}").as_bytes());
        }
    }
}

/// Groups documents by key, preserving first-seen key order (the order
/// `$group`/`$bucketAuto` are expected to have no particular output order
/// for, but a deterministic one helps tests and snapshotting alike).
pub fn group_by_key<'a>(
    docs: &'a [Document],
    key_expr: Option<&Bson>,
    vars: &Variables,
) -> crate::error::Result<Vec<(Bson, Vec<&'a Document>)>> {
    let mut order: Vec<Vec<u8>> = Vec::new();
    let mut groups: HashMap<Vec<u8>, (Bson, Vec<&'a Document>)> = HashMap::new();

    for doc in docs {
        let key = extract_key(key_expr, doc, vars)?;
        let bytes = canonical_bytes(&key);
        groups
            .entry(bytes.clone())
            .or_insert_with(|| {
                order.push(bytes.clone());
                (key.clone(), Vec::new())
            })
            .1
            .push(doc);
    }

    Ok(order
        .into_iter()
        .filter_map(|bytes| groups.remove(&bytes))
        .collect())
}

/// Partitions documents by a list of field paths (the `$setWindowFields`/
/// `$densify` "partitionByFields" form), returning a map from canonical
/// key bytes to the matching rows' indices, in stable relative order.
pub fn partition_indices(docs: &[Document], partition_by: Option<&Bson>, vars: &Variables) -> crate::error::Result<Vec<Vec<usize>>> {
    let mut order: Vec<Vec<u8>> = Vec::new();
    let mut groups: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();

    for (i, doc) in docs.iter().enumerate() {
        let key: Value = match partition_by {
            None => Value::null(),
            Some(expr) => evaluate(expr, doc, vars)?,
        };
        let bytes = canonical_bytes(&key.into_bson_or_null());
        groups.entry(bytes.clone()).or_insert_with(|| {
            order.push(bytes.clone());
            Vec::new()
        }).push(i);
    }

    Ok(order.into_iter().filter_map(|b| groups.remove(&b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_and_string_keys_dont_collide() {
        let a = canonical_bytes(&Bson::Int32(1));
        let b = canonical_bytes(&Bson::String("1".to_string()));
        assert_ne!(a, b);
    }

    #[test]
    fn int32_and_int64_same_value_collide() {
        let a = canonical_bytes(&Bson::Int32(7));
        let b = canonical_bytes(&Bson::Int64(7));
        assert_eq!(a, b);
    }
}
