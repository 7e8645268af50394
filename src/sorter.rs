/*!
 * @file sorter.rs
 * @brief Stable multi-field sort used by `$sort` and window partitioning
 */

use crate::bson_order::cmp_bson;
use crate::value::get_path;
use bson::Document;
use std::cmp::Ordering;

/// One sort key: a dot-path and a direction (`true` = ascending).
#[derive(Debug, Clone)]
pub struct SortKey {
    pub path: String,
    pub ascending: bool,
}

pub fn parse_sort_spec(spec: &Document) -> Vec<SortKey> {
    spec.iter()
        .map(|(k, v)| SortKey {
            path: k.clone(),
            ascending: is_ascending(v),
        })
        .collect()
}

fn is_ascending(v: &bson::Bson) -> bool {
    match v {
        bson::Bson::Int32(n) => *n >= 0,
        bson::Bson::Int64(n) => *n >= 0,
        bson::Bson::Double(n) => *n >= 0.0,
        _ => true,
    }
}

/// Sorts documents in place by the given keys. Missing fields sort as if
/// `null`, matching the engine's type-order rule (`null` is the lowest
/// rank other than nothing).
pub fn sort_documents(docs: &mut [Document], keys: &[SortKey]) {
    docs.sort_by(|a, b| compare_by_keys(a, b, keys));
}

pub fn compare_by_keys(a: &Document, b: &Document, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let va = get_path(a, &key.path).into_bson_or_null();
        let vb = get_path(b, &key.path).into_bson_or_null();
        let ord = cmp_bson(&va, &vb);
        let ord = if key.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn sorts_ascending_then_stable() {
        let mut docs = vec![doc! {"a": 2}, doc! {"a": 1}, doc! {"a": 1, "b": 1}];
        let keys = vec![SortKey { path: "a".to_string(), ascending: true }];
        sort_documents(&mut docs, &keys);
        assert_eq!(docs[0].get_i32("a").unwrap(), 1);
        assert_eq!(docs[1].get_i32("a").unwrap(), 1);
        assert_eq!(docs[2].get_i32("a").unwrap(), 2);
    }

    #[test]
    fn descending_reverses_order() {
        let mut docs = vec![doc! {"a": 1}, doc! {"a": 3}, doc! {"a": 2}];
        let keys = vec![SortKey { path: "a".to_string(), ascending: false }];
        sort_documents(&mut docs, &keys);
        assert_eq!(docs[0].get_i32("a").unwrap(), 3);
        assert_eq!(docs[2].get_i32("a").unwrap(), 1);
    }
}
