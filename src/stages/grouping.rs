/*!
 * @file stages/grouping.rs
 * @brief $group, $sortByCount, $bucket, $bucketAuto
 */

use crate::accumulator::{Accumulator, AccumulatorKind};
use crate::bson_order::cmp_bson;
use crate::error::{DocPipeError, Result};
use crate::expr::{evaluate, Variables};
use crate::partition::{canonical_bytes, extract_key};
use crate::stages::{BucketAutoOptions, BucketOptions};
use bson::{Bson, Document};
use std::collections::HashMap;

pub fn run_group(docs: Vec<Document>, spec: &Document, vars_base: &Variables) -> Result<Vec<Document>> {
    let id_expr = spec.get("_id").ok_or_else(|| DocPipeError::pipeline("$group", "missing '_id'"))?;

    let field_specs: Vec<(String, String, Bson)> = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(k, v)| {
            let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$group", format!("'{k}' must be an accumulator document")))?;
            if d.len() != 1 {
                return Err(DocPipeError::pipeline("$group", format!("'{k}' must have exactly one accumulator operator")));
            }
            let (op, arg) = d.iter().next().unwrap();
            Ok((k.clone(), op.clone(), arg.clone()))
        })
        .collect::<Result<_>>()?;

    let mut order: Vec<Vec<u8>> = Vec::new();
    let mut groups: HashMap<Vec<u8>, (Bson, Vec<Accumulator>)> = HashMap::new();

    for doc in &docs {
        let key = extract_key(Some(id_expr), doc, vars_base)?;
        let bytes = canonical_bytes(&key);
        let entry = groups.entry(bytes.clone()).or_insert_with(|| {
            order.push(bytes.clone());
            let accs = field_specs
                .iter()
                .map(|(_, op, _)| AccumulatorKind::parse(op).map(Accumulator::new))
                .collect::<Option<Vec<_>>>()
                .unwrap_or_default();
            (key.clone(), accs)
        });

        for (i, (_, op, arg)) in field_specs.iter().enumerate() {
            if AccumulatorKind::parse(op).is_none() {
                return Err(DocPipeError::pipeline("$group", format!("unknown accumulator '{op}'")));
            }
            let input = evaluate(arg, doc, vars_base)?.into_bson_or_null();
            entry.1[i].accumulate(&input)?;
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|bytes| groups.remove(&bytes))
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((name, _, _), acc) in field_specs.iter().zip(accs.iter()) {
                out.insert(name.clone(), acc.finalize());
            }
            out
        })
        .collect())
}

pub fn run_sort_by_count(docs: Vec<Document>, expr: &Bson, vars_base: &Variables) -> Result<Vec<Document>> {
    let mut group_spec = Document::new();
    group_spec.insert("_id", expr.clone());
    group_spec.insert("count", bson::doc! { "$sum": 1 });
    let mut grouped = run_group(docs, &group_spec, vars_base)?;
    grouped.sort_by(|a, b| cmp_bson(b.get("count").unwrap(), a.get("count").unwrap()));
    Ok(grouped)
}

pub fn run_bucket(docs: Vec<Document>, opts: &BucketOptions, vars_base: &Variables) -> Result<Vec<Document>> {
    let mut boundaries = opts.boundaries.clone();
    boundaries.sort_by(cmp_bson);

    let mut buckets: Vec<(Bson, Vec<&Document>)> = boundaries
        .iter()
        .take(boundaries.len().saturating_sub(1))
        .cloned()
        .map(|b| (b, Vec::new()))
        .collect();
    let mut default_bucket: Vec<&Document> = Vec::new();

    for doc in &docs {
        let key = evaluate(&opts.group_by, doc, vars_base)?.into_bson_or_null();
        let mut placed = false;
        for i in 0..boundaries.len() - 1 {
            let lower_ok = cmp_bson(&key, &boundaries[i]) != std::cmp::Ordering::Less;
            let upper_ok = cmp_bson(&key, &boundaries[i + 1]) == std::cmp::Ordering::Less;
            if lower_ok && upper_ok {
                buckets[i].1.push(doc);
                placed = true;
                break;
            }
        }
        if !placed {
            match &opts.default {
                Some(_) => default_bucket.push(doc),
                None => return Err(DocPipeError::pipeline("$bucket", "value falls outside 'boundaries' and no 'default' was given")),
            }
        }
    }

    let mut out = Vec::new();
    for (id, members) in buckets {
        out.push(finalize_bucket(id, &members, opts.output.as_ref(), vars_base)?);
    }
    if let Some(default) = &opts.default {
        if !default_bucket.is_empty() {
            out.push(finalize_bucket(default.clone(), &default_bucket, opts.output.as_ref(), vars_base)?);
        }
    }
    Ok(out)
}

fn finalize_bucket(id: Bson, members: &[&Document], output: Option<&Document>, vars_base: &Variables) -> Result<Document> {
    let mut out = Document::new();
    out.insert("_id", id);
    match output {
        None => {
            out.insert("count", Bson::Int64(members.len() as i64));
        }
        Some(spec) => {
            for (name, acc_spec) in spec {
                let d = acc_spec.as_document().ok_or_else(|| DocPipeError::pipeline("$bucket", format!("'{name}' must be an accumulator document")))?;
                let (op, arg) = d.iter().next().ok_or_else(|| DocPipeError::pipeline("$bucket", format!("'{name}' has no operator")))?;
                let mut acc = Accumulator::new(
                    AccumulatorKind::parse(op).ok_or_else(|| DocPipeError::pipeline("$bucket", format!("unknown accumulator '{op}'")))?,
                );
                for doc in members {
                    acc.accumulate(&evaluate(arg, doc, vars_base)?.into_bson_or_null())?;
                }
                out.insert(name.clone(), acc.finalize());
            }
        }
    }
    Ok(out)
}

pub fn run_bucket_auto(docs: Vec<Document>, opts: &BucketAutoOptions, vars_base: &Variables) -> Result<Vec<Document>> {
    let mut keyed: Vec<(Bson, &Document)> = Vec::with_capacity(docs.len());
    for doc in &docs {
        keyed.push((evaluate(&opts.group_by, doc, vars_base)?.into_bson_or_null(), doc));
    }
    keyed.sort_by(|a, b| cmp_bson(&a.0, &b.0));

    let total = keyed.len();
    let bucket_count = (opts.buckets as usize).min(total.max(1));
    if bucket_count == 0 {
        return Ok(Vec::new());
    }
    let base_size = total / bucket_count;
    let remainder = total % bucket_count;

    let mut out = Vec::new();
    let mut idx = 0;
    for b in 0..bucket_count {
        let size = base_size + if b < remainder { 1 } else { 0 };
        if size == 0 {
            continue;
        }
        let slice = &keyed[idx..idx + size];
        idx += size;

        let min = slice.first().unwrap().0.clone();
        // Each bucket's max is the min of the next bucket (exclusive upper
        // bound), except the final bucket which is inclusive of its own max.
        let max = if idx < total { keyed[idx].0.clone() } else { slice.last().unwrap().0.clone() };

        let mut id = Document::new();
        id.insert("min", min);
        id.insert("max", max);
        let members: Vec<&Document> = slice.iter().map(|(_, d)| *d).collect();
        let mut row = finalize_bucket(Bson::Document(id), &members, opts.output.as_ref(), vars_base)?;
        if opts.output.is_none() {
            row.insert("count", Bson::Int64(members.len() as i64));
        }
        out.push(row);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn vars() -> Variables {
        Variables::new(bson::DateTime::now(), Document::new())
    }

    #[test]
    fn group_sums_per_key() {
        let docs = vec![doc! {"k": "a", "v": 1}, doc! {"k": "a", "v": 2}, doc! {"k": "b", "v": 5}];
        let spec = doc! {"_id": "$k", "total": {"$sum": "$v"}};
        let result = run_group(docs, &spec, &vars()).unwrap();
        assert_eq!(result.len(), 2);
        let a = result.iter().find(|d| d.get_str("_id").unwrap() == "a").unwrap();
        assert_eq!(a.get_i32("total").unwrap(), 3);
    }

    #[test]
    fn bucket_auto_splits_into_requested_count() {
        let docs = (1..=5).map(|n| doc! {"v": n}).collect();
        let opts = BucketAutoOptions { group_by: Bson::String("$v".into()), buckets: 2, output: None };
        let result = run_bucket_auto(docs, &opts, &vars()).unwrap();
        assert_eq!(result.len(), 2);
    }
}
