/*!
 * @file stages/windowing.rs
 * @brief $setWindowFields, $densify, $fill
 */

use crate::bson_order::cmp_bson;
use crate::datetime::{self, DateUnit};
use crate::error::{DocPipeError, Result};
use crate::expr::Variables;
use crate::partition::partition_indices;
use crate::sorter::{parse_sort_spec, sort_documents, SortKey};
use crate::stages::{DensifyOptions, DensifyRange, FillMethod, FillOptions, SetWindowFieldsOptions};
use crate::value::{self, get_path};
use crate::window::{self, parse_window};
use bson::{Bson, Document};

pub fn run_set_window_fields(docs: Vec<Document>, opts: &SetWindowFieldsOptions, vars_base: &Variables) -> Result<Vec<Document>> {
    let sort_keys: Vec<SortKey> = opts.sort_by.as_ref().map(|d| parse_sort_spec(d)).unwrap_or_default();
    let partitions = partition_indices(&docs, opts.partition_by.as_ref(), vars_base)?;

    let mut out = docs.clone();
    for partition in partitions {
        let mut part_docs: Vec<Document> = partition.iter().map(|&i| docs[i].clone()).collect();
        if !sort_keys.is_empty() {
            sort_documents(&mut part_docs, &sort_keys);
        }

        for spec in &opts.output {
            let window_spec = parse_window(spec.window.as_ref())?;
            let values = window::compute_window_field(&part_docs, &spec.operator, &spec.arg, &window_spec, &sort_keys, &Document::new(), vars_base)?;
            for (doc, value) in part_docs.iter_mut().zip(values) {
                value::set_path(doc, &spec.field, value);
            }
        }

        // Re-match each computed row back to its original position by `_id`
        // identity when present, falling back to partition order otherwise.
        for (offset, &orig_idx) in partition.iter().enumerate() {
            out[orig_idx] = part_docs[offset].clone();
        }
    }
    Ok(out)
}

pub fn run_densify(docs: Vec<Document>, opts: &DensifyOptions, vars_base: &Variables) -> Result<Vec<Document>> {
    let partition_by: Option<Bson> = if opts.partition_by_fields.is_empty() {
        None
    } else {
        let mut d = Document::new();
        for f in &opts.partition_by_fields {
            d.insert(f.clone(), Bson::String(format!("${f}")));
        }
        Some(Bson::Document(d))
    };
    let partitions = partition_indices(&docs, partition_by.as_ref(), vars_base)?;

    match &opts.unit {
        Some(raw_unit) => {
            let unit = DateUnit::parse(raw_unit)
                .ok_or_else(|| DocPipeError::pipeline("$densify", format!("unknown date unit '{raw_unit}'")))?;
            run_densify_dates(docs, opts, partitions, unit)
        }
        None => run_densify_numeric(docs, opts, partitions),
    }
}

fn run_densify_numeric(docs: Vec<Document>, opts: &DensifyOptions, partitions: Vec<Vec<usize>>) -> Result<Vec<Document>> {
    let global_bounds = if matches!(opts.range, DensifyRange::Full) {
        Some(numeric_bounds(&docs, &opts.field))
    } else {
        None
    };

    let mut out = Vec::new();
    for partition in partitions {
        let mut part_docs: Vec<Document> = partition.iter().map(|&i| docs[i].clone()).collect();
        part_docs.sort_by(|a, b| cmp_bson(&get_path(a, &opts.field).into_bson_or_null(), &get_path(b, &opts.field).into_bson_or_null()));

        let (lo, hi) = match &opts.range {
            DensifyRange::Bounds(lo, hi) => (as_f64(lo), as_f64(hi)),
            DensifyRange::Partition => numeric_bounds(&part_docs, &opts.field),
            DensifyRange::Full => global_bounds.unwrap(),
        };

        let existing: Vec<f64> = part_docs.iter().filter_map(|d| get_path(d, &opts.field).as_bson().and_then(as_f64_opt)).collect();
        let mut existing_set: Vec<f64> = existing.clone();
        existing_set.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let mut generated = Vec::new();
        let mut x = lo;
        while x <= hi + f64::EPSILON {
            if !existing_set.iter().any(|e| (e - x).abs() < 1e-9) {
                let mut template = if opts.partition_by_fields.is_empty() {
                    Document::new()
                } else {
                    value::pick_paths(part_docs.first().unwrap_or(&Document::new()), &opts.partition_by_fields)
                };
                value::set_path(&mut template, &opts.field, numeric_to_bson(x));
                generated.push(template);
            }
            x += opts.step;
        }

        let mut merged = part_docs;
        merged.extend(generated);
        merged.sort_by(|a, b| cmp_bson(&get_path(a, &opts.field).into_bson_or_null(), &get_path(b, &opts.field).into_bson_or_null()));
        out.extend(merged);
    }
    Ok(out)
}

fn run_densify_dates(docs: Vec<Document>, opts: &DensifyOptions, partitions: Vec<Vec<usize>>, unit: DateUnit) -> Result<Vec<Document>> {
    let global_bounds = if matches!(opts.range, DensifyRange::Full) {
        date_bounds(&docs, &opts.field)
    } else {
        None
    };
    let step_amount = opts.step as i64;

    let mut out = Vec::new();
    for partition in partitions {
        let mut part_docs: Vec<Document> = partition.iter().map(|&i| docs[i].clone()).collect();
        part_docs.sort_by(|a, b| cmp_bson(&get_path(a, &opts.field).into_bson_or_null(), &get_path(b, &opts.field).into_bson_or_null()));

        let bounds = match &opts.range {
            DensifyRange::Bounds(lo, hi) => Some((
                as_date(lo).ok_or_else(|| DocPipeError::pipeline("$densify", "'range.bounds' must hold dates when 'unit' is set"))?,
                as_date(hi).ok_or_else(|| DocPipeError::pipeline("$densify", "'range.bounds' must hold dates when 'unit' is set"))?,
            )),
            DensifyRange::Partition => date_bounds(&part_docs, &opts.field),
            DensifyRange::Full => global_bounds,
        };

        let Some((lo, hi)) = bounds else {
            out.extend(part_docs);
            continue;
        };

        let existing_millis: Vec<i64> = part_docs
            .iter()
            .filter_map(|d| get_path(d, &opts.field).as_bson().and_then(as_date))
            .map(|dt| dt.timestamp_millis())
            .collect();

        let mut generated = Vec::new();
        let mut current = lo;
        while current.timestamp_millis() <= hi.timestamp_millis() {
            if !existing_millis.iter().any(|&m| m == current.timestamp_millis()) {
                let mut template = if opts.partition_by_fields.is_empty() {
                    Document::new()
                } else {
                    value::pick_paths(part_docs.first().unwrap_or(&Document::new()), &opts.partition_by_fields)
                };
                value::set_path(&mut template, &opts.field, Bson::DateTime(current));
                generated.push(template);
            }
            let next = datetime::date_add(current, unit, step_amount);
            if next.timestamp_millis() <= current.timestamp_millis() {
                break;
            }
            current = next;
        }

        let mut merged = part_docs;
        merged.extend(generated);
        merged.sort_by(|a, b| cmp_bson(&get_path(a, &opts.field).into_bson_or_null(), &get_path(b, &opts.field).into_bson_or_null()));
        out.extend(merged);
    }
    Ok(out)
}

fn as_date(b: &Bson) -> Option<bson::DateTime> {
    match b {
        Bson::DateTime(dt) => Some(*dt),
        _ => None,
    }
}

fn date_bounds(docs: &[Document], field: &str) -> Option<(bson::DateTime, bson::DateTime)> {
    let values: Vec<bson::DateTime> = docs.iter().filter_map(|d| get_path(d, field).as_bson().and_then(as_date)).collect();
    if values.is_empty() {
        return None;
    }
    let lo = *values.iter().min_by_key(|dt| dt.timestamp_millis())?;
    let hi = *values.iter().max_by_key(|dt| dt.timestamp_millis())?;
    Some((lo, hi))
}

fn as_f64(b: &Bson) -> f64 {
    as_f64_opt(b).unwrap_or(0.0)
}

fn as_f64_opt(b: &Bson) -> Option<f64> {
    match b {
        Bson::Double(d) => Some(*d),
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

fn numeric_to_bson(f: f64) -> Bson {
    if f.fract() == 0.0 {
        Bson::Int64(f as i64)
    } else {
        Bson::Double(f)
    }
}

fn numeric_bounds(docs: &[Document], field: &str) -> (f64, f64) {
    let values: Vec<f64> = docs.iter().filter_map(|d| get_path(d, field).as_bson().and_then(as_f64_opt)).collect();
    let lo = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if lo.is_finite() && hi.is_finite() {
        (lo, hi)
    } else {
        (0.0, 0.0)
    }
}

pub fn run_fill(docs: Vec<Document>, opts: &FillOptions, vars_base: &Variables) -> Result<Vec<Document>> {
    let partition_by: Option<Bson> = if opts.partition_by_fields.is_empty() {
        None
    } else {
        let mut d = Document::new();
        for f in &opts.partition_by_fields {
            d.insert(f.clone(), Bson::String(format!("${f}")));
        }
        Some(Bson::Document(d))
    };
    let partitions = partition_indices(&docs, partition_by.as_ref(), vars_base)?;
    let sort_keys: Vec<SortKey> = opts.sort_by.as_ref().map(|d| parse_sort_spec(d)).unwrap_or_default();

    let mut out = docs.clone();
    for partition in partitions {
        let mut part_docs: Vec<Document> = partition.iter().map(|&i| docs[i].clone()).collect();
        if !sort_keys.is_empty() {
            sort_documents(&mut part_docs, &sort_keys);
        }

        for (field, method) in &opts.output {
            match method {
                FillMethod::Value(v) => {
                    for doc in part_docs.iter_mut() {
                        if get_path(doc, field).is_nullish() {
                            value::set_path(doc, field, v.clone());
                        }
                    }
                }
                FillMethod::Locf => {
                    let mut last: Option<Bson> = None;
                    for doc in part_docs.iter_mut() {
                        if get_path(doc, field).is_nullish() {
                            if let Some(l) = &last {
                                value::set_path(doc, field, l.clone());
                            }
                        } else if let crate::value::Value::Value(v) = get_path(doc, field) {
                            last = Some(v);
                        }
                    }
                }
                FillMethod::Linear => {
                    let sort_field = sort_keys.first().map(|k| k.path.clone());
                    fill_linear(&mut part_docs, field, sort_field.as_deref());
                }
            }
        }

        for (offset, &orig_idx) in partition.iter().enumerate() {
            out[orig_idx] = part_docs[offset].clone();
        }
    }
    Ok(out)
}

fn fill_linear(docs: &mut [Document], field: &str, sort_field: Option<&str>) {
    let x: Vec<f64> = match sort_field {
        Some(sf) => docs.iter().map(|d| get_path(d, sf).as_bson().and_then(as_f64_opt).unwrap_or(0.0)).collect(),
        None => (0..docs.len()).map(|i| i as f64).collect(),
    };
    let mut y: Vec<Option<f64>> = docs.iter().map(|d| get_path(d, field).as_bson().and_then(as_f64_opt)).collect();

    let n = y.len();
    let mut i = 0;
    while i < n {
        if y[i].is_none() {
            let mut j = i;
            while j < n && y[j].is_none() {
                j += 1;
            }
            if i > 0 && j < n {
                let (x0, y0) = (x[i - 1], y[i - 1].unwrap());
                let (x1, y1) = (x[j], y[j].unwrap());
                for k in i..j {
                    let t = if (x1 - x0).abs() > f64::EPSILON { (x[k] - x0) / (x1 - x0) } else { 0.0 };
                    y[k] = Some(y0 + t * (y1 - y0));
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }

    for (doc, value) in docs.iter_mut().zip(y) {
        if let Some(v) = value {
            value::set_path(doc, field, numeric_to_bson(v));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn vars() -> Variables {
        Variables::new(bson::DateTime::now(), Document::new())
    }

    #[test]
    fn densify_fills_numeric_gaps() {
        let docs = vec![doc! {"x": 0}, doc! {"x": 3}];
        let opts = DensifyOptions {
            field: "x".to_string(),
            partition_by_fields: vec![],
            range: DensifyRange::Full,
            step: 1.0,
            unit: None,
        };
        let result = run_densify(docs, &opts, &vars()).unwrap();
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn fill_locf_carries_last_value_forward() {
        let docs = vec![doc! {"x": 1, "v": 10}, doc! {"x": 2, "v": Bson::Null}, doc! {"x": 3, "v": Bson::Null}];
        let opts = FillOptions {
            partition_by_fields: vec![],
            sort_by: Some(doc! {"x": 1}),
            output: vec![("v".to_string(), FillMethod::Locf)],
        };
        let result = run_fill(docs, &opts, &vars()).unwrap();
        assert_eq!(result[1].get_i32("v").unwrap(), 10);
        assert_eq!(result[2].get_i32("v").unwrap(), 10);
    }

    #[test]
    fn densify_steps_across_calendar_days() {
        let day0 = bson::DateTime::from_millis(0);
        let day2 = bson::DateTime::from_millis(2 * 86_400_000);
        let docs = vec![
            doc! {"day": Bson::DateTime(day0)},
            doc! {"day": Bson::DateTime(day2)},
        ];
        let opts = DensifyOptions {
            field: "day".to_string(),
            partition_by_fields: vec![],
            range: DensifyRange::Full,
            step: 1.0,
            unit: Some("day".to_string()),
        };
        let result = run_densify(docs, &opts, &vars()).unwrap();
        assert_eq!(result.len(), 3);
    }
}
