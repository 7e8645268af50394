/*!
 * @file window.rs
 * @brief Window engine for `$setWindowFields`
 *
 * Operates on one partition at a time, already sorted by the partition's
 * `sortBy`. For each output field, resolves the requested frame bound
 * (`documents` or `range`) per row and evaluates the requested operator
 * over that frame.
 */

use crate::accumulator::{Accumulator, AccumulatorKind};
use crate::bson_order::cmp_bson;
use crate::datetime::{self, DateUnit};
use crate::error::{DocPipeError, Result};
use crate::expr::{evaluate, Variables};
use crate::sorter::SortKey;
use crate::value::get_path;
use bson::{Bson, Document};
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub enum Bound {
    Unbounded,
    Current,
    Offset(i64),
}

impl Bound {
    fn parse(v: &Bson) -> Result<Self> {
        match v {
            Bson::String(s) if s == "unbounded" => Ok(Bound::Unbounded),
            Bson::String(s) if s == "current" => Ok(Bound::Current),
            Bson::Int32(n) => Ok(Bound::Offset(*n as i64)),
            Bson::Int64(n) => Ok(Bound::Offset(*n)),
            _ => Err(DocPipeError::operator("$setWindowFields", "invalid window bound")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WindowSpec {
    Documents(Bound, Bound),
    Range(Bound, Bound, Option<DateUnit>),
    None,
}

pub fn parse_window(spec: Option<&Document>) -> Result<WindowSpec> {
    let spec = match spec {
        None => return Ok(WindowSpec::None),
        Some(s) => s,
    };
    if let Ok(arr) = spec.get_array("documents") {
        if arr.len() != 2 {
            return Err(DocPipeError::operator("$setWindowFields", "'documents' window requires two bounds"));
        }
        return Ok(WindowSpec::Documents(Bound::parse(&arr[0])?, Bound::parse(&arr[1])?));
    }
    if let Ok(arr) = spec.get_array("range") {
        if arr.len() != 2 {
            return Err(DocPipeError::operator("$setWindowFields", "'range' window requires two bounds"));
        }
        let unit = match spec.get_str("unit") {
            Ok(s) => Some(DateUnit::parse(s).ok_or_else(|| DocPipeError::operator("$setWindowFields", "unknown range unit"))?),
            Err(_) => None,
        };
        return Ok(WindowSpec::Range(Bound::parse(&arr[0])?, Bound::parse(&arr[1])?, unit));
    }
    Ok(WindowSpec::None)
}

/// Resolves the inclusive `[start, end]` row-index frame for row `idx`
/// within a partition of length `len`, given its sort key values.
fn resolve_frame(idx: usize, len: usize, spec: &WindowSpec, sort_values: &[Bson]) -> (usize, usize) {
    match spec {
        WindowSpec::None => (0, len.saturating_sub(1)),
        WindowSpec::Documents(lower, upper) => {
            let start = match lower {
                Bound::Unbounded => 0,
                Bound::Current => idx,
                Bound::Offset(n) => ((idx as i64) + n).clamp(0, len as i64 - 1) as usize,
            };
            let end = match upper {
                Bound::Unbounded => len.saturating_sub(1),
                Bound::Current => idx,
                Bound::Offset(n) => ((idx as i64) + n).clamp(0, len as i64 - 1) as usize,
            };
            if start > end {
                (idx, idx)
            } else {
                (start, end)
            }
        }
        WindowSpec::Range(lower, upper, unit) => {
            let anchor = sort_values.get(idx).cloned().unwrap_or(Bson::Null);
            let within = |other: &Bson, bound: &Bound, is_lower: bool| -> bool {
                match bound {
                    Bound::Unbounded => true,
                    Bound::Current => {
                        let ord = cmp_bson(other, &anchor);
                        if is_lower {
                            ord != Ordering::Less
                        } else {
                            ord != Ordering::Greater
                        }
                    }
                    Bound::Offset(n) => {
                        let target = range_target(&anchor, *n, *unit);
                        let ord = cmp_bson(other, &target);
                        if is_lower {
                            ord != Ordering::Less
                        } else {
                            ord != Ordering::Greater
                        }
                    }
                }
            };
            let mut start = idx;
            while start > 0 && within(&sort_values[start - 1], lower, true) {
                start -= 1;
            }
            let mut end = idx;
            while end + 1 < len && within(&sort_values[end + 1], upper, false) {
                end += 1;
            }
            (start, end)
        }
    }
}

fn range_target(anchor: &Bson, offset: i64, unit: Option<DateUnit>) -> Bson {
    match (anchor, unit) {
        (Bson::DateTime(dt), Some(u)) => Bson::DateTime(datetime::date_add(*dt, u, offset)),
        (Bson::Int32(n), _) => Bson::Int64(*n as i64 + offset),
        (Bson::Int64(n), _) => Bson::Int64(*n + offset),
        (Bson::Double(n), _) => Bson::Double(*n + offset as f64),
        (other, _) => other.clone(),
    }
}

/// Computes one window output field across an already-sorted partition.
pub fn compute_window_field(
    docs: &[Document],
    op: &str,
    arg: &Bson,
    window: &WindowSpec,
    sort_keys: &[SortKey],
    doc: &Document,
    vars: &Variables,
) -> Result<Vec<Bson>> {
    let len = docs.len();
    let sort_values: Vec<Bson> = sort_keys
        .first()
        .map(|k| docs.iter().map(|d| get_path(d, &k.path).into_bson_or_null()).collect())
        .unwrap_or_default();

    match op {
        "$rank" => Ok(rank(docs, sort_keys, false)),
        "$denseRank" => Ok(rank(docs, sort_keys, true)),
        "$documentNumber" => Ok((1..=len as i64).map(Bson::Int64).collect()),
        "$shift" => shift(docs, arg, doc, vars),
        "$locf" => locf(docs, arg, vars),
        "$linearFill" => linear_fill(docs, arg, &sort_values, vars),
        "$derivative" => derivative(docs, arg, window, &sort_values, vars),
        "$integral" => integral(docs, arg, window, &sort_values, vars),
        "$expMovingAvg" => exp_moving_avg(docs, arg, vars),
        _ => accumulate_over_frames(docs, op, arg, window, &sort_values, vars),
    }
}

fn rank(docs: &[Document], sort_keys: &[SortKey], dense: bool) -> Vec<Bson> {
    let mut out = Vec::with_capacity(docs.len());
    let mut current_rank: i64 = 0;
    let mut seen = 0i64;
    let mut prev: Option<&Document> = None;
    for d in docs {
        seen += 1;
        let tied = prev.map(|p| crate::sorter::compare_by_keys(p, d, sort_keys) == Ordering::Equal).unwrap_or(false);
        if !tied {
            current_rank = if dense { current_rank + 1 } else { seen };
        }
        out.push(Bson::Int64(current_rank));
        prev = Some(d);
    }
    out
}

fn shift(docs: &[Document], arg: &Bson, doc_unused: &Document, vars: &Variables) -> Result<Vec<Bson>> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$shift", "requires 'output', 'by'")),
    };
    let output_expr = d.get("output").ok_or_else(|| DocPipeError::operator("$shift", "missing 'output'"))?;
    let by = match d.get("by") {
        Some(Bson::Int32(n)) => *n as i64,
        Some(Bson::Int64(n)) => *n,
        _ => return Err(DocPipeError::operator("$shift", "missing or invalid 'by'")),
    };
    let default = d.get("default").cloned();
    let _ = doc_unused;

    let mut out = Vec::with_capacity(docs.len());
    for i in 0..docs.len() {
        let src_idx = i as i64 + by;
        if src_idx < 0 || src_idx as usize >= docs.len() {
            out.push(default.clone().unwrap_or(Bson::Null));
        } else {
            out.push(evaluate(output_expr, &docs[src_idx as usize], vars)?.into_bson_or_null());
        }
    }
    Ok(out)
}

fn locf(docs: &[Document], arg: &Bson, vars: &Variables) -> Result<Vec<Bson>> {
    let mut out = Vec::with_capacity(docs.len());
    let mut last: Option<Bson> = None;
    for d in docs {
        let v = evaluate(arg, d, vars)?;
        match v {
            crate::value::Value::Value(Bson::Null) | crate::value::Value::Missing => {
                out.push(last.clone().unwrap_or(Bson::Null));
            }
            crate::value::Value::Value(b) => {
                last = Some(b.clone());
                out.push(b);
            }
            crate::value::Value::Remove => out.push(Bson::Null),
        }
    }
    Ok(out)
}

fn as_f64(b: &Bson) -> Option<f64> {
    match b {
        Bson::Double(d) => Some(*d),
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

fn linear_fill(docs: &[Document], arg: &Bson, sort_values: &[Bson], vars: &Variables) -> Result<Vec<Bson>> {
    let mut raw: Vec<Option<f64>> = Vec::with_capacity(docs.len());
    for d in docs {
        let v = evaluate(arg, d, vars)?;
        raw.push(v.as_bson().and_then(as_f64));
    }
    let x: Vec<f64> = sort_values.iter().map(|v| as_f64(v).unwrap_or(0.0)).collect();

    let mut out = raw.clone();
    let n = out.len();
    let mut i = 0;
    while i < n {
        if out[i].is_none() {
            let mut j = i;
            while j < n && out[j].is_none() {
                j += 1;
            }
            if i > 0 && j < n {
                let (x0, y0) = (x[i - 1], out[i - 1].unwrap());
                let (x1, y1) = (x[j], out[j].unwrap());
                for k in i..j {
                    if (x1 - x0).abs() > f64::EPSILON {
                        let t = (x[k] - x0) / (x1 - x0);
                        out[k] = Some(y0 + t * (y1 - y0));
                    } else {
                        out[k] = Some(y0);
                    }
                }
            }
            i = j;
        } else {
            i += 1;
        }
    }

    Ok(out
        .into_iter()
        .map(|v| v.map(Bson::Double).unwrap_or(Bson::Null))
        .collect())
}

/// Millisecond length of a fixed-duration unit. `$derivative`/`$integral`
/// only accept `unit`s with an unambiguous length, so month/quarter/year
/// (whose length varies by calendar position) are rejected by the caller.
fn unit_millis(unit: DateUnit) -> Option<f64> {
    match unit {
        DateUnit::Millisecond => Some(1.0),
        DateUnit::Second => Some(1_000.0),
        DateUnit::Minute => Some(60_000.0),
        DateUnit::Hour => Some(3_600_000.0),
        DateUnit::Day => Some(86_400_000.0),
        DateUnit::Week => Some(604_800_000.0),
        DateUnit::Month | DateUnit::Quarter | DateUnit::Year => None,
    }
}

/// Reduces `sortBy` values to a plain numeric x-axis, scaling dates to
/// `unit` (or leaving them as raw milliseconds if no `unit` is given).
fn date_aware_x_values(op: &str, sort_values: &[Bson], unit: Option<DateUnit>) -> Result<Vec<f64>> {
    sort_values
        .iter()
        .map(|v| match v {
            Bson::DateTime(dt) => match unit {
                Some(u) => {
                    let scale = unit_millis(u)
                        .ok_or_else(|| DocPipeError::operator(op, "'unit' must be a fixed-duration unit (millisecond..week) for date sort values"))?;
                    Ok(dt.timestamp_millis() as f64 / scale)
                }
                None => Ok(dt.timestamp_millis() as f64),
            },
            other => Ok(as_f64(other).unwrap_or(0.0)),
        })
        .collect()
}

fn parse_unit(op: &str, d: &Document) -> Result<Option<DateUnit>> {
    match d.get_str("unit") {
        Ok(s) => Ok(Some(DateUnit::parse(s).ok_or_else(|| DocPipeError::operator(op, format!("unknown unit '{s}'")))?)),
        Err(_) => Ok(None),
    }
}

fn derivative(docs: &[Document], arg: &Bson, window: &WindowSpec, sort_values: &[Bson], vars: &Variables) -> Result<Vec<Bson>> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$derivative", "requires 'input'")),
    };
    let input_expr = d.get("input").ok_or_else(|| DocPipeError::operator("$derivative", "missing 'input'"))?;
    let unit = parse_unit("$derivative", d)?;
    let mut values = Vec::with_capacity(docs.len());
    for doc in docs {
        values.push(evaluate(input_expr, doc, vars)?.as_bson().and_then(as_f64).unwrap_or(0.0));
    }
    let x = date_aware_x_values("$derivative", sort_values, unit)?;

    let mut out = Vec::with_capacity(docs.len());
    for i in 0..docs.len() {
        let (start, end) = resolve_frame(i, docs.len(), window, sort_values);
        if start == end {
            out.push(Bson::Null);
            continue;
        }
        let dx = x[end] - x[start];
        if dx.abs() > f64::EPSILON {
            out.push(Bson::Double((values[end] - values[start]) / dx));
        } else {
            out.push(Bson::Null);
        }
    }
    Ok(out)
}

fn integral(docs: &[Document], arg: &Bson, window: &WindowSpec, sort_values: &[Bson], vars: &Variables) -> Result<Vec<Bson>> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$integral", "requires 'input'")),
    };
    let input_expr = d.get("input").ok_or_else(|| DocPipeError::operator("$integral", "missing 'input'"))?;
    let unit = parse_unit("$integral", d)?;
    let mut values = Vec::with_capacity(docs.len());
    for doc in docs {
        values.push(evaluate(input_expr, doc, vars)?.as_bson().and_then(as_f64).unwrap_or(0.0));
    }
    let x = date_aware_x_values("$integral", sort_values, unit)?;

    let mut out = Vec::with_capacity(docs.len());
    for i in 0..docs.len() {
        let (start, end) = resolve_frame(i, docs.len(), window, sort_values);
        let mut total = 0.0;
        for k in start..end {
            let dx = x[k + 1] - x[k];
            total += dx * (values[k] + values[k + 1]) / 2.0;
        }
        out.push(Bson::Double(total));
    }
    Ok(out)
}

fn exp_moving_avg(docs: &[Document], arg: &Bson, vars: &Variables) -> Result<Vec<Bson>> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$expMovingAvg", "requires 'input'")),
    };
    let input_expr = d.get("input").ok_or_else(|| DocPipeError::operator("$expMovingAvg", "missing 'input'"))?;
    let alpha = if let Some(n) = d.get("N") {
        let n = match n {
            Bson::Int32(v) => *v as f64,
            Bson::Int64(v) => *v as f64,
            Bson::Double(v) => *v,
            _ => return Err(DocPipeError::operator("$expMovingAvg", "invalid 'N'")),
        };
        2.0 / (n + 1.0)
    } else if let Some(a) = d.get("alpha") {
        match a {
            Bson::Double(v) => *v,
            Bson::Int32(v) => *v as f64,
            _ => return Err(DocPipeError::operator("$expMovingAvg", "invalid 'alpha'")),
        }
    } else {
        return Err(DocPipeError::operator("$expMovingAvg", "requires 'N' or 'alpha'"));
    };

    let mut out = Vec::with_capacity(docs.len());
    let mut prev: Option<f64> = None;
    for doc in docs {
        let v = evaluate(input_expr, doc, vars)?.as_bson().and_then(as_f64).unwrap_or(0.0);
        let next = match prev {
            None => v,
            Some(p) => alpha * v + (1.0 - alpha) * p,
        };
        prev = Some(next);
        out.push(Bson::Double(next));
    }
    Ok(out)
}

fn accumulate_over_frames(
    docs: &[Document],
    op: &str,
    arg: &Bson,
    window: &WindowSpec,
    sort_values: &[Bson],
    vars: &Variables,
) -> Result<Vec<Bson>> {
    let kind = AccumulatorKind::parse(op).ok_or_else(|| DocPipeError::operator(op, "unknown window operator"))?;
    let mut inputs = Vec::with_capacity(docs.len());
    for doc in docs {
        inputs.push(evaluate(arg, doc, vars)?.into_bson_or_null());
    }

    let mut out = Vec::with_capacity(docs.len());
    for i in 0..docs.len() {
        let (start, end) = resolve_frame(i, docs.len(), window, sort_values);
        let mut acc = Accumulator::new(kind);
        for input in &inputs[start..=end] {
            acc.accumulate(input)?;
        }
        out.push(acc.finalize());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn running_sum_is_monotonic_with_unbounded_lower() {
        let docs = vec![doc! {"v": 1}, doc! {"v": 2}, doc! {"v": 3}];
        let window = WindowSpec::Documents(Bound::Unbounded, Bound::Current);
        let vars = Variables::new(bson::DateTime::now(), Document::new());
        let result = compute_window_field(&docs, "$sum", &Bson::String("$v".into()), &window, &[], &Document::new(), &vars).unwrap();
        assert_eq!(result, vec![Bson::Int32(1), Bson::Int32(3), Bson::Int32(6)]);
    }

    #[test]
    fn dense_rank_does_not_skip_after_ties() {
        let docs = vec![doc! {"v": 1}, doc! {"v": 1}, doc! {"v": 2}];
        let keys = vec![SortKey { path: "v".to_string(), ascending: true }];
        let result = rank(&docs, &keys, true);
        assert_eq!(result, vec![Bson::Int64(1), Bson::Int64(1), Bson::Int64(2)]);
    }

    #[test]
    fn rank_skips_after_ties() {
        let docs = vec![doc! {"v": 1}, doc! {"v": 1}, doc! {"v": 2}];
        let keys = vec![SortKey { path: "v".to_string(), ascending: true }];
        let result = rank(&docs, &keys, false);
        assert_eq!(result, vec![Bson::Int64(1), Bson::Int64(1), Bson::Int64(3)]);
    }

    #[test]
    fn integral_is_scoped_to_the_window_frame() {
        let docs = vec![doc! {"t": 0, "v": 0}, doc! {"t": 1, "v": 2}, doc! {"t": 2, "v": 4}];
        let keys = vec![SortKey { path: "t".to_string(), ascending: true }];
        let vars = Variables::new(bson::DateTime::now(), Document::new());
        let window = WindowSpec::Documents(Bound::Offset(-1), Bound::Current);
        let arg = Bson::Document(doc! {"input": "$v"});
        let result = compute_window_field(&docs, "$integral", &arg, &window, &keys, &Document::new(), &vars).unwrap();
        assert_eq!(result, vec![Bson::Double(0.0), Bson::Double(1.0), Bson::Double(3.0)]);
    }
}
