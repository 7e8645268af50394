/*!
 * @file operators.rs
 * @brief Operator library: arithmetic, comparison, logical, conditional,
 * string, array, and date operators, dispatched through a static table.
 */

use crate::bson_order::{cmp_bson, eq_bson, truthy};
use crate::datetime::{self, DateUnit};
use crate::error::{DocPipeError, Result};
use crate::expr::{evaluate, evaluate_or_null, Variables};
use crate::value::Value;
use bson::{Bson, Document};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::OnceLock;

type OpHandler = fn(&Bson, &Document, &Variables) -> Result<Value>;

fn table() -> &'static HashMap<&'static str, OpHandler> {
    static TABLE: OnceLock<HashMap<&'static str, OpHandler>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut m: HashMap<&'static str, OpHandler> = HashMap::new();

        // Arithmetic
        m.insert("$add", op_add);
        m.insert("$subtract", op_subtract);
        m.insert("$multiply", op_multiply);
        m.insert("$divide", op_divide);
        m.insert("$mod", op_mod);
        m.insert("$abs", op_abs);
        m.insert("$ceil", op_ceil);
        m.insert("$floor", op_floor);
        m.insert("$round", op_round);
        m.insert("$trunc", op_trunc);
        m.insert("$sqrt", op_sqrt);
        m.insert("$pow", op_pow);
        m.insert("$exp", op_exp);
        m.insert("$ln", op_ln);
        m.insert("$log10", op_log10);

        // Comparison
        m.insert("$eq", op_eq);
        m.insert("$ne", op_ne);
        m.insert("$gt", op_gt);
        m.insert("$gte", op_gte);
        m.insert("$lt", op_lt);
        m.insert("$lte", op_lte);
        m.insert("$cmp", op_cmp);

        // Logical
        m.insert("$and", op_and);
        m.insert("$or", op_or);
        m.insert("$not", op_not);

        // Conditional
        m.insert("$cond", op_cond);
        m.insert("$ifNull", op_if_null);
        m.insert("$switch", op_switch);
        m.insert("$let", op_let);

        // String
        m.insert("$concat", op_concat);
        m.insert("$toUpper", op_to_upper);
        m.insert("$toLower", op_to_lower);
        m.insert("$trim", op_trim);
        m.insert("$ltrim", op_ltrim);
        m.insert("$rtrim", op_rtrim);
        m.insert("$substrCP", op_substr);
        m.insert("$substrBytes", op_substr);
        m.insert("$substr", op_substr);
        m.insert("$strLenCP", op_str_len);
        m.insert("$strLenBytes", op_str_len_bytes);
        m.insert("$split", op_split);
        m.insert("$indexOfCP", op_index_of_cp);
        m.insert("$replaceOne", op_replace_one);
        m.insert("$replaceAll", op_replace_all);

        // Array
        m.insert("$size", op_size);
        m.insert("$arrayElemAt", op_array_elem_at);
        m.insert("$slice", op_slice);
        m.insert("$in", op_in);
        m.insert("$indexOfArray", op_index_of_array);
        m.insert("$concatArrays", op_concat_arrays);
        m.insert("$filter", op_filter);
        m.insert("$map", op_map);
        m.insert("$reduce", op_reduce);
        m.insert("$reverseArray", op_reverse_array);
        m.insert("$sortArray", op_sort_array);
        m.insert("$first", op_first);
        m.insert("$last", op_last);
        m.insert("$range", op_range);

        // Date
        m.insert("$dateAdd", op_date_add);
        m.insert("$dateSubtract", op_date_subtract);
        m.insert("$dateDiff", op_date_diff);
        m.insert("$year", op_year);
        m.insert("$month", op_month);
        m.insert("$dayOfMonth", op_day_of_month);
        m.insert("$dayOfWeek", op_day_of_week);
        m.insert("$dayOfYear", op_day_of_year);
        m.insert("$hour", op_hour);
        m.insert("$minute", op_minute);
        m.insert("$second", op_second);
        m.insert("$millisecond", op_millisecond);
        m.insert("$week", op_week);
        m.insert("$dateToString", op_date_to_string);

        // Type / misc
        m.insert("$type", op_type);
        m.insert("$toString", op_to_string);
        m.insert("$toInt", op_to_int);
        m.insert("$toLong", op_to_long);
        m.insert("$toDouble", op_to_double);
        m.insert("$toBool", op_to_bool);

        m
    })
}

pub fn apply(op: &str, arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let handler = table()
        .get(op)
        .ok_or_else(|| DocPipeError::OperatorShape(format!("unknown expression operator '{op}'")))?;
    handler(arg, doc, vars)
}

// --- argument helpers -----------------------------------------------------

fn as_array(arg: &Bson) -> Vec<Bson> {
    match arg {
        Bson::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn eval_args(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Vec<Value>> {
    as_array(arg).iter().map(|e| evaluate(e, doc, vars)).collect()
}

fn eval_args_f64(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Vec<Option<f64>>> {
    eval_args(arg, doc, vars)?
        .into_iter()
        .map(|v| match v {
            Value::Missing | Value::Value(Bson::Null) => Ok(None),
            Value::Value(b) => to_f64(&b).map(Some),
            Value::Remove => Ok(None),
        })
        .collect()
}

fn to_f64(b: &Bson) -> Result<f64> {
    match b {
        Bson::Double(d) => Ok(*d),
        Bson::Int32(i) => Ok(*i as f64),
        Bson::Int64(i) => Ok(*i as f64),
        Bson::Decimal128(d) => d
            .to_string()
            .parse::<f64>()
            .map_err(|_| DocPipeError::type_error("numeric operator", "invalid decimal")),
        _ => Err(DocPipeError::type_error("numeric operator", format!("{b:?} is not numeric"))),
    }
}

fn numeric_result(original_has_double: bool, value: f64) -> Bson {
    if original_has_double || value.fract() != 0.0 || value.abs() >= i64::MAX as f64 {
        Bson::Double(value)
    } else if value.abs() <= i32::MAX as f64 {
        Bson::Int32(value as i32)
    } else {
        Bson::Int64(value as i64)
    }
}

fn any_double(args: &[Bson]) -> bool {
    args.iter().any(|b| matches!(b, Bson::Double(_)))
}

fn single(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    evaluate(arg, doc, vars)
}

fn as_str(v: &Value, ctx: &str) -> Result<String> {
    match v {
        Value::Value(Bson::String(s)) => Ok(s.clone()),
        Value::Value(Bson::Null) | Value::Missing => Ok(String::new()),
        other => Err(DocPipeError::type_error(ctx, format!("{other:?} is not a string"))),
    }
}

fn as_i64(v: &Value, ctx: &str) -> Result<i64> {
    match v {
        Value::Value(b) => to_f64(b).map(|f| f as i64),
        other => Err(DocPipeError::type_error(ctx, format!("{other:?} is not numeric"))),
    }
}

fn as_date(v: &Value, ctx: &str) -> Result<bson::DateTime> {
    match v {
        Value::Value(Bson::DateTime(d)) => Ok(*d),
        other => Err(DocPipeError::type_error(ctx, format!("{other:?} is not a date"))),
    }
}

// --- arithmetic ------------------------------------------------------------

fn op_add(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let args = as_array(arg);
    let vals = eval_args_f64(arg, doc, vars)?;
    if vals.iter().any(|v| v.is_none()) {
        return Ok(Value::null());
    }
    let sum: f64 = vals.into_iter().flatten().sum();
    Ok(Value::Value(numeric_result(any_double(&args), sum)))
}

fn op_subtract(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let args = as_array(arg);
    let vals = eval_args_f64(arg, doc, vars)?;
    if vals.len() != 2 {
        return Err(DocPipeError::operator("$subtract", "requires exactly two arguments"));
    }
    match (vals[0], vals[1]) {
        (Some(a), Some(b)) => Ok(Value::Value(numeric_result(any_double(&args), a - b))),
        _ => Ok(Value::null()),
    }
}

fn op_multiply(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let args = as_array(arg);
    let vals = eval_args_f64(arg, doc, vars)?;
    if vals.iter().any(|v| v.is_none()) {
        return Ok(Value::null());
    }
    let product: f64 = vals.into_iter().flatten().product();
    Ok(Value::Value(numeric_result(any_double(&args), product)))
}

fn op_divide(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args_f64(arg, doc, vars)?;
    if vals.len() != 2 {
        return Err(DocPipeError::operator("$divide", "requires exactly two arguments"));
    }
    match (vals[0], vals[1]) {
        (Some(_), Some(b)) if b == 0.0 => Err(DocPipeError::operator("$divide", "division by zero")),
        (Some(a), Some(b)) => Ok(Value::Value(Bson::Double(a / b))),
        _ => Ok(Value::null()),
    }
}

fn op_mod(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let args = as_array(arg);
    let vals = eval_args_f64(arg, doc, vars)?;
    if vals.len() != 2 {
        return Err(DocPipeError::operator("$mod", "requires exactly two arguments"));
    }
    match (vals[0], vals[1]) {
        (Some(_), Some(b)) if b == 0.0 => Err(DocPipeError::operator("$mod", "division by zero")),
        (Some(a), Some(b)) => Ok(Value::Value(numeric_result(any_double(&args), a % b))),
        _ => Ok(Value::null()),
    }
}

fn unary_math(arg: &Bson, doc: &Document, vars: &Variables, f: impl Fn(f64) -> f64, keep_int: bool) -> Result<Value> {
    let v = single(arg, doc, vars)?;
    match v {
        Value::Value(Bson::Null) | Value::Missing => Ok(Value::null()),
        Value::Value(b) => {
            let n = to_f64(&b)?;
            let result = f(n);
            if keep_int && !matches!(b, Bson::Double(_)) {
                Ok(Value::Value(numeric_result(false, result)))
            } else {
                Ok(Value::Value(Bson::Double(result)))
            }
        }
        Value::Remove => Ok(Value::null()),
    }
}

fn op_abs(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    unary_math(a, d, v, f64::abs, true)
}
fn op_ceil(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    unary_math(a, d, v, f64::ceil, true)
}
fn op_floor(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    unary_math(a, d, v, f64::floor, true)
}
fn op_sqrt(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    unary_math(a, d, v, f64::sqrt, false)
}
fn op_exp(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    unary_math(a, d, v, f64::exp, false)
}
fn op_ln(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    unary_math(a, d, v, f64::ln, false)
}
fn op_log10(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    unary_math(a, d, v, f64::log10, false)
}

fn op_round(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args_f64(arg, doc, vars)?;
    let num = match vals.first().copied().flatten() {
        Some(n) => n,
        None => return Ok(Value::null()),
    };
    let place = vals.get(1).copied().flatten().unwrap_or(0.0) as i32;
    let factor = 10f64.powi(place);
    Ok(Value::Value(Bson::Double((num * factor).round() / factor)))
}

fn op_trunc(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args_f64(arg, doc, vars)?;
    let num = match vals.first().copied().flatten() {
        Some(n) => n,
        None => return Ok(Value::null()),
    };
    let place = vals.get(1).copied().flatten().unwrap_or(0.0) as i32;
    let factor = 10f64.powi(place);
    Ok(Value::Value(Bson::Double((num * factor).trunc() / factor)))
}

fn op_pow(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args_f64(arg, doc, vars)?;
    if vals.len() != 2 {
        return Err(DocPipeError::operator("$pow", "requires exactly two arguments"));
    }
    match (vals[0], vals[1]) {
        (Some(base), Some(exp)) => Ok(Value::Value(Bson::Double(base.powf(exp)))),
        _ => Ok(Value::null()),
    }
}

// --- comparison ------------------------------------------------------------

fn eval_pair(arg: &Bson, doc: &Document, vars: &Variables, op: &str) -> Result<(Value, Value)> {
    let args = as_array(arg);
    if args.len() != 2 {
        return Err(DocPipeError::operator(op, "requires exactly two arguments"));
    }
    Ok((evaluate(&args[0], doc, vars)?, evaluate(&args[1], doc, vars)?))
}

fn compare(arg: &Bson, doc: &Document, vars: &Variables, op: &str) -> Result<Ordering> {
    let (a, b) = eval_pair(arg, doc, vars, op)?;
    Ok(cmp_bson(&a.into_bson_or_null(), &b.into_bson_or_null()))
}

fn op_eq(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let (x, y) = eval_pair(a, d, v, "$eq")?;
    Ok(Value::Value(Bson::Boolean(eq_bson(&x.into_bson_or_null(), &y.into_bson_or_null()))))
}
fn op_ne(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let (x, y) = eval_pair(a, d, v, "$ne")?;
    Ok(Value::Value(Bson::Boolean(!eq_bson(&x.into_bson_or_null(), &y.into_bson_or_null()))))
}
fn op_gt(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    Ok(Value::Value(Bson::Boolean(compare(a, d, v, "$gt")? == Ordering::Greater)))
}
fn op_gte(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    Ok(Value::Value(Bson::Boolean(compare(a, d, v, "$gte")? != Ordering::Less)))
}
fn op_lt(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    Ok(Value::Value(Bson::Boolean(compare(a, d, v, "$lt")? == Ordering::Less)))
}
fn op_lte(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    Ok(Value::Value(Bson::Boolean(compare(a, d, v, "$lte")? != Ordering::Greater)))
}
fn op_cmp(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let ord = compare(a, d, v, "$cmp")?;
    let n = match ord {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    };
    Ok(Value::Value(Bson::Int32(n)))
}

// --- logical ---------------------------------------------------------------

fn op_and(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    for e in as_array(arg) {
        let v = evaluate(&e, doc, vars)?;
        if !truthy(&v.into_bson_or_null()) {
            return Ok(Value::Value(Bson::Boolean(false)));
        }
    }
    Ok(Value::Value(Bson::Boolean(true)))
}

fn op_or(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    for e in as_array(arg) {
        let v = evaluate(&e, doc, vars)?;
        if truthy(&v.into_bson_or_null()) {
            return Ok(Value::Value(Bson::Boolean(true)));
        }
    }
    Ok(Value::Value(Bson::Boolean(false)))
}

fn op_not(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let args = as_array(arg);
    let v = evaluate(args.first().ok_or_else(|| DocPipeError::operator("$not", "requires one argument"))?, doc, vars)?;
    Ok(Value::Value(Bson::Boolean(!truthy(&v.into_bson_or_null()))))
}

// --- conditional -------------------------------------------------------------

fn op_cond(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let (cond, then, els) = match arg {
        Bson::Document(d) => (
            d.get("if").cloned().ok_or_else(|| DocPipeError::operator("$cond", "missing 'if'"))?,
            d.get("then").cloned().ok_or_else(|| DocPipeError::operator("$cond", "missing 'then'"))?,
            d.get("else").cloned().ok_or_else(|| DocPipeError::operator("$cond", "missing 'else'"))?,
        ),
        Bson::Array(items) if items.len() == 3 => (items[0].clone(), items[1].clone(), items[2].clone()),
        _ => return Err(DocPipeError::operator("$cond", "requires 3 arguments or if/then/else")),
    };
    let c = evaluate(&cond, doc, vars)?;
    if truthy(&c.into_bson_or_null()) {
        evaluate(&then, doc, vars)
    } else {
        evaluate(&els, doc, vars)
    }
}

fn op_if_null(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let args = as_array(arg);
    if args.is_empty() {
        return Err(DocPipeError::operator("$ifNull", "requires at least one argument"));
    }
    let (last, rest) = args.split_last().unwrap();
    for e in rest {
        let v = evaluate(e, doc, vars)?;
        if !v.is_nullish() {
            return Ok(v);
        }
    }
    evaluate(last, doc, vars)
}

fn op_switch(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$switch", "requires a document with 'branches'")),
    };
    let branches = d
        .get_array("branches")
        .map_err(|_| DocPipeError::operator("$switch", "missing 'branches' array"))?;
    for branch in branches {
        if let Bson::Document(b) = branch {
            let case = b.get("case").ok_or_else(|| DocPipeError::operator("$switch", "branch missing 'case'"))?;
            let c = evaluate(case, doc, vars)?;
            if truthy(&c.into_bson_or_null()) {
                let then = b.get("then").ok_or_else(|| DocPipeError::operator("$switch", "branch missing 'then'"))?;
                return evaluate(then, doc, vars);
            }
        }
    }
    match d.get("default") {
        Some(default) => evaluate(default, doc, vars),
        None => Err(DocPipeError::operator("$switch", "no branch matched and no default given")),
    }
}

fn op_let(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$let", "requires a document with 'vars' and 'in'")),
    };
    let bind_doc = d
        .get_document("vars")
        .map_err(|_| DocPipeError::operator("$let", "missing 'vars'"))?;
    let mut next = vars.clone();
    for (name, expr) in bind_doc {
        let value = evaluate(expr, doc, vars)?;
        next.bindings.insert(name.clone(), value);
    }
    let in_expr = d.get("in").ok_or_else(|| DocPipeError::operator("$let", "missing 'in'"))?;
    evaluate(in_expr, doc, &next)
}

// --- string ------------------------------------------------------------------

fn op_concat(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args(arg, doc, vars)?;
    if vals.iter().any(|v| v.is_nullish()) {
        return Ok(Value::null());
    }
    let mut out = String::new();
    for v in vals {
        out.push_str(&as_str(&v, "$concat")?);
    }
    Ok(Value::Value(Bson::String(out)))
}

fn op_to_upper(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let s = as_str(&single(a, d, v)?, "$toUpper")?;
    Ok(Value::Value(Bson::String(s.to_uppercase())))
}
fn op_to_lower(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let s = as_str(&single(a, d, v)?, "$toLower")?;
    Ok(Value::Value(Bson::String(s.to_lowercase())))
}
fn op_trim(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    trim_impl(a, d, v, true, true)
}
fn op_ltrim(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    trim_impl(a, d, v, true, false)
}
fn op_rtrim(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    trim_impl(a, d, v, false, true)
}

fn trim_impl(arg: &Bson, doc: &Document, vars: &Variables, left: bool, right: bool) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d.clone(),
        other => {
            let mut wrapper = Document::new();
            wrapper.insert("input", other.clone());
            wrapper
        }
    };
    let input_expr = d.get("input").ok_or_else(|| DocPipeError::operator("$trim", "missing 'input'"))?;
    let input = as_str(&evaluate(input_expr, doc, vars)?, "$trim")?;
    let chars: Option<String> = match d.get("chars") {
        Some(c) => Some(as_str(&evaluate(c, doc, vars)?, "$trim")?),
        None => None,
    };
    let pattern: Vec<char> = chars.unwrap_or_else(|| " \t\n\r".to_string()).chars().collect();
    let mut s: &str = &input;
    if left {
        s = s.trim_start_matches(|c| pattern.contains(&c));
    }
    if right {
        s = s.trim_end_matches(|c| pattern.contains(&c));
    }
    Ok(Value::Value(Bson::String(s.to_string())))
}

fn op_substr(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let args = as_array(arg);
    if args.len() != 3 {
        return Err(DocPipeError::operator("$substrCP", "requires 3 arguments"));
    }
    let s = as_str(&evaluate(&args[0], doc, vars)?, "$substrCP")?;
    let start = as_i64(&evaluate(&args[1], doc, vars)?, "$substrCP")?.max(0) as usize;
    let len = as_i64(&evaluate(&args[2], doc, vars)?, "$substrCP")?;
    let chars: Vec<char> = s.chars().collect();
    if start >= chars.len() {
        return Ok(Value::Value(Bson::String(String::new())));
    }
    let end = if len < 0 {
        chars.len()
    } else {
        (start + len as usize).min(chars.len())
    };
    Ok(Value::Value(Bson::String(chars[start..end].iter().collect())))
}

fn op_str_len(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let s = as_str(&single(a, d, v)?, "$strLenCP")?;
    Ok(Value::Value(Bson::Int32(s.chars().count() as i32)))
}
fn op_str_len_bytes(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let s = as_str(&single(a, d, v)?, "$strLenBytes")?;
    Ok(Value::Value(Bson::Int32(s.len() as i32)))
}

fn op_split(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let (a, b) = eval_pair(arg, doc, vars, "$split")?;
    let s = as_str(&a, "$split")?;
    let delim = as_str(&b, "$split")?;
    let parts: Vec<Bson> = s.split(delim.as_str()).map(|p| Bson::String(p.to_string())).collect();
    Ok(Value::Value(Bson::Array(parts)))
}

fn op_index_of_cp(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let args = as_array(arg);
    if args.len() < 2 {
        return Err(DocPipeError::operator("$indexOfCP", "requires at least 2 arguments"));
    }
    let s = as_str(&evaluate(&args[0], doc, vars)?, "$indexOfCP")?;
    let needle = as_str(&evaluate(&args[1], doc, vars)?, "$indexOfCP")?;
    let chars: Vec<char> = s.chars().collect();
    let needle_chars: Vec<char> = needle.chars().collect();
    if needle_chars.is_empty() {
        return Ok(Value::Value(Bson::Int32(0)));
    }
    for start in 0..=chars.len().saturating_sub(needle_chars.len()) {
        if chars[start..start + needle_chars.len()] == needle_chars[..] {
            return Ok(Value::Value(Bson::Int32(start as i32)));
        }
    }
    Ok(Value::Value(Bson::Int32(-1)))
}

fn op_replace_one(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    replace_impl(arg, doc, vars, false)
}
fn op_replace_all(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    replace_impl(arg, doc, vars, true)
}

fn replace_impl(arg: &Bson, doc: &Document, vars: &Variables, all: bool) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$replaceOne", "requires a document")),
    };
    let input = as_str(&evaluate(d.get("input").ok_or_else(|| DocPipeError::operator("$replaceOne", "missing 'input'"))?, doc, vars)?, "$replaceOne")?;
    let find = as_str(&evaluate(d.get("find").ok_or_else(|| DocPipeError::operator("$replaceOne", "missing 'find'"))?, doc, vars)?, "$replaceOne")?;
    let replacement = as_str(&evaluate(d.get("replacement").ok_or_else(|| DocPipeError::operator("$replaceOne", "missing 'replacement'"))?, doc, vars)?, "$replaceOne")?;
    let out = if all {
        input.replace(find.as_str(), &replacement)
    } else {
        input.replacen(find.as_str(), &replacement, 1)
    };
    Ok(Value::Value(Bson::String(out)))
}

// --- array ---------------------------------------------------------------

fn as_bson_array(v: &Value, ctx: &str) -> Result<Vec<Bson>> {
    match v {
        Value::Value(Bson::Array(a)) => Ok(a.clone()),
        Value::Value(Bson::Null) | Value::Missing => Ok(Vec::new()),
        other => Err(DocPipeError::type_error(ctx, format!("{other:?} is not an array"))),
    }
}

fn op_size(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let arr = as_bson_array(&single(a, d, v)?, "$size")?;
    Ok(Value::Value(Bson::Int32(arr.len() as i32)))
}

fn op_array_elem_at(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let (a, b) = eval_pair(arg, doc, vars, "$arrayElemAt")?;
    let arr = as_bson_array(&a, "$arrayElemAt")?;
    let idx = as_i64(&b, "$arrayElemAt")?;
    let real_idx = if idx < 0 { arr.len() as i64 + idx } else { idx };
    if real_idx < 0 || real_idx as usize >= arr.len() {
        return Ok(Value::Missing);
    }
    Ok(Value::Value(arr[real_idx as usize].clone()))
}

fn op_slice(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args(arg, doc, vars)?;
    let arr = as_bson_array(&vals[0], "$slice")?;
    let len = arr.len() as i64;
    let (start, n) = if vals.len() == 2 {
        let n = as_i64(&vals[1], "$slice")?;
        if n >= 0 {
            (0i64, n)
        } else {
            ((len + n).max(0), -n)
        }
    } else {
        let pos = as_i64(&vals[1], "$slice")?;
        let n = as_i64(&vals[2], "$slice")?;
        let start = if pos < 0 { (len + pos).max(0) } else { pos.min(len) };
        (start, n)
    };
    let start = start.clamp(0, len) as usize;
    let end = ((start as i64) + n).clamp(0, len) as usize;
    Ok(Value::Value(Bson::Array(arr[start..end.max(start)].to_vec())))
}

fn op_in(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let (needle, haystack) = eval_pair(arg, doc, vars, "$in")?;
    let arr = as_bson_array(&haystack, "$in")?;
    let n = needle.into_bson_or_null();
    Ok(Value::Value(Bson::Boolean(arr.iter().any(|e| eq_bson(e, &n)))))
}

fn op_index_of_array(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args(arg, doc, vars)?;
    let arr = as_bson_array(&vals[0], "$indexOfArray")?;
    let needle = vals[1].clone().into_bson_or_null();
    for (i, e) in arr.iter().enumerate() {
        if eq_bson(e, &needle) {
            return Ok(Value::Value(Bson::Int32(i as i32)));
        }
    }
    Ok(Value::Value(Bson::Int32(-1)))
}

fn op_concat_arrays(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args(arg, doc, vars)?;
    let mut out = Vec::new();
    for v in vals {
        if v.is_nullish() {
            return Ok(Value::null());
        }
        out.extend(as_bson_array(&v, "$concatArrays")?);
    }
    Ok(Value::Value(Bson::Array(out)))
}

fn op_reverse_array(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let mut arr = as_bson_array(&single(a, d, v)?, "$reverseArray")?;
    arr.reverse();
    Ok(Value::Value(Bson::Array(arr)))
}

fn op_sort_array(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$sortArray", "requires 'input' and 'sortBy'")),
    };
    let input_expr = d.get("input").ok_or_else(|| DocPipeError::operator("$sortArray", "missing 'input'"))?;
    let mut arr = as_bson_array(&evaluate(input_expr, doc, vars)?, "$sortArray")?;
    let ascending = !matches!(d.get("sortBy"), Some(Bson::Int32(-1)) | Some(Bson::Int64(-1)));
    arr.sort_by(|a, b| {
        let ord = cmp_bson(a, b);
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    Ok(Value::Value(Bson::Array(arr)))
}

fn op_first(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let arr = as_bson_array(&single(a, d, v)?, "$first")?;
    Ok(arr.first().cloned().into())
}
fn op_last(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let arr = as_bson_array(&single(a, d, v)?, "$last")?;
    Ok(arr.last().cloned().into())
}

fn op_range(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let vals = eval_args(arg, doc, vars)?;
    let start = as_i64(&vals[0], "$range")?;
    let end = as_i64(&vals[1], "$range")?;
    let step = if vals.len() > 2 { as_i64(&vals[2], "$range")? } else { 1 };
    if step == 0 {
        return Err(DocPipeError::operator("$range", "step cannot be zero"));
    }
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < end) || (step < 0 && i > end) {
        out.push(Bson::Int64(i));
        i += step;
    }
    Ok(Value::Value(Bson::Array(out)))
}

fn op_filter(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$filter", "requires 'input', 'cond'")),
    };
    let input_expr = d.get("input").ok_or_else(|| DocPipeError::operator("$filter", "missing 'input'"))?;
    let cond = d.get("cond").ok_or_else(|| DocPipeError::operator("$filter", "missing 'cond'"))?;
    let as_name = d.get_str("as").unwrap_or("this").to_string();
    let arr = as_bson_array(&evaluate(input_expr, doc, vars)?, "$filter")?;
    let mut out = Vec::new();
    for item in arr {
        let scoped = vars.with_binding(as_name.clone(), Value::Value(item.clone()));
        if truthy(&evaluate(cond, doc, &scoped)?.into_bson_or_null()) {
            out.push(item);
        }
    }
    Ok(Value::Value(Bson::Array(out)))
}

fn op_map(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$map", "requires 'input', 'in'")),
    };
    let input_expr = d.get("input").ok_or_else(|| DocPipeError::operator("$map", "missing 'input'"))?;
    let in_expr = d.get("in").ok_or_else(|| DocPipeError::operator("$map", "missing 'in'"))?;
    let as_name = d.get_str("as").unwrap_or("this").to_string();
    let arr = as_bson_array(&evaluate(input_expr, doc, vars)?, "$map")?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let scoped = vars.with_binding(as_name.clone(), Value::Value(item));
        out.push(evaluate(in_expr, doc, &scoped)?.into_bson_or_null());
    }
    Ok(Value::Value(Bson::Array(out)))
}

fn op_reduce(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$reduce", "requires 'input', 'initialValue', 'in'")),
    };
    let input_expr = d.get("input").ok_or_else(|| DocPipeError::operator("$reduce", "missing 'input'"))?;
    let initial = d.get("initialValue").ok_or_else(|| DocPipeError::operator("$reduce", "missing 'initialValue'"))?;
    let in_expr = d.get("in").ok_or_else(|| DocPipeError::operator("$reduce", "missing 'in'"))?;
    let arr = as_bson_array(&evaluate(input_expr, doc, vars)?, "$reduce")?;
    let mut acc = evaluate(initial, doc, vars)?.into_bson_or_null();
    for item in arr {
        let scoped = vars
            .with_binding("value", Value::Value(acc.clone()))
            .with_binding("this", Value::Value(item));
        acc = evaluate(in_expr, doc, &scoped)?.into_bson_or_null();
    }
    Ok(Value::Value(acc))
}

// --- date ------------------------------------------------------------------

fn op_date_add(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    date_add_sub(arg, doc, vars, 1)
}
fn op_date_subtract(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    date_add_sub(arg, doc, vars, -1)
}

fn date_add_sub(arg: &Bson, doc: &Document, vars: &Variables, sign: i64) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$dateAdd", "requires startDate/unit/amount")),
    };
    let start = as_date(&evaluate(d.get("startDate").ok_or_else(|| DocPipeError::operator("$dateAdd", "missing 'startDate'"))?, doc, vars)?, "$dateAdd")?;
    let unit_str = as_str(&evaluate(d.get("unit").ok_or_else(|| DocPipeError::operator("$dateAdd", "missing 'unit'"))?, doc, vars)?, "$dateAdd")?;
    let unit = DateUnit::parse(&unit_str).ok_or_else(|| DocPipeError::operator("$dateAdd", format!("unknown unit '{unit_str}'")))?;
    let amount = as_i64(&evaluate(d.get("amount").ok_or_else(|| DocPipeError::operator("$dateAdd", "missing 'amount'"))?, doc, vars)?, "$dateAdd")?;
    Ok(Value::Value(Bson::DateTime(datetime::date_add(start, unit, amount * sign))))
}

fn op_date_diff(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$dateDiff", "requires startDate/endDate/unit")),
    };
    let start = as_date(&evaluate(d.get("startDate").ok_or_else(|| DocPipeError::operator("$dateDiff", "missing 'startDate'"))?, doc, vars)?, "$dateDiff")?;
    let end = as_date(&evaluate(d.get("endDate").ok_or_else(|| DocPipeError::operator("$dateDiff", "missing 'endDate'"))?, doc, vars)?, "$dateDiff")?;
    let unit_str = as_str(&evaluate(d.get("unit").ok_or_else(|| DocPipeError::operator("$dateDiff", "missing 'unit'"))?, doc, vars)?, "$dateDiff")?;
    let unit = DateUnit::parse(&unit_str).ok_or_else(|| DocPipeError::operator("$dateDiff", format!("unknown unit '{unit_str}'")))?;
    Ok(Value::Value(Bson::Int64(datetime::date_diff(start, end, unit))))
}

fn date_field(a: &Bson, d: &Document, v: &Variables, f: impl Fn(bson::DateTime) -> u32, op: &str) -> Result<Value> {
    let dt = as_date(&single(a, d, v)?, op)?;
    Ok(Value::Value(Bson::Int32(f(dt) as i32)))
}

fn op_year(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let dt = as_date(&single(a, d, v)?, "$year")?;
    Ok(Value::Value(Bson::Int32(datetime::year_of(dt))))
}
fn op_month(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::month_of, "$month")
}
fn op_day_of_month(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::day_of_month, "$dayOfMonth")
}
fn op_day_of_week(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::day_of_week, "$dayOfWeek")
}
fn op_day_of_year(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::day_of_year, "$dayOfYear")
}
fn op_hour(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::hour_of, "$hour")
}
fn op_minute(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::minute_of, "$minute")
}
fn op_second(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::second_of, "$second")
}
fn op_millisecond(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::millisecond_of, "$millisecond")
}
fn op_week(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    date_field(a, d, v, datetime::week_of, "$week")
}

fn op_date_to_string(arg: &Bson, doc: &Document, vars: &Variables) -> Result<Value> {
    let d = match arg {
        Bson::Document(d) => d,
        _ => return Err(DocPipeError::operator("$dateToString", "requires 'date'")),
    };
    let date_expr = d.get("date").ok_or_else(|| DocPipeError::operator("$dateToString", "missing 'date'"))?;
    let dt_val = evaluate(date_expr, doc, vars)?;
    if dt_val.is_nullish() {
        return match d.get("onNull") {
            Some(on_null) => evaluate(on_null, doc, vars),
            None => Ok(Value::null()),
        };
    }
    let dt = as_date(&dt_val, "$dateToString")?;
    let format = match d.get("format") {
        Some(f) => as_str(&evaluate(f, doc, vars)?, "$dateToString")?,
        None => "%Y-%m-%dT%H:%M:%S%.3fZ".to_string(),
    };
    let chrono_format = format
        .replace("%Y", "%Y")
        .replace("%m", "%m")
        .replace("%d", "%d")
        .replace("%H", "%H")
        .replace("%M", "%M")
        .replace("%S", "%S")
        .replace("%L", "%3f");
    Ok(Value::Value(Bson::String(dt.to_chrono().format(&chrono_format).to_string())))
}

// --- type / misc -------------------------------------------------------------

fn op_type(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let val = single(a, d, v)?;
    let type_name = match &val {
        Value::Missing => "missing",
        Value::Remove => "missing",
        Value::Value(b) => match b {
            Bson::Double(_) => "double",
            Bson::String(_) => "string",
            Bson::Document(_) => "object",
            Bson::Array(_) => "array",
            Bson::Boolean(_) => "bool",
            Bson::Null => "null",
            Bson::Int32(_) => "int",
            Bson::Int64(_) => "long",
            Bson::DateTime(_) => "date",
            Bson::ObjectId(_) => "objectId",
            Bson::Decimal128(_) => "decimal",
            _ => "unknown",
        },
    };
    Ok(Value::Value(Bson::String(type_name.to_string())))
}

fn op_to_string(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let val = single(a, d, v)?;
    if val.is_nullish() {
        return Ok(Value::null());
    }
    let s = match val.as_bson() {
        Some(Bson::String(s)) => s.clone(),
        Some(Bson::Int32(i)) => i.to_string(),
        Some(Bson::Int64(i)) => i.to_string(),
        Some(Bson::Double(f)) => f.to_string(),
        Some(Bson::Boolean(b)) => b.to_string(),
        Some(Bson::DateTime(dt)) => dt.to_chrono().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        Some(other) => return Err(DocPipeError::operator("$toString", format!("cannot convert {other:?}"))),
        None => String::new(),
    };
    Ok(Value::Value(Bson::String(s)))
}

fn op_to_int(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    to_number(a, d, v, "$toInt", |f| Bson::Int32(f as i32))
}
fn op_to_long(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    to_number(a, d, v, "$toLong", |f| Bson::Int64(f as i64))
}
fn op_to_double(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    to_number(a, d, v, "$toDouble", Bson::Double)
}

fn to_number(arg: &Bson, doc: &Document, vars: &Variables, op: &str, wrap: impl Fn(f64) -> Bson) -> Result<Value> {
    let val = single(arg, doc, vars)?;
    if val.is_nullish() {
        return Ok(Value::null());
    }
    let f = match val.as_bson() {
        Some(Bson::String(s)) => s.trim().parse::<f64>().map_err(|_| DocPipeError::operator(op, format!("cannot convert '{s}'")))?,
        Some(b) => to_f64(b)?,
        None => return Ok(Value::null()),
    };
    Ok(Value::Value(wrap(f)))
}

fn op_to_bool(a: &Bson, d: &Document, v: &Variables) -> Result<Value> {
    let val = single(a, d, v)?;
    Ok(Value::Value(Bson::Boolean(truthy(&val.into_bson_or_null()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn vars() -> Variables {
        Variables::new(bson::DateTime::now(), Document::new())
    }

    #[test]
    fn add_sums_numbers() {
        let d = Document::new();
        let v = apply("$add", &Bson::Array(vec![Bson::Int32(1), Bson::Int32(2), Bson::Int32(3)]), &d, &vars()).unwrap();
        assert_eq!(v, Value::Value(Bson::Int32(6)));
    }

    #[test]
    fn cond_picks_branch() {
        let d = Document::new();
        let expr = doc! { "if": true, "then": "yes", "else": "no" };
        let v = apply("$cond", &Bson::Document(expr), &d, &vars()).unwrap();
        assert_eq!(v, Value::Value(Bson::String("yes".into())));
    }

    #[test]
    fn map_applies_expr_with_this_binding() {
        let d = Document::new();
        let expr = doc! { "input": [1, 2, 3], "in": { "$multiply": ["$$this", 2] } };
        let v = apply("$map", &Bson::Document(expr), &d, &vars()).unwrap();
        assert_eq!(v, Value::Value(Bson::Array(vec![Bson::Int32(2), Bson::Int32(4), Bson::Int32(6)])));
    }

    #[test]
    fn filter_keeps_matching_elements() {
        let d = Document::new();
        let expr = doc! { "input": [1, 2, 3, 4], "cond": { "$gt": ["$$this", 2] } };
        let v = apply("$filter", &Bson::Document(expr), &d, &vars()).unwrap();
        assert_eq!(v, Value::Value(Bson::Array(vec![Bson::Int32(3), Bson::Int32(4)])));
    }

    #[test]
    fn in_checks_membership() {
        let d = Document::new();
        let v = apply("$in", &Bson::Array(vec![Bson::Int32(2), Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)])]), &d, &vars()).unwrap();
        assert_eq!(v, Value::Value(Bson::Boolean(true)));
    }
}
