/*!
 * @file bson_order.rs
 * @brief BSON comparison, equality, and truthiness
 *
 * Comparisons follow the type order this engine defines:
 * null < number < string < object < array < bool < date. Within a type,
 * structural rules apply (numeric values compare across int32/int64/double
 * by value; documents compare key-by-key in the order they appear;
 * arrays compare lexicographically).
 */

use bson::{Bson, Document};
use std::cmp::Ordering;

fn type_rank(b: &Bson) -> u8 {
    match b {
        Bson::Null | Bson::Undefined => 0,
        Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Boolean(_) => 5,
        Bson::DateTime(_) => 6,
        // Everything else (ObjectId, Binary, regex, JS code, ...) sorts
        // after the types this engine gives defined semantics to.
        _ => 7,
    }
}

fn as_f64(b: &Bson) -> Option<f64> {
    match b {
        Bson::Double(d) => Some(*d),
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Decimal128(d) => d.to_string().parse::<f64>().ok(),
        _ => None,
    }
}

/// Total order over BSON values per this engine's rules. Never panics:
/// incomparable same-rank oddities (e.g. two regexes) fall back to `Equal`.
pub fn cmp_bson(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Bson::Null, Bson::Null) | (Bson::Undefined, Bson::Undefined) => Ordering::Equal,
        (Bson::Null, Bson::Undefined) | (Bson::Undefined, Bson::Null) => Ordering::Equal,
        _ if ra == 1 => {
            let (fa, fb) = (as_f64(a).unwrap_or(f64::NAN), as_f64(b).unwrap_or(f64::NAN));
            fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
        }
        (Bson::String(sa), Bson::String(sb)) => sa.cmp(sb),
        (Bson::Document(da), Bson::Document(db)) => cmp_document(da, db),
        (Bson::Array(aa), Bson::Array(ab)) => cmp_array(aa, ab),
        (Bson::Boolean(ba), Bson::Boolean(bb)) => ba.cmp(bb),
        (Bson::DateTime(da), Bson::DateTime(db)) => da.cmp(db),
        _ => Ordering::Equal,
    }
}

fn cmp_document(a: &Document, b: &Document) -> Ordering {
    let mut ia = a.iter();
    let mut ib = b.iter();
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let key_cmp = ka.cmp(kb);
                if key_cmp != Ordering::Equal {
                    return key_cmp;
                }
                let val_cmp = cmp_bson(va, vb);
                if val_cmp != Ordering::Equal {
                    return val_cmp;
                }
            }
        }
    }
}

fn cmp_array(a: &[Bson], b: &[Bson]) -> Ordering {
    for (ea, eb) in a.iter().zip(b.iter()) {
        let c = cmp_bson(ea, eb);
        if c != Ordering::Equal {
            return c;
        }
    }
    a.len().cmp(&b.len())
}

/// Structural equality: numeric values compare by value across int32/
/// int64/double (so `1 == 1.0`); documents are equal regardless of key
/// order only through their `cmp_bson` reduction, i.e. order still matters
/// here exactly as MongoDB treats it — same keys, same order, same values.
pub fn eq_bson(a: &Bson, b: &Bson) -> bool {
    cmp_bson(a, b) == Ordering::Equal
}

/// MongoDB truthiness: everything is truthy except `false`, `null`,
/// missing/undefined, and numeric zero (including `0.0` and `NaN`... no,
/// NaN is truthy, only exact zero is falsy).
pub fn truthy(b: &Bson) -> bool {
    match b {
        Bson::Boolean(v) => *v,
        Bson::Null | Bson::Undefined => false,
        Bson::Int32(0) => false,
        Bson::Int64(0) => false,
        Bson::Double(d) => *d != 0.0,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn numbers_cross_compare_by_value() {
        assert_eq!(cmp_bson(&Bson::Int32(1), &Bson::Double(1.0)), Ordering::Equal);
        assert_eq!(cmp_bson(&Bson::Int64(2), &Bson::Int32(1)), Ordering::Greater);
    }

    #[test]
    fn type_order_matches_engine_rule() {
        assert_eq!(cmp_bson(&Bson::Null, &Bson::Int32(0)), Ordering::Less);
        assert_eq!(cmp_bson(&Bson::Int32(9999), &Bson::String("a".into())), Ordering::Less);
        assert_eq!(
            cmp_bson(&Bson::String("z".into()), &Bson::Document(doc! {})),
            Ordering::Less
        );
        assert_eq!(
            cmp_bson(&Bson::Document(doc! {}), &Bson::Array(vec![])),
            Ordering::Less
        );
        assert_eq!(
            cmp_bson(&Bson::Array(vec![]), &Bson::Boolean(false)),
            Ordering::Less
        );
    }

    #[test]
    fn zero_is_falsy_nan_is_truthy() {
        assert!(!truthy(&Bson::Int32(0)));
        assert!(!truthy(&Bson::Null));
        assert!(truthy(&Bson::Double(f64::NAN)));
        assert!(truthy(&Bson::String(String::new())));
    }

    #[test]
    fn arrays_compare_lexicographically() {
        let a = Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]);
        let b = Bson::Array(vec![Bson::Int32(1), Bson::Int32(3)]);
        assert_eq!(cmp_bson(&a, &b), Ordering::Less);
    }
}
