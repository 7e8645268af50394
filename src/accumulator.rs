/*!
 * @file accumulator.rs
 * @brief Accumulator state machine shared by `$group`, `$bucket`/`$bucketAuto`
 * output, and the window engine's accumulator-over-frame operators.
 */

use crate::bson_order::cmp_bson;
use crate::error::{DocPipeError, Result};
use bson::Bson;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorKind {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
    Count,
    StdDevPop,
    StdDevSamp,
}

impl AccumulatorKind {
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "$sum" => AccumulatorKind::Sum,
            "$avg" => AccumulatorKind::Avg,
            "$min" => AccumulatorKind::Min,
            "$max" => AccumulatorKind::Max,
            "$first" => AccumulatorKind::First,
            "$last" => AccumulatorKind::Last,
            "$push" => AccumulatorKind::Push,
            "$addToSet" => AccumulatorKind::AddToSet,
            "$count" => AccumulatorKind::Count,
            "$stdDevPop" => AccumulatorKind::StdDevPop,
            "$stdDevSamp" => AccumulatorKind::StdDevSamp,
            _ => return None,
        })
    }
}

fn as_f64(b: &Bson) -> Option<f64> {
    match b {
        Bson::Double(d) => Some(*d),
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        _ => None,
    }
}

/// Running state for one accumulator instance over one group/window frame.
#[derive(Debug, Clone)]
pub struct Accumulator {
    kind: AccumulatorKind,
    sum: f64,
    sum_sq: f64,
    count: u64,
    numeric_count: u64,
    min: Option<Bson>,
    max: Option<Bson>,
    first: Option<Bson>,
    last: Option<Bson>,
    values: Vec<Bson>,
    seen_int_only: bool,
}

impl Accumulator {
    pub fn new(kind: AccumulatorKind) -> Self {
        Self {
            kind,
            sum: 0.0,
            sum_sq: 0.0,
            count: 0,
            numeric_count: 0,
            min: None,
            max: None,
            first: None,
            last: None,
            values: Vec::new(),
            seen_int_only: true,
        }
    }

    pub fn accumulate(&mut self, input: &Bson) -> Result<()> {
        self.count += 1;
        match self.kind {
            AccumulatorKind::Sum | AccumulatorKind::Avg | AccumulatorKind::StdDevPop | AccumulatorKind::StdDevSamp => {
                if let Some(n) = as_f64(input) {
                    if !matches!(input, Bson::Int32(_) | Bson::Int64(_)) {
                        self.seen_int_only = false;
                    }
                    self.sum += n;
                    self.sum_sq += n * n;
                    self.numeric_count += 1;
                }
                // Non-numeric input contributes zero to $sum and is excluded
                // from $avg/$stdDev's divisor.
            }
            AccumulatorKind::Min => {
                if self.min.is_none() || cmp_bson(input, self.min.as_ref().unwrap()) == Ordering::Less {
                    self.min = Some(input.clone());
                }
            }
            AccumulatorKind::Max => {
                if self.max.is_none() || cmp_bson(input, self.max.as_ref().unwrap()) == Ordering::Greater {
                    self.max = Some(input.clone());
                }
            }
            AccumulatorKind::First => {
                if self.first.is_none() {
                    self.first = Some(input.clone());
                }
            }
            AccumulatorKind::Last => {
                self.last = Some(input.clone());
            }
            AccumulatorKind::Push => {
                self.values.push(input.clone());
            }
            AccumulatorKind::AddToSet => {
                if !self.values.iter().any(|v| cmp_bson(v, input) == Ordering::Equal) {
                    self.values.push(input.clone());
                }
            }
            AccumulatorKind::Count => {}
        }
        Ok(())
    }

    pub fn finalize(&self) -> Bson {
        match self.kind {
            AccumulatorKind::Sum => {
                if self.seen_int_only && self.sum.fract() == 0.0 && self.sum.abs() < i64::MAX as f64 {
                    if self.sum.abs() <= i32::MAX as f64 {
                        Bson::Int32(self.sum as i32)
                    } else {
                        Bson::Int64(self.sum as i64)
                    }
                } else {
                    Bson::Double(self.sum)
                }
            }
            AccumulatorKind::Avg => {
                if self.numeric_count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(self.sum / self.numeric_count as f64)
                }
            }
            AccumulatorKind::Min => self.min.clone().unwrap_or(Bson::Null),
            AccumulatorKind::Max => self.max.clone().unwrap_or(Bson::Null),
            AccumulatorKind::First => self.first.clone().unwrap_or(Bson::Null),
            AccumulatorKind::Last => self.last.clone().unwrap_or(Bson::Null),
            AccumulatorKind::Push => Bson::Array(self.values.clone()),
            AccumulatorKind::AddToSet => Bson::Array(self.values.clone()),
            AccumulatorKind::Count => Bson::Int64(self.count as i64),
            AccumulatorKind::StdDevPop => {
                if self.numeric_count == 0 {
                    Bson::Null
                } else {
                    let n = self.numeric_count as f64;
                    let mean = self.sum / n;
                    let variance = (self.sum_sq / n) - mean * mean;
                    Bson::Double(variance.max(0.0).sqrt())
                }
            }
            AccumulatorKind::StdDevSamp => {
                if self.numeric_count < 2 {
                    Bson::Null
                } else {
                    let n = self.numeric_count as f64;
                    let mean = self.sum / n;
                    let variance = (self.sum_sq - n * mean * mean) / (n - 1.0);
                    Bson::Double(variance.max(0.0).sqrt())
                }
            }
        }
    }
}

/// Convenience one-shot reduction over a slice, used by `$bucket`/
/// `$bucketAuto` output specs and ad hoc window-engine calls that don't
/// need an incrementally-updated `Accumulator`.
pub fn run_accumulator(op: &str, inputs: &[Bson]) -> Result<Bson> {
    let kind = AccumulatorKind::parse(op).ok_or_else(|| DocPipeError::operator(op, "not an accumulator"))?;
    let mut acc = Accumulator::new(kind);
    for input in inputs {
        acc.accumulate(input)?;
    }
    Ok(acc.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_stays_integer_when_inputs_are_integers() {
        let result = run_accumulator("$sum", &[Bson::Int32(1), Bson::Int32(2), Bson::Int32(3)]).unwrap();
        assert_eq!(result, Bson::Int32(6));
    }

    #[test]
    fn sum_promotes_to_double_with_float_input() {
        let result = run_accumulator("$sum", &[Bson::Int32(1), Bson::Double(2.5)]).unwrap();
        assert_eq!(result, Bson::Double(3.5));
    }

    #[test]
    fn avg_of_empty_is_null() {
        let result = run_accumulator("$avg", &[]).unwrap();
        assert_eq!(result, Bson::Null);
    }

    #[test]
    fn avg_ignores_non_numeric_inputs_in_divisor() {
        let result = run_accumulator("$avg", &[Bson::Int32(1), Bson::Null, Bson::Int32(3)]).unwrap();
        assert_eq!(result, Bson::Double(2.0));
    }

    #[test]
    fn add_to_set_deduplicates() {
        let result = run_accumulator("$addToSet", &[Bson::Int32(1), Bson::Int32(1), Bson::Int32(2)]).unwrap();
        if let Bson::Array(arr) = result {
            assert_eq!(arr.len(), 2);
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn stddev_pop_matches_known_value() {
        let result = run_accumulator("$stdDevPop", &[Bson::Int32(2), Bson::Int32(4), Bson::Int32(4), Bson::Int32(4), Bson::Int32(5), Bson::Int32(5), Bson::Int32(7), Bson::Int32(9)]).unwrap();
        if let Bson::Double(d) = result {
            assert!((d - 2.0).abs() < 1e-9);
        } else {
            panic!("expected double");
        }
    }
}
