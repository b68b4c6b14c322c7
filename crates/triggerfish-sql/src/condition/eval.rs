//! Client-side evaluation with SQL semantics.
//!
//! A missing column, a missing row image and JSON `null` are all SQL NULL.
//! Comparisons involving NULL are unknown, connectives follow Kleene logic,
//! and a top-level unknown does not match, exactly like a trigger's WHEN.

use super::{CompareOp, Condition, FieldRef, Literal, Operand, PatternKind, RowRef};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A row image as delivered in a notification
pub type Row = Map<String, Value>;

impl Condition {
    /// Whether the trigger would fire for these row images
    pub fn matches(&self, new: Option<&Row>, old: Option<&Row>) -> bool {
        self.evaluate(new, old) == Some(true)
    }

    /// Three-valued evaluation; `None` is SQL unknown
    pub fn evaluate(&self, new: Option<&Row>, old: Option<&Row>) -> Option<bool> {
        let rows = Rows { new, old };
        eval(self, &rows)
    }
}

struct Rows<'a> {
    new: Option<&'a Row>,
    old: Option<&'a Row>,
}

impl Rows<'_> {
    fn get(&self, field: &FieldRef) -> Option<&Value> {
        let row = match field.row {
            RowRef::New => self.new,
            RowRef::Old => self.old,
        }?;
        row.get(&field.column).filter(|v| !v.is_null())
    }
}

fn eval(condition: &Condition, rows: &Rows<'_>) -> Option<bool> {
    match condition {
        Condition::Compare { left, op, right } => compare(left, *op, right, rows),
        Condition::Pattern {
            field,
            kind,
            pattern,
        } => {
            let Operand::Literal(Literal::String(pattern)) = pattern else {
                return None;
            };
            let value = rows.get(field)?.as_str()?;
            Some(match kind {
                PatternKind::Contains => value.contains(pattern.as_str()),
                PatternKind::StartsWith => value.starts_with(pattern.as_str()),
                PatternKind::EndsWith => value.ends_with(pattern.as_str()),
            })
        }
        Condition::Changed(column) => {
            let new = rows.get(&super::new_field(column.clone()));
            let old = rows.get(&super::old_field(column.clone()));
            Some(!not_distinct(new, old))
        }
        Condition::IsTrue(field) => Some(matches!(rows.get(field), Some(Value::Bool(true)))),
        Condition::And(items) => {
            let mut result = Some(true);
            for item in items {
                match eval(item, rows) {
                    Some(false) => return Some(false),
                    None => result = None,
                    Some(true) => {}
                }
            }
            result
        }
        Condition::Or(items) => {
            let mut result = Some(false);
            for item in items {
                match eval(item, rows) {
                    Some(true) => return Some(true),
                    None => result = None,
                    Some(false) => {}
                }
            }
            result
        }
        Condition::Not(inner) => eval(inner, rows).map(|b| !b),
    }
}

fn compare(left: &Operand, op: CompareOp, right: &Operand, rows: &Rows<'_>) -> Option<bool> {
    match (left, right) {
        (Operand::Field(a), Operand::Field(b)) => {
            let (a, b) = (rows.get(a), rows.get(b));
            match op {
                CompareOp::Eq => Some(not_distinct(a, b)),
                CompareOp::Ne => Some(!not_distinct(a, b)),
                ordering => apply(ordering, order(a?, b?)?),
            }
        }
        (Operand::Field(f), Operand::Literal(lit)) => compare_literal(rows.get(f), op, lit),
        (Operand::Literal(lit), Operand::Field(f)) => {
            compare_literal(rows.get(f), op.flipped(), lit)
        }
        (Operand::Literal(_), Operand::Literal(_)) => None,
    }
}

fn compare_literal(value: Option<&Value>, op: CompareOp, lit: &Literal) -> Option<bool> {
    if let Literal::Null = lit {
        return match op {
            CompareOp::Eq => Some(value.is_none()),
            CompareOp::Ne => Some(value.is_some()),
            _ => None,
        };
    }
    let value = value?;
    let lit = literal_value(lit);
    match op {
        CompareOp::Eq => order(value, &lit).map(|o| o == Ordering::Equal),
        CompareOp::Ne => order(value, &lit).map(|o| o != Ordering::Equal),
        ordering => apply(ordering, order(value, &lit)?),
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::from(*n),
        Literal::Float(n) => Value::from(*n),
        Literal::String(s) => Value::String(s.clone()),
    }
}

fn apply(op: CompareOp, ord: Ordering) -> Option<bool> {
    Some(match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    })
}

/// `IS NOT DISTINCT FROM`
fn not_distinct(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => match order(a, b) {
            Some(o) => o == Ordering::Equal,
            None => a == b,
        },
        _ => false,
    }
}

/// Ordering between two non-null values of compatible type
fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{changed, new_field, old_field};
    use serde_json::json;

    fn row(v: Value) -> Row {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_null_comparison_is_unknown() {
        let new = row(json!({"status": null}));
        let cond = new_field("status").eq("paid");
        assert_eq!(cond.evaluate(Some(&new), None), None);
        assert!(!cond.matches(Some(&new), None));
        // NOT unknown is still unknown
        assert!(!(!cond).matches(Some(&new), None));
    }

    #[test]
    fn test_kleene_or() {
        let new = row(json!({"a": null, "b": 1}));
        let cond = new_field("a").eq(1).or(new_field("b").eq(1));
        assert_eq!(cond.evaluate(Some(&new), None), Some(true));

        let cond = new_field("a").eq(1).and(new_field("b").eq(2));
        assert_eq!(cond.evaluate(Some(&new), None), Some(false));
    }

    #[test]
    fn test_changed_handles_null_transitions() {
        let old = row(json!({"status": null}));
        let new = row(json!({"status": "paid"}));
        assert!(changed("status").matches(Some(&new), Some(&old)));
        assert!(!changed("status").matches(Some(&old), Some(&old)));
    }

    #[test]
    fn test_mixed_number_ordering() {
        let new = row(json!({"total": 99.5}));
        assert!(new_field("total").lt(100).matches(Some(&new), None));
        assert!(!new_field("total").ge(100).matches(Some(&new), None));
    }

    #[test]
    fn test_field_equality_is_null_safe() {
        let new = row(json!({"a": null}));
        let old = row(json!({}));
        assert!(new_field("a").eq(old_field("a")).matches(Some(&new), Some(&old)));
    }

    #[test]
    fn test_is_true() {
        let new = row(json!({"active": true, "deleted": false}));
        assert!(new_field("active").is_true().matches(Some(&new), None));
        assert!(!new_field("deleted").is_true().matches(Some(&new), None));
        assert!(!new_field("missing").is_true().matches(Some(&new), None));
    }
}
