//! Lowering of [`Condition`] trees into `WHEN (...)` fragments.

use super::{CompareOp, Condition, FieldRef, Literal, Operand, PatternKind, RowRef};
use crate::error::{Error, Result};
use crate::security::{escape_like, quote_identifier, quote_literal};
use crate::trigger::TriggerOperation;
use serde::{Serialize, Serializer};
use std::fmt;

/// A compiled SQL boolean expression, valid inside `WHEN (...)`.
///
/// Only [`compile`] constructs one, so the text never carries a statement
/// separator or an unescaped literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlCondition(String);

impl SqlCondition {
    /// SQL text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the SQL text
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SqlCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SqlCondition {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for SqlCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Which row images a trigger's WHEN clause may reference.
///
/// PostgreSQL rejects `NEW` in a WHEN clause of a trigger that can fire on
/// DELETE, and `OLD` for one that can fire on INSERT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowAccess {
    /// `NEW` may be referenced
    pub new: bool,
    /// `OLD` may be referenced
    pub old: bool,
}

impl RowAccess {
    /// Both images available (UPDATE-only triggers)
    pub const BOTH: Self = Self {
        new: true,
        old: true,
    };

    /// Row images available to a trigger firing on `operations`
    pub fn for_operations(operations: &[TriggerOperation]) -> Self {
        Self {
            new: !operations.contains(&TriggerOperation::Delete),
            old: !operations.contains(&TriggerOperation::Insert),
        }
    }

    fn allows(self, row: RowRef) -> bool {
        match row {
            RowRef::New => self.new,
            RowRef::Old => self.old,
        }
    }
}

/// Compile a condition into a SQL boolean fragment.
///
/// Fails closed with [`Error::UnsupportedExpression`] for anything that cannot
/// be expressed faithfully: a row image the trigger cannot see, comparisons
/// between two constants, ordering against NULL, non-finite numbers, empty
/// connectives, NUL bytes and non-literal patterns.
pub fn compile(condition: &Condition, access: RowAccess) -> Result<SqlCondition> {
    let mut out = String::new();
    render(condition, access, &mut out)?;
    Ok(SqlCondition(out))
}

fn render(condition: &Condition, access: RowAccess, out: &mut String) -> Result<()> {
    match condition {
        Condition::Compare { left, op, right } => render_compare(left, *op, right, access, out),
        Condition::Pattern {
            field,
            kind,
            pattern,
        } => {
            let Operand::Literal(Literal::String(text)) = pattern else {
                return Err(Error::unsupported(
                    "string pattern must be a string literal",
                ));
            };
            check_text(text)?;
            out.push_str(&column(field, access)?);
            out.push_str(" LIKE ");
            let escaped = quote_literal(&escape_like(text));
            match kind {
                PatternKind::Contains => {
                    out.push_str(&format!("('%' || {} || '%')", escaped));
                }
                PatternKind::StartsWith => out.push_str(&format!("({} || '%')", escaped)),
                PatternKind::EndsWith => out.push_str(&format!("('%' || {})", escaped)),
            }
            Ok(())
        }
        Condition::Changed(name) => {
            if !(access.new && access.old) {
                return Err(Error::unsupported(format!(
                    "changed(\"{}\") needs both NEW and OLD, which only UPDATE triggers have",
                    name
                )));
            }
            let new = column(&super::new_field(name.clone()), access)?;
            let old = column(&super::old_field(name.clone()), access)?;
            out.push_str(&format!("{} IS DISTINCT FROM {}", new, old));
            Ok(())
        }
        Condition::IsTrue(field) => {
            out.push_str(&column(field, access)?);
            out.push_str(" IS TRUE");
            Ok(())
        }
        Condition::And(items) => render_connective(items, "AND", access, out),
        Condition::Or(items) => render_connective(items, "OR", access, out),
        Condition::Not(inner) => {
            out.push_str("NOT (");
            render(inner, access, out)?;
            out.push(')');
            Ok(())
        }
    }
}

fn render_connective(
    items: &[Condition],
    keyword: &str,
    access: RowAccess,
    out: &mut String,
) -> Result<()> {
    if items.is_empty() {
        return Err(Error::unsupported(format!("empty {} group", keyword)));
    }

    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(' ');
            out.push_str(keyword);
            out.push(' ');
        }
        // A lone child needs no grouping; nested groups always do.
        let group = items.len() > 1 && matches!(item, Condition::And(_) | Condition::Or(_));
        if group {
            out.push('(');
        }
        render(item, access, out)?;
        if group {
            out.push(')');
        }
    }
    Ok(())
}

fn render_compare(
    left: &Operand,
    op: CompareOp,
    right: &Operand,
    access: RowAccess,
    out: &mut String,
) -> Result<()> {
    // Normalize to field-first so constants always sit on the right.
    let (field, op, other) = match (left, right) {
        (Operand::Field(f), other) => (f, op, other),
        (Operand::Literal(_), Operand::Field(f)) => (f, op.flipped(), left),
        (Operand::Literal(_), Operand::Literal(_)) => {
            return Err(Error::unsupported(
                "comparison between two constants does not reference NEW or OLD",
            ));
        }
    };
    let lhs = column(field, access)?;

    match other {
        Operand::Field(rhs) => {
            let rhs = column(rhs, access)?;
            let sql_op = match op {
                CompareOp::Eq => "IS NOT DISTINCT FROM",
                CompareOp::Ne => "IS DISTINCT FROM",
                ordering => ordering.sql(),
            };
            out.push_str(&format!("{} {} {}", lhs, sql_op, rhs));
        }
        Operand::Literal(Literal::Null) => match op {
            CompareOp::Eq => out.push_str(&format!("{} IS NULL", lhs)),
            CompareOp::Ne => out.push_str(&format!("{} IS NOT NULL", lhs)),
            ordering => {
                return Err(Error::unsupported(format!(
                    "ordering comparison '{}' against null",
                    ordering.sql()
                )));
            }
        },
        Operand::Literal(lit) => {
            out.push_str(&format!("{} {} {}", lhs, op.sql(), literal(lit)?));
        }
    }
    Ok(())
}

fn column(field: &FieldRef, access: RowAccess) -> Result<String> {
    if field.column.is_empty() {
        return Err(Error::unsupported("empty column name"));
    }
    if field.column.contains('\0') {
        return Err(Error::unsupported("column name contains a NUL byte"));
    }
    if !access.allows(field.row) {
        return Err(Error::unsupported(format!(
            "{}.{} is not available for this trigger's operations",
            field.row, field.column
        )));
    }
    Ok(format!("{}.{}", field.row, quote_identifier(&field.column)))
}

fn literal(lit: &Literal) -> Result<String> {
    match lit {
        Literal::Null => Ok("NULL".to_string()),
        Literal::Bool(true) => Ok("TRUE".to_string()),
        Literal::Bool(false) => Ok("FALSE".to_string()),
        Literal::Int(n) => Ok(n.to_string()),
        Literal::Float(n) if n.is_finite() => {
            let text = n.to_string();
            // Keep floats typed as numeric even when integral.
            if text.contains('.') {
                Ok(text)
            } else {
                Ok(format!("{}.0", text))
            }
        }
        Literal::Float(n) => Err(Error::unsupported(format!("non-finite number {}", n))),
        Literal::String(s) => {
            check_text(s)?;
            Ok(quote_literal(s))
        }
    }
}

fn check_text(s: &str) -> Result<()> {
    if s.contains('\0') {
        return Err(Error::unsupported("string literal contains a NUL byte"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{changed, new_field, old_field};

    #[test]
    fn test_literal_rendering() {
        assert_eq!(literal(&Literal::Float(2.0)).unwrap(), "2.0");
        assert_eq!(literal(&Literal::Float(-0.5)).unwrap(), "-0.5");
        assert_eq!(literal(&Literal::Int(-7)).unwrap(), "-7");
        assert!(literal(&Literal::Float(f64::NAN)).is_err());
        assert!(literal(&Literal::Float(f64::INFINITY)).is_err());
    }

    #[test]
    fn test_access_for_operations() {
        let insert = RowAccess::for_operations(&[TriggerOperation::Insert]);
        assert!(insert.new && !insert.old);

        let delete = RowAccess::for_operations(&[TriggerOperation::Delete]);
        assert!(!delete.new && delete.old);

        let mixed = RowAccess::for_operations(&[
            TriggerOperation::Insert,
            TriggerOperation::Update,
            TriggerOperation::Delete,
        ]);
        assert!(!mixed.new && !mixed.old);
    }

    #[test]
    fn test_literal_on_left_is_flipped() {
        let cond = Condition::Compare {
            left: Operand::Literal(Literal::Int(10)),
            op: CompareOp::Lt,
            right: Operand::Field(new_field("qty")),
        };
        let sql = compile(&cond, RowAccess::BOTH).unwrap();
        assert_eq!(sql.as_str(), r#"NEW."qty" > 10"#);
    }

    #[test]
    fn test_nested_groups() {
        let cond = new_field("a")
            .eq(1)
            .and(new_field("b").eq(2).or(new_field("c").eq(3)));
        let sql = compile(&cond, RowAccess::BOTH).unwrap();
        assert_eq!(
            sql.as_str(),
            r#"NEW."a" = 1 AND (NEW."b" = 2 OR NEW."c" = 3)"#
        );
    }

    #[test]
    fn test_changed_requires_both_rows() {
        let insert = RowAccess::for_operations(&[TriggerOperation::Insert]);
        assert!(compile(&changed("status"), insert).is_err());
        assert!(compile(&old_field("status").eq("x"), insert).is_err());
    }
}
