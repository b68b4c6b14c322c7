//! Trigger conditions.
//!
//! A [`Condition`] is a small, closed expression tree over the trigger's row
//! images (`NEW` and `OLD`). It is built with the combinator API in this module
//! or parsed from arrow-function source with [`parse_predicate`], compiled into a
//! `WHEN (...)` fragment with [`compile`], and can be evaluated client side with
//! [`Condition::matches`].
//!
//! ```
//! use triggerfish_sql::condition::{changed, compile, new_field, RowAccess};
//!
//! let cond = changed("status").and(new_field("total").ge(100));
//! let sql = compile(&cond, RowAccess::BOTH).unwrap();
//! assert_eq!(
//!     sql.as_str(),
//!     r#"NEW."status" IS DISTINCT FROM OLD."status" AND NEW."total" >= 100"#
//! );
//! ```

mod compile;
mod eval;
mod parser;

pub use compile::{compile, RowAccess, SqlCondition};
pub use eval::Row;
pub use parser::parse_predicate;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Row image referenced by a field read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowRef {
    /// After-image (`NEW`)
    New,
    /// Before-image (`OLD`)
    Old,
}

impl RowRef {
    /// SQL keyword for this row image
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Old => "OLD",
        }
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A column read on one of the row images
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    /// Row image
    pub row: RowRef,
    /// Column name
    pub column: String,
}

/// Field read on the after-image
pub fn new_field(column: impl Into<String>) -> FieldRef {
    FieldRef {
        row: RowRef::New,
        column: column.into(),
    }
}

/// Field read on the before-image
pub fn old_field(column: impl Into<String>) -> FieldRef {
    FieldRef {
        row: RowRef::Old,
        column: column.into(),
    }
}

/// The column's value differs between `OLD` and `NEW`, treating NULLs as comparable
pub fn changed(column: impl Into<String>) -> Condition {
    Condition::Changed(column.into())
}

/// Constant value in a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    /// SQL NULL (host `null` / `undefined`)
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point, must be finite
    Float(f64),
    /// Text
    String(String),
}

impl Literal {
    /// Short type label used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

/// Comparison operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Column read
    Field(FieldRef),
    /// Constant
    Literal(Literal),
}

impl From<FieldRef> for Operand {
    fn from(f: FieldRef) -> Self {
        Self::Field(f)
    }
}

impl From<Literal> for Operand {
    fn from(l: Literal) -> Self {
        Self::Literal(l)
    }
}

impl From<&str> for Operand {
    fn from(s: &str) -> Self {
        Self::Literal(Literal::String(s.to_string()))
    }
}

impl From<String> for Operand {
    fn from(s: String) -> Self {
        Self::Literal(Literal::String(s))
    }
}

impl From<bool> for Operand {
    fn from(b: bool) -> Self {
        Self::Literal(Literal::Bool(b))
    }
}

impl From<i32> for Operand {
    fn from(n: i32) -> Self {
        Self::Literal(Literal::Int(n as i64))
    }
}

impl From<i64> for Operand {
    fn from(n: i64) -> Self {
        Self::Literal(Literal::Int(n))
    }
}

impl From<f64> for Operand {
    fn from(n: f64) -> Self {
        Self::Literal(Literal::Float(n))
    }
}

impl<T: Into<Operand>> From<Option<T>> for Operand {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Literal(Literal::Null))
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// `=`, `==`, `===`
    Eq,
    /// `!=`, `!==`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// Operator with its operands swapped (`a < b` ⇔ `b > a`)
    pub const fn flipped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }

    /// Whether this is an ordering comparison
    pub const fn is_ordering(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    /// SQL operator for a value comparison
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// String pattern primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Substring match (`includes`)
    Contains,
    /// Prefix match (`startsWith`)
    StartsWith,
    /// Suffix match (`endsWith`)
    EndsWith,
}

/// A boolean condition over `NEW` / `OLD`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Condition {
    /// Binary comparison
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    /// String pattern test against a literal
    Pattern {
        field: FieldRef,
        kind: PatternKind,
        pattern: Operand,
    },
    /// `NEW.col IS DISTINCT FROM OLD.col`
    Changed(String),
    /// Bare boolean field read
    IsTrue(FieldRef),
    /// Conjunction
    And(Vec<Condition>),
    /// Disjunction
    Or(Vec<Condition>),
    /// Negation
    Not(Box<Condition>),
}

impl FieldRef {
    fn compare(self, op: CompareOp, right: impl Into<Operand>) -> Condition {
        Condition::Compare {
            left: Operand::Field(self),
            op,
            right: right.into(),
        }
    }

    /// `self = right`
    pub fn eq(self, right: impl Into<Operand>) -> Condition {
        self.compare(CompareOp::Eq, right)
    }

    /// `self <> right`
    pub fn ne(self, right: impl Into<Operand>) -> Condition {
        self.compare(CompareOp::Ne, right)
    }

    /// `self < right`
    pub fn lt(self, right: impl Into<Operand>) -> Condition {
        self.compare(CompareOp::Lt, right)
    }

    /// `self <= right`
    pub fn le(self, right: impl Into<Operand>) -> Condition {
        self.compare(CompareOp::Le, right)
    }

    /// `self > right`
    pub fn gt(self, right: impl Into<Operand>) -> Condition {
        self.compare(CompareOp::Gt, right)
    }

    /// `self >= right`
    pub fn ge(self, right: impl Into<Operand>) -> Condition {
        self.compare(CompareOp::Ge, right)
    }

    /// `self IS NULL`
    pub fn is_null(self) -> Condition {
        self.compare(CompareOp::Eq, Literal::Null)
    }

    /// `self IS NOT NULL`
    pub fn is_not_null(self) -> Condition {
        self.compare(CompareOp::Ne, Literal::Null)
    }

    /// `self IS TRUE`
    pub fn is_true(self) -> Condition {
        Condition::IsTrue(self)
    }

    fn pattern(self, kind: PatternKind, pattern: impl Into<Operand>) -> Condition {
        Condition::Pattern {
            field: self,
            kind,
            pattern: pattern.into(),
        }
    }

    /// Substring test
    pub fn contains(self, pattern: impl Into<Operand>) -> Condition {
        self.pattern(PatternKind::Contains, pattern)
    }

    /// Prefix test
    pub fn starts_with(self, pattern: impl Into<Operand>) -> Condition {
        self.pattern(PatternKind::StartsWith, pattern)
    }

    /// Suffix test
    pub fn ends_with(self, pattern: impl Into<Operand>) -> Condition {
        self.pattern(PatternKind::EndsWith, pattern)
    }
}

impl Condition {
    /// Conjunction of all conditions
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::And(conditions.into_iter().collect())
    }

    /// Disjunction of all conditions
    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::Or(conditions.into_iter().collect())
    }

    /// `self AND other`, extending an existing conjunction
    pub fn and(self, other: Condition) -> Self {
        match self {
            Self::And(mut items) => {
                items.push(other);
                Self::And(items)
            }
            lhs => Self::And(vec![lhs, other]),
        }
    }

    /// `self OR other`, extending an existing disjunction
    pub fn or(self, other: Condition) -> Self {
        match self {
            Self::Or(mut items) => {
                items.push(other);
                Self::Or(items)
            }
            lhs => Self::Or(vec![lhs, other]),
        }
    }

    /// Every field read in the condition, in source order
    pub fn fields(&self) -> Vec<FieldRef> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut Vec<FieldRef>) {
        match self {
            Self::Compare { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Field(f) = operand {
                        out.push(f.clone());
                    }
                }
            }
            Self::Pattern { field, pattern, .. } => {
                out.push(field.clone());
                if let Operand::Field(f) = pattern {
                    out.push(f.clone());
                }
            }
            Self::Changed(column) => {
                out.push(new_field(column.clone()));
                out.push(old_field(column.clone()));
            }
            Self::IsTrue(f) => out.push(f.clone()),
            Self::And(items) | Self::Or(items) => {
                items.iter().for_each(|c| c.collect_fields(out));
            }
            Self::Not(inner) => inner.collect_fields(out),
        }
    }
}

impl std::ops::Not for Condition {
    type Output = Condition;

    fn not(self) -> Self::Output {
        Condition::Not(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_flattens() {
        let c = new_field("a")
            .eq(1)
            .and(new_field("b").eq(2))
            .and(new_field("c").eq(3));
        match c {
            Condition::And(items) => assert_eq!(items.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_option_operand() {
        let none: Option<&str> = None;
        assert_eq!(Operand::from(none), Operand::Literal(Literal::Null));
        assert_eq!(
            Operand::from(Some("x")),
            Operand::Literal(Literal::String("x".into()))
        );
    }

    #[test]
    fn test_fields_include_changed_pair() {
        let c = changed("status").or(!old_field("archived").is_true());
        let fields = c.fields();
        assert_eq!(
            fields,
            vec![new_field("status"), old_field("status"), old_field("archived")]
        );
    }

    #[test]
    fn test_flipped() {
        assert_eq!(CompareOp::Lt.flipped(), CompareOp::Gt);
        assert_eq!(CompareOp::Ge.flipped(), CompareOp::Le);
        assert_eq!(CompareOp::Eq.flipped(), CompareOp::Eq);
    }

    #[test]
    fn test_serde_shape() {
        let c = new_field("status").eq("paid");
        let json = serde_json::to_value(&c).unwrap();
        let back: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }
}
