//! Model catalog boundary.
//!
//! The schema layer that owns model definitions implements [`ModelCatalog`];
//! the trigger builder uses it to resolve a model to its table and to check
//! watched columns and predicate field references. Nothing here talks to the
//! database.

use crate::condition::{Condition, FieldRef, Literal, Operand};
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Logical field type as reported by the schema layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// text / varchar / char
    Text,
    /// smallint / integer / bigint
    Integer,
    /// real / double / numeric
    Float,
    /// boolean
    Boolean,
    /// date / timestamp / timestamptz
    Timestamp,
    /// json / jsonb
    Json,
    /// Anything else; never type-checked
    Other(String),
}

impl FieldType {
    fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    fn is_unchecked(&self) -> bool {
        matches!(self, Self::Json | Self::Other(_))
    }

    fn accepts(&self, literal: &Literal) -> bool {
        if self.is_unchecked() {
            return true;
        }
        match literal {
            Literal::Null => true,
            Literal::Bool(_) => *self == Self::Boolean,
            Literal::Int(_) => self.is_numeric(),
            Literal::Float(_) => self.is_numeric(),
            Literal::String(_) => matches!(self, Self::Text | Self::Timestamp),
        }
    }

    fn comparable_with(&self, other: &FieldType) -> bool {
        self.is_unchecked()
            || other.is_unchecked()
            || self == other
            || (self.is_numeric() && other.is_numeric())
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::Boolean => write!(f, "boolean"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::Json => write!(f, "json"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

/// A model field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Column name
    pub name: String,
    /// Logical type
    pub field_type: FieldType,
}

/// Physical location and fields of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Schema
    pub schema: String,
    /// Table
    pub table: String,
    /// Fields
    pub fields: Vec<FieldInfo>,
}

impl ModelInfo {
    /// Create a model with no fields
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field
    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldInfo {
            name: name.into(),
            field_type,
        });
        self
    }

    /// Look up a field by column name
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check that every watched column exists
    pub fn check_columns(&self, model: &str, columns: &[String]) -> Result<(), ValidationError> {
        for column in columns {
            self.require(model, column)?;
        }
        Ok(())
    }

    /// Check field references and literal types in a condition
    pub fn check_condition(&self, model: &str, condition: &Condition) -> Result<(), ValidationError> {
        for field in condition.fields() {
            self.require(model, &field.column)?;
        }
        self.check_types(condition)
    }

    fn require(&self, model: &str, column: &str) -> Result<&FieldInfo, ValidationError> {
        self.field(column)
            .ok_or_else(|| ValidationError::UnknownColumn {
                model: model.to_string(),
                column: column.to_string(),
            })
    }

    fn type_of(&self, field: &FieldRef) -> Option<&FieldType> {
        self.field(&field.column).map(|f| &f.field_type)
    }

    fn check_types(&self, condition: &Condition) -> Result<(), ValidationError> {
        match condition {
            Condition::Compare { left, right, .. } => match (left, right) {
                (Operand::Field(f), Operand::Literal(lit))
                | (Operand::Literal(lit), Operand::Field(f)) => self.check_literal(f, lit),
                (Operand::Field(a), Operand::Field(b)) => {
                    match (self.type_of(a), self.type_of(b)) {
                        (Some(ta), Some(tb)) if !ta.comparable_with(tb) => {
                            Err(ValidationError::TypeMismatch {
                                column: a.column.clone(),
                                expected: ta.to_string(),
                                found: format!("{} field '{}'", tb, b.column),
                            })
                        }
                        _ => Ok(()),
                    }
                }
                (Operand::Literal(_), Operand::Literal(_)) => Ok(()),
            },
            Condition::Pattern { field, .. } => match self.type_of(field) {
                Some(t) if !(t.is_unchecked() || *t == FieldType::Text) => {
                    Err(ValidationError::TypeMismatch {
                        column: field.column.clone(),
                        expected: t.to_string(),
                        found: "string pattern".to_string(),
                    })
                }
                _ => Ok(()),
            },
            Condition::IsTrue(field) => match self.type_of(field) {
                Some(t) if !(t.is_unchecked() || *t == FieldType::Boolean) => {
                    Err(ValidationError::TypeMismatch {
                        column: field.column.clone(),
                        expected: t.to_string(),
                        found: "boolean test".to_string(),
                    })
                }
                _ => Ok(()),
            },
            Condition::Changed(_) => Ok(()),
            Condition::And(items) | Condition::Or(items) => {
                items.iter().try_for_each(|c| self.check_types(c))
            }
            Condition::Not(inner) => self.check_types(inner),
        }
    }

    fn check_literal(&self, field: &FieldRef, literal: &Literal) -> Result<(), ValidationError> {
        match self.type_of(field) {
            Some(t) if !t.accepts(literal) => Err(ValidationError::TypeMismatch {
                column: field.column.clone(),
                expected: t.to_string(),
                found: literal.type_name().to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Resolves logical model names to tables and typed fields
pub trait ModelCatalog: Send + Sync {
    /// Resolve a model, `None` if unknown
    fn resolve(&self, model: &str) -> Option<ModelInfo>;
}

/// In-memory catalog
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    models: HashMap<String, ModelInfo>,
}

impl StaticCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model
    pub fn with_model(mut self, model: impl Into<String>, info: ModelInfo) -> Self {
        self.insert(model, info);
        self
    }

    /// Register or replace a model
    pub fn insert(&mut self, model: impl Into<String>, info: ModelInfo) {
        self.models.insert(model.into(), info);
    }
}

impl ModelCatalog for StaticCatalog {
    fn resolve(&self, model: &str) -> Option<ModelInfo> {
        self.models.get(model).cloned()
    }
}
