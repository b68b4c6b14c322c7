//! Trigger specifications and their builder.
//!
//! A [`TriggerBuilder`] collects timing, operations, watched columns, an
//! optional condition and a target function, then validates everything in
//! one pass before producing an immutable [`TriggerSpec`]. Nothing reaches
//! the database until a spec exists.

use crate::catalog::ModelCatalog;
use crate::condition::{compile, parse_predicate, Condition, RowAccess, SqlCondition};
use crate::error::{RequiredField, Result, ValidationError};
use crate::security::{validate_channel, validate_identifier};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Schema used when neither the builder nor the catalog names one
pub const DEFAULT_SCHEMA: &str = "public";

/// When the trigger fires relative to the row operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerTiming {
    /// BEFORE
    #[serde(rename = "BEFORE")]
    Before,
    /// AFTER
    #[serde(rename = "AFTER")]
    After,
    /// INSTEAD OF (views only)
    #[serde(rename = "INSTEAD OF")]
    InsteadOf,
}

impl TriggerTiming {
    /// SQL keyword(s)
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Before => "BEFORE",
            Self::After => "AFTER",
            Self::InsteadOf => "INSTEAD OF",
        }
    }
}

impl fmt::Display for TriggerTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Row operation a trigger fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerOperation {
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// TRUNCATE
    Truncate,
}

impl TriggerOperation {
    /// All operations
    pub const ALL: [TriggerOperation; 4] = [Self::Insert, Self::Update, Self::Delete, Self::Truncate];

    /// SQL keyword (also the `TG_OP` value)
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Truncate => "TRUNCATE",
        }
    }
}

impl fmt::Display for TriggerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "TRUNCATE" => Ok(Self::Truncate),
            other => Err(format!("unknown trigger operation '{}'", other)),
        }
    }
}

/// Firing granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerLevel {
    /// FOR EACH ROW
    #[default]
    Row,
    /// FOR EACH STATEMENT
    Statement,
}

impl TriggerLevel {
    /// SQL keyword
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Row => "ROW",
            Self::Statement => "STATEMENT",
        }
    }
}

/// Function executed by the trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFunction {
    /// Schema holding the function
    pub schema: String,
    /// Function name
    pub name: String,
    /// Positional string arguments (`TG_ARGV`)
    pub args: Vec<String>,
}

/// A validated trigger definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerSpec {
    /// Logical model name
    pub model: String,
    /// Table schema
    pub schema: String,
    /// Table name
    pub table: String,
    /// Trigger name, unique per table
    pub name: String,
    /// Timing
    pub timing: TriggerTiming,
    /// Operations in declaration order, without duplicates
    pub operations: Vec<TriggerOperation>,
    /// Row or statement level
    pub level: TriggerLevel,
    /// Watched columns (`UPDATE OF ...`)
    pub columns: Vec<String>,
    /// Compiled WHEN fragment
    pub condition: Option<SqlCondition>,
    /// Condition the fragment was compiled from
    pub predicate: Option<Condition>,
    /// Target function
    pub function: TriggerFunction,
    /// Whether the target function is generated and owned by this trigger
    pub managed: bool,
    /// Notification channel the target publishes on
    pub channel: Option<String>,
}

impl TriggerSpec {
    /// `schema.table.name`
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }

    /// Whether the trigger fires on `op`
    pub fn fires_on(&self, op: TriggerOperation) -> bool {
        self.operations.contains(&op)
    }

    /// Row images available to the condition
    pub fn row_access(&self) -> RowAccess {
        RowAccess::for_operations(&self.operations)
    }
}

#[derive(Debug, Clone)]
enum Predicate {
    Ast(Condition),
    Source(String),
}

#[derive(Debug, Clone)]
enum Target {
    Managed,
    Function {
        schema: Option<String>,
        name: String,
        args: Vec<String>,
    },
}

/// Builder for [`TriggerSpec`]
///
/// ```
/// use triggerfish_sql::condition::changed;
/// use triggerfish_sql::trigger::TriggerBuilder;
///
/// let spec = TriggerBuilder::new()
///     .model("orders")
///     .name("order_status")
///     .after()
///     .on_update()
///     .watch_columns(["status"])
///     .when(changed("status"))
///     .notify()
///     .build()
///     .unwrap();
///
/// assert_eq!(spec.channel.as_deref(), Some("orders_order_status"));
/// assert_eq!(spec.function.name, "orders_order_status_notify");
/// ```
#[derive(Debug, Clone, Default)]
pub struct TriggerBuilder {
    model: Option<String>,
    schema: Option<String>,
    default_schema: Option<String>,
    table: Option<String>,
    name: Option<String>,
    timing: Option<TriggerTiming>,
    operations: Vec<TriggerOperation>,
    level: TriggerLevel,
    columns: Vec<String>,
    predicate: Option<Predicate>,
    target: Option<Target>,
    channel: Option<String>,
}

impl TriggerBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical model the trigger is attached to
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Table schema, overriding the catalog
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Schema used when neither [`schema`](Self::schema) nor the catalog names one
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    /// Physical table, overriding the catalog
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Trigger name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set timing
    pub fn timing(mut self, timing: TriggerTiming) -> Self {
        self.timing = Some(timing);
        self
    }

    /// BEFORE
    pub fn before(self) -> Self {
        self.timing(TriggerTiming::Before)
    }

    /// AFTER
    pub fn after(self) -> Self {
        self.timing(TriggerTiming::After)
    }

    /// INSTEAD OF
    pub fn instead_of(self) -> Self {
        self.timing(TriggerTiming::InsteadOf)
    }

    /// Add operations
    pub fn on(mut self, operations: impl IntoIterator<Item = TriggerOperation>) -> Self {
        for op in operations {
            if !self.operations.contains(&op) {
                self.operations.push(op);
            }
        }
        self
    }

    /// Fire on INSERT
    pub fn on_insert(self) -> Self {
        self.on([TriggerOperation::Insert])
    }

    /// Fire on UPDATE
    pub fn on_update(self) -> Self {
        self.on([TriggerOperation::Update])
    }

    /// Fire on DELETE
    pub fn on_delete(self) -> Self {
        self.on([TriggerOperation::Delete])
    }

    /// Fire on TRUNCATE
    pub fn on_truncate(self) -> Self {
        self.on([TriggerOperation::Truncate])
    }

    /// FOR EACH ROW (default)
    pub fn for_each_row(mut self) -> Self {
        self.level = TriggerLevel::Row;
        self
    }

    /// FOR EACH STATEMENT
    pub fn for_each_statement(mut self) -> Self {
        self.level = TriggerLevel::Statement;
        self
    }

    /// Only fire UPDATE when one of these columns is a SET target
    pub fn watch_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if !self.columns.contains(&column) {
                self.columns.push(column);
            }
        }
        self
    }

    /// WHEN condition
    pub fn when(mut self, condition: Condition) -> Self {
        self.predicate = Some(Predicate::Ast(condition));
        self
    }

    /// WHEN condition given as predicate source, parsed at build time
    pub fn when_source(mut self, source: impl Into<String>) -> Self {
        self.predicate = Some(Predicate::Source(source.into()));
        self
    }

    /// Generate a notify function publishing on the default channel
    pub fn notify(mut self) -> Self {
        self.target = Some(Target::Managed);
        self
    }

    /// Generate a notify function publishing on `channel`
    pub fn notify_channel(mut self, channel: impl Into<String>) -> Self {
        self.target = Some(Target::Managed);
        self.channel = Some(channel.into());
        self
    }

    /// Execute an existing function in the trigger's schema
    pub fn execute<I, S>(mut self, function: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = Some(Target::Function {
            schema: None,
            name: function.into(),
            args: args.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Execute an existing function in another schema
    pub fn execute_in<I, S>(
        mut self,
        schema: impl Into<String>,
        function: impl Into<String>,
        args: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = Some(Target::Function {
            schema: Some(schema.into()),
            name: function.into(),
            args: args.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Channel a user-supplied function publishes on
    pub fn listen_on(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Validate without a catalog; the model name doubles as table name
    pub fn build(self) -> Result<TriggerSpec> {
        self.finish(None)
    }

    /// Validate against a catalog
    pub fn build_with(self, catalog: &dyn ModelCatalog) -> Result<TriggerSpec> {
        self.finish(Some(catalog))
    }

    fn finish(self, catalog: Option<&dyn ModelCatalog>) -> Result<TriggerSpec> {
        let model = self.model.ok_or(ValidationError::MissingField(RequiredField::Model))?;
        let name = self.name.ok_or(ValidationError::MissingField(RequiredField::Name))?;
        let timing = self.timing.ok_or(ValidationError::MissingField(RequiredField::Timing))?;
        if self.operations.is_empty() {
            return Err(ValidationError::MissingField(RequiredField::Operations).into());
        }
        let target = self
            .target
            .ok_or(ValidationError::MissingField(RequiredField::Function))?;

        let info = match catalog {
            Some(catalog) => Some(
                catalog
                    .resolve(&model)
                    .ok_or_else(|| ValidationError::UnknownModel(model.clone()))?,
            ),
            None => None,
        };
        let schema = self
            .schema
            .or_else(|| info.as_ref().map(|i| i.schema.clone()))
            .or(self.default_schema)
            .unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
        let table = self
            .table
            .or_else(|| info.as_ref().map(|i| i.table.clone()))
            .unwrap_or_else(|| model.clone());

        validate_identifier(&schema)?;
        validate_identifier(&table)?;
        validate_identifier(&name)?;
        for column in &self.columns {
            validate_identifier(column)?;
        }

        let operations = self.operations;
        let level = self.level;
        if !self.columns.is_empty() && !operations.contains(&TriggerOperation::Update) {
            return Err(ValidationError::WatchedColumnsRequireUpdate.into());
        }
        if operations.contains(&TriggerOperation::Truncate) && level == TriggerLevel::Row {
            return Err(ValidationError::TruncateRequiresStatementLevel.into());
        }
        if timing == TriggerTiming::InsteadOf {
            if level != TriggerLevel::Row {
                return Err(ValidationError::InsteadOfRequiresRowLevel.into());
            }
            if self.predicate.is_some() {
                return Err(ValidationError::InsteadOfRestriction("WHEN condition").into());
            }
            if !self.columns.is_empty() {
                return Err(ValidationError::InsteadOfRestriction("column list").into());
            }
        }
        if self.predicate.is_some() && level == TriggerLevel::Statement {
            return Err(ValidationError::ConditionRequiresRowLevel.into());
        }

        let (function, managed, channel) = match target {
            Target::Managed => {
                let function_name = format!("{}_{}_notify", table, name);
                validate_identifier(&function_name)?;
                let channel = self
                    .channel
                    .unwrap_or_else(|| format!("{}_{}", table, name));
                validate_channel(&channel)?;
                let function = TriggerFunction {
                    schema: schema.clone(),
                    name: function_name,
                    args: Vec::new(),
                };
                (function, true, Some(channel))
            }
            Target::Function {
                schema: fn_schema,
                name: fn_name,
                args,
            } => {
                let fn_schema = fn_schema.unwrap_or_else(|| schema.clone());
                validate_identifier(&fn_schema)?;
                validate_identifier(&fn_name)?;
                if let Some(channel) = &self.channel {
                    validate_channel(channel)?;
                }
                let function = TriggerFunction {
                    schema: fn_schema,
                    name: fn_name,
                    args,
                };
                (function, false, self.channel)
            }
        };

        let predicate = match self.predicate {
            Some(Predicate::Ast(c)) => Some(c),
            Some(Predicate::Source(src)) => Some(parse_predicate(&src)?),
            None => None,
        };
        let condition = predicate
            .as_ref()
            .map(|p| compile(p, RowAccess::for_operations(&operations)))
            .transpose()?;

        if let Some(info) = &info {
            info.check_columns(&model, &self.columns)?;
            if let Some(p) = &predicate {
                info.check_condition(&model, p)?;
            }
        }

        Ok(TriggerSpec {
            model,
            schema,
            table,
            name,
            timing,
            operations,
            level,
            columns: self.columns,
            condition,
            predicate,
            function,
            managed,
            channel,
        })
    }
}
