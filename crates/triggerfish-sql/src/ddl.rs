//! DDL rendering for trigger specifications.
//!
//! The managed notify function publishes one JSON envelope per firing:
//!
//! ```json
//! {"operation": "UPDATE", "timestamp": "2024-05-01T12:00:00.000000Z",
//!  "schema": "public", "table": "orders", "data": {"id": 1, "status": "paid"}}
//! ```
//!
//! DELETE publishes the before-image, TRUNCATE an empty object and every
//! other operation the after-image. `pg_notify` raises when the payload
//! exceeds 8000 bytes, failing the writing transaction.

use crate::security::{quote_identifier, quote_literal, quote_qualified};
use crate::trigger::{TriggerOperation, TriggerSpec};

/// Dollar-quote tag for generated function bodies
const BODY_TAG: &str = "$triggerfish$";

/// Renders the statements that install and remove one trigger
#[derive(Debug, Clone, Copy)]
pub struct TriggerDdl<'a> {
    spec: &'a TriggerSpec,
}

impl<'a> TriggerDdl<'a> {
    /// Create a renderer for `spec`
    pub fn new(spec: &'a TriggerSpec) -> Self {
        Self { spec }
    }

    /// Statements applied, in order and in one transaction, by setup.
    ///
    /// Dropping before creating makes setup repeatable against a database
    /// that already has the trigger.
    pub fn setup_statements(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(3);
        out.extend(self.create_function());
        out.push(self.drop_trigger());
        out.push(self.create_trigger());
        out
    }

    /// Statements applied, in order and in one transaction, by drop
    pub fn teardown_statements(&self) -> Vec<String> {
        let mut out = vec![self.drop_trigger()];
        out.extend(self.drop_function());
        out
    }

    /// `CREATE OR REPLACE FUNCTION` for a managed notify target
    pub fn create_function(&self) -> Option<String> {
        let spec = self.spec;
        if !spec.managed {
            return None;
        }
        let channel = spec.channel.as_deref()?;

        Some(format!(
            r#"CREATE OR REPLACE FUNCTION {function}() RETURNS trigger
LANGUAGE plpgsql AS {tag}
DECLARE
  row_image json;
BEGIN
  IF TG_OP = 'DELETE' THEN
    row_image := row_to_json(OLD);
  ELSIF TG_OP = 'TRUNCATE' THEN
    row_image := NULL;
  ELSE
    row_image := row_to_json(NEW);
  END IF;
  PERFORM pg_notify({channel}, json_build_object(
    'operation', TG_OP,
    'timestamp', to_char(clock_timestamp() AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US"Z"'),
    'schema', TG_TABLE_SCHEMA,
    'table', TG_TABLE_NAME,
    'data', COALESCE(row_image, '{{}}'::json)
  )::text);
  IF TG_OP = 'DELETE' THEN
    RETURN OLD;
  END IF;
  RETURN NEW;
END;
{tag}"#,
            function = quote_qualified(&spec.function.schema, &spec.function.name),
            tag = BODY_TAG,
            channel = quote_literal(channel),
        ))
    }

    /// `CREATE TRIGGER`
    pub fn create_trigger(&self) -> String {
        let spec = self.spec;
        let mut sql = format!(
            "CREATE TRIGGER {} {} {} ON {} FOR EACH {}",
            quote_identifier(&spec.name),
            spec.timing.as_sql(),
            self.events(),
            quote_qualified(&spec.schema, &spec.table),
            spec.level.as_sql(),
        );
        if let Some(condition) = &spec.condition {
            sql.push_str(&format!(" WHEN ({})", condition));
        }
        let args = spec
            .function
            .args
            .iter()
            .map(|a| quote_literal(a))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(
            " EXECUTE FUNCTION {}({})",
            quote_qualified(&spec.function.schema, &spec.function.name),
            args
        ));
        sql
    }

    /// `DROP TRIGGER IF EXISTS`
    pub fn drop_trigger(&self) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_identifier(&self.spec.name),
            quote_qualified(&self.spec.schema, &self.spec.table)
        )
    }

    /// `DROP FUNCTION IF EXISTS` for a managed notify target
    pub fn drop_function(&self) -> Option<String> {
        let spec = self.spec;
        spec.managed.then(|| {
            format!(
                "DROP FUNCTION IF EXISTS {}()",
                quote_qualified(&spec.function.schema, &spec.function.name)
            )
        })
    }

    fn events(&self) -> String {
        self.spec
            .operations
            .iter()
            .map(|op| match op {
                TriggerOperation::Update if !self.spec.columns.is_empty() => {
                    let columns = self
                        .spec
                        .columns
                        .iter()
                        .map(|c| quote_identifier(c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("UPDATE OF {}", columns)
                }
                other => other.as_str().to_string(),
            })
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TriggerBuilder;

    #[test]
    fn test_events_with_columns() {
        let spec = TriggerBuilder::new()
            .model("orders")
            .name("t")
            .after()
            .on_insert()
            .on_update()
            .watch_columns(["status", "total"])
            .notify()
            .build()
            .unwrap();
        assert_eq!(
            TriggerDdl::new(&spec).events(),
            r#"INSERT OR UPDATE OF "status", "total""#
        );
    }

    #[test]
    fn test_user_function_has_no_function_ddl() {
        let spec = TriggerBuilder::new()
            .model("orders")
            .name("audit")
            .before()
            .on_delete()
            .execute("audit_row", ["orders"])
            .build()
            .unwrap();
        let ddl = TriggerDdl::new(&spec);
        assert!(ddl.create_function().is_none());
        assert!(ddl.drop_function().is_none());
        assert_eq!(ddl.setup_statements().len(), 2);
        assert_eq!(ddl.teardown_statements().len(), 1);
    }
}
