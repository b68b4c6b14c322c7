//! Best-effort metadata mirror
//!
//! When enabled, every created trigger is upserted into a metadata table and
//! removed again when dropped. The mirror is informational only: a failed
//! write is logged and never fails the lifecycle operation that caused it.

use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use triggerfish_sql::security::quote_qualified;
use triggerfish_sql::trigger::TriggerSpec;

struct MirrorInner {
    manager: ConnectionManager,
    table: String,
    ensured: AtomicBool,
}

/// Writes trigger definitions to a metadata table
#[derive(Clone)]
pub struct MetadataMirror {
    inner: Arc<MirrorInner>,
}

impl MetadataMirror {
    /// Mirror into `schema.table`
    pub fn new(manager: ConnectionManager, schema: &str, table: &str) -> Self {
        Self {
            inner: Arc::new(MirrorInner {
                manager,
                table: quote_qualified(schema, table),
                ensured: AtomicBool::new(false),
            }),
        }
    }

    /// Quoted, schema-qualified table name
    pub fn table(&self) -> &str {
        &self.inner.table
    }

    /// `CREATE TABLE IF NOT EXISTS` for the metadata table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             trigger_key TEXT PRIMARY KEY, \
             model TEXT NOT NULL, \
             schema_name TEXT NOT NULL, \
             table_name TEXT NOT NULL, \
             trigger_name TEXT NOT NULL, \
             channel TEXT, \
             definition JSONB NOT NULL, \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT now())",
            self.inner.table
        )
    }

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {} \
             (trigger_key, model, schema_name, table_name, trigger_name, channel, definition, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7::text::jsonb, now()) \
             ON CONFLICT (trigger_key) DO UPDATE SET \
             model = EXCLUDED.model, \
             schema_name = EXCLUDED.schema_name, \
             table_name = EXCLUDED.table_name, \
             trigger_name = EXCLUDED.trigger_name, \
             channel = EXCLUDED.channel, \
             definition = EXCLUDED.definition, \
             updated_at = now()",
            self.inner.table
        )
    }

    fn delete_sql(&self) -> String {
        format!("DELETE FROM {} WHERE trigger_key = $1", self.inner.table)
    }

    /// Upsert `spec`, logging any failure
    pub async fn record(&self, spec: &TriggerSpec) {
        if let Err(e) = self.try_record(spec).await {
            warn!("Metadata mirror: failed to record {}: {}", spec.key(), e);
        }
    }

    /// Remove `spec`, logging any failure
    pub async fn forget(&self, spec: &TriggerSpec) {
        if let Err(e) = self.try_forget(spec).await {
            warn!("Metadata mirror: failed to remove {}: {}", spec.key(), e);
        }
    }

    /// Upsert `spec`
    pub async fn try_record(&self, spec: &TriggerSpec) -> Result<()> {
        let definition = serde_json::to_string(spec)
            .map_err(|e| Error::query(format!("failed to serialize trigger: {}", e)))?;
        let create = (!self.inner.ensured.load(Ordering::Acquire)).then(|| self.create_table_sql());
        let upsert = self.upsert_sql();
        let key = spec.key();
        let row = [
            Some(key.clone()),
            Some(spec.model.clone()),
            Some(spec.schema.clone()),
            Some(spec.table.clone()),
            Some(spec.name.clone()),
            spec.channel.clone(),
            Some(definition),
        ];

        self.inner
            .manager
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    if let Some(create) = &create {
                        tx.batch_execute(create).await?;
                    }
                    let params: Vec<Option<&str>> = row.iter().map(|v| v.as_deref()).collect();
                    tx.execute(&upsert, &params).await?;
                    Ok(())
                })
            })
            .await?;

        self.inner.ensured.store(true, Ordering::Release);
        debug!("Metadata mirror: recorded {}", key);
        Ok(())
    }

    /// Remove `spec`
    pub async fn try_forget(&self, spec: &TriggerSpec) -> Result<()> {
        let delete = self.delete_sql();
        let key = spec.key();
        let param = key.clone();

        self.inner
            .manager
            .run_in_transaction(move |tx| {
                Box::pin(async move {
                    tx.execute(&delete, &[Some(param.as_str())]).await?;
                    Ok(())
                })
            })
            .await?;

        debug!("Metadata mirror: removed {}", key);
        Ok(())
    }
}

impl std::fmt::Debug for MetadataMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataMirror")
            .field("table", &self.inner.table)
            .finish()
    }
}
