//! SQLite-backed `Store`. Document containers share one table keyed by
//! `(container, id, partition_key)` with the body as JSON text; filters are
//! pushed down via `json_extract`. Flow rows live in their own table with
//! the natural composite key and `ON CONFLICT DO NOTHING` inserts.

use crate::domain::errors::StoreError;
use crate::domain::flow::{FlowAggregate, FlowBucket, FlowRecord, FlowType};
use crate::domain::store::{Cmp, QueryFilter, Store, StoreOp, document_keys};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

#[derive(Clone)]
pub struct SqliteStore {
    pub pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                container TEXT NOT NULL,
                id TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (container, id, partition_key)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create documents table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_documents_container_pk
            ON documents (container, partition_key);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create documents index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_data (
                time INTEGER NOT NULL,
                asset TEXT NOT NULL,
                flow_type TEXT NOT NULL,
                tx_hash TEXT NOT NULL DEFAULT '',
                amount TEXT NOT NULL,
                source TEXT,
                from_address TEXT,
                to_address TEXT,
                usd_value TEXT,
                metadata TEXT,
                PRIMARY KEY (time, asset, flow_type, tx_hash)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create flow_data table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_flow_asset_time
            ON flow_data (asset, time);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create flow index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create settings table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}

fn bind_condition_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        Value::String(s) => query.bind(s.as_str()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
        Value::Bool(b) => query.bind(*b),
        other => query.bind(other.to_string()),
    }
}

fn cmp_sql(op: Cmp) -> &'static str {
    match op {
        Cmp::Eq => "=",
        Cmp::Ne => "!=",
        Cmp::Gt => ">",
        Cmp::Gte => ">=",
        Cmp::Lt => "<",
        Cmp::Lte => "<=",
    }
}

/// JSON paths come from internal call sites, but quote-safety is cheap to
/// keep: segments are restricted to identifier characters.
fn json_path(field: &str) -> String {
    let clean: String = field
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    format!("$.{}", clean)
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(
        &self,
        container: &str,
        id: &str,
        partition_key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            "SELECT body FROM documents WHERE container = ? AND id = ? AND partition_key = ?",
        )
        .bind(container)
        .bind(id)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let body: String = row.try_get("body")?;
                Ok(Some(serde_json::from_str(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, container: &str, doc: &Value) -> Result<(), StoreError> {
        let (id, pk) = document_keys(container, doc)?;
        sqlx::query(
            r#"
            INSERT INTO documents (container, id, partition_key, body, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(container, id, partition_key) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(container)
        .bind(&id)
        .bind(&pk)
        .bind(doc.to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace(&self, container: &str, id: &str, doc: &Value) -> Result<bool, StoreError> {
        let (_, pk) = document_keys(container, doc)?;
        let result = sqlx::query(
            r#"
            UPDATE documents SET body = ?, updated_at = ?
            WHERE container = ? AND id = ? AND partition_key = ?
            "#,
        )
        .bind(doc.to_string())
        .bind(Utc::now().timestamp())
        .bind(container)
        .bind(id)
        .bind(&pk)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(
        &self,
        container: &str,
        id: &str,
        partition_key: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM documents WHERE container = ? AND id = ? AND partition_key = ?",
        )
        .bind(container)
        .bind(id)
        .bind(partition_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(
        &self,
        container: &str,
        filter: &QueryFilter,
    ) -> Result<Vec<Value>, StoreError> {
        let mut sql = String::from("SELECT body FROM documents WHERE container = ?");
        for c in &filter.conditions {
            sql.push_str(&format!(
                " AND json_extract(body, '{}') {} ?",
                json_path(&c.field),
                cmp_sql(c.op)
            ));
        }
        if let Some(order) = &filter.order_by {
            sql.push_str(&format!(
                " ORDER BY json_extract(body, '{}') {}",
                json_path(order),
                if filter.descending { "DESC" } else { "ASC" }
            ));
        }
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut query = sqlx::query(&sql).bind(container);
        for c in &filter.conditions {
            query = bind_condition_value(query, &c.value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("body")?;
            docs.push(serde_json::from_str(&body)?);
        }
        Ok(docs)
    }

    async fn transact(&self, container: &str, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().timestamp();
        for op in ops {
            match op {
                StoreOp::Upsert(doc) => {
                    let (id, pk) = document_keys(container, &doc)?;
                    let q = sqlx::query(
                        r#"
                        INSERT INTO documents (container, id, partition_key, body, updated_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(container, id, partition_key) DO UPDATE SET
                            body = excluded.body,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(container)
                    .bind(id)
                    .bind(pk)
                    .bind(doc.to_string())
                    .bind(now);
                    q.execute(&mut *tx).await?;
                }
                StoreOp::Replace { id, doc } => {
                    let (_, pk) = document_keys(container, &doc)?;
                    let q = sqlx::query(
                        r#"
                        UPDATE documents SET body = ?, updated_at = ?
                        WHERE container = ? AND id = ? AND partition_key = ?
                        "#,
                    )
                    .bind(doc.to_string())
                    .bind(now)
                    .bind(container)
                    .bind(id)
                    .bind(pk);
                    q.execute(&mut *tx).await?;
                }
                StoreOp::Delete { id, partition_key } => {
                    let q = sqlx::query(
                        "DELETE FROM documents WHERE container = ? AND id = ? AND partition_key = ?",
                    )
                    .bind(container)
                    .bind(id)
                    .bind(partition_key);
                    q.execute(&mut *tx).await?;
                }
            }
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::TransactionAborted {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn append_flow(&self, rows: &[FlowRecord]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO flow_data
                    (time, asset, flow_type, tx_hash, amount, source, from_address, to_address, usd_value, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (time, asset, flow_type, tx_hash) DO NOTHING
                "#,
            )
            .bind(row.ts.timestamp())
            .bind(&row.asset)
            .bind(row.flow_type.to_string())
            .bind(row.tx_hash.clone().unwrap_or_default())
            .bind(row.amount.to_string())
            .bind(&row.source)
            .bind(&row.from_address)
            .bind(&row.to_address)
            .bind(row.usd_value.map(|v| v.to_string()))
            .bind(row.metadata.as_ref().map(|m| m.to_string()))
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn flow_aggregate(
        &self,
        bucket: FlowBucket,
        asset: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FlowAggregate>, StoreError> {
        let rows = sqlx::query(
            "SELECT time, flow_type, amount, usd_value FROM flow_data WHERE asset = ? AND time >= ?",
        )
        .bind(asset)
        .bind(since.timestamp())
        .fetch_all(&self.pool)
        .await?;

        // Amounts are decimal text; aggregate in-process to keep precision.
        let width = bucket.seconds();
        let mut grouped: BTreeMap<(i64, String), (Decimal, Decimal, u64)> = BTreeMap::new();
        for row in rows {
            let time: i64 = row.try_get("time")?;
            let flow_type: String = row.try_get("flow_type")?;
            let amount: String = row.try_get("amount")?;
            let usd: Option<String> = row.try_get("usd_value")?;
            let amount = Decimal::from_str(&amount).unwrap_or(Decimal::ZERO);
            let usd = usd
                .and_then(|s| Decimal::from_str(&s).ok())
                .unwrap_or(Decimal::ZERO);
            let entry = grouped
                .entry((time / width * width, flow_type))
                .or_insert((Decimal::ZERO, Decimal::ZERO, 0));
            entry.0 += amount;
            entry.1 += usd;
            entry.2 += 1;
        }

        let mut aggregates = Vec::with_capacity(grouped.len());
        for ((bucket_ts, flow_type), (amount, usd, count)) in grouped {
            let flow_type: FlowType =
                serde_json::from_value(Value::String(flow_type.clone()))
                    .map_err(StoreError::Serialization)?;
            if let Some(ts) = DateTime::from_timestamp(bucket_ts, 0) {
                aggregates.push(FlowAggregate {
                    bucket: ts,
                    asset: asset.to_string(),
                    flow_type,
                    total_amount: amount,
                    total_usd_value: usd,
                    flow_count: count,
                });
            }
        }
        Ok(aggregates)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE name = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings (name, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::store::containers;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_get_replace() {
        let s = store().await;
        let doc = json!({"id": "s1", "status": "paper_trading"});
        s.upsert(containers::STRATEGIES, &doc).await.unwrap();

        let got = s.get(containers::STRATEGIES, "s1", "s1").await.unwrap().unwrap();
        assert_eq!(got["status"], "paper_trading");

        let updated = json!({"id": "s1", "status": "active"});
        assert!(s.replace(containers::STRATEGIES, "s1", &updated).await.unwrap());
        let got = s.get(containers::STRATEGIES, "s1", "s1").await.unwrap().unwrap();
        assert_eq!(got["status"], "active");
    }

    #[tokio::test]
    async fn test_replace_missing_is_false() {
        let s = store().await;
        let doc = json!({"id": "ghost", "status": "active"});
        assert!(!s.replace(containers::STRATEGIES, "ghost", &doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_query_pushdown_and_order() {
        let s = store().await;
        for (id, sharpe) in [("a", 0.5), ("b", 2.0), ("c", 1.2)] {
            s.upsert(
                containers::BACKTEST_RESULTS,
                &json!({"id": id, "strategy_id": id, "sharpe": sharpe, "passed_criteria": true}),
            )
            .await
            .unwrap();
        }
        let docs = s
            .query(
                containers::BACKTEST_RESULTS,
                &QueryFilter::new().gt("sharpe", 1.0).order_desc("sharpe"),
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["id"], "b");
    }

    #[tokio::test]
    async fn test_flow_on_conflict_do_nothing() {
        let s = store().await;
        let row = FlowRecord {
            ts: Utc::now(),
            asset: "BTC".to_string(),
            flow_type: FlowType::LargeTx,
            amount: rust_decimal_macros::dec!(10),
            source: Some("mempool".to_string()),
            tx_hash: Some("0xdead".to_string()),
            from_address: None,
            to_address: None,
            usd_value: None,
            metadata: None,
        };
        assert_eq!(s.append_flow(&[row.clone()]).await.unwrap(), 1);
        assert_eq!(s.append_flow(&[row]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_settings_default_seeding_pattern() {
        let s = store().await;
        if s.get_setting("MAX_ACTIVE_STRATEGIES").await.unwrap().is_none() {
            s.put_setting("MAX_ACTIVE_STRATEGIES", "2").await.unwrap();
        }
        assert_eq!(
            s.get_setting("MAX_ACTIVE_STRATEGIES").await.unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_transact_rolls_back_on_bad_doc() {
        let s = store().await;
        let result = s
            .transact(
                containers::STRATEGIES,
                vec![
                    StoreOp::Upsert(json!({"id": "ok"})),
                    StoreOp::Upsert(json!({"missing": "id"})),
                ],
            )
            .await;
        assert!(result.is_err());
        assert!(s.get(containers::STRATEGIES, "ok", "ok").await.unwrap().is_none());
    }
}
