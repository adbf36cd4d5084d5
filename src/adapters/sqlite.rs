use async_trait::async_trait;
use futures::StreamExt;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::debug;

use super::sql::{
    apply_limit, build_delete, build_insert, build_update, validate_identifier, Placeholder,
};
use super::{BackendKind, Capabilities, DatabaseAdapter, Query, Row, RowBatchStream};
use crate::error::DbError;
use crate::security::validate_sql;

/// Embedded single-file adapter. No pool: one `rusqlite` connection is the
/// whole backend, and statements run synchronously on it. Plan and index
/// metadata come from SQLite's pragma surface instead of catalog tables.
#[derive(Debug)]
pub struct SqliteAdapter {
    conn: Option<Connection>,
    tx_open: bool,
    path: String,
}

impl SqliteAdapter {
    /// `sqlite:///app.db` opens `app.db` relative to the working directory,
    /// `sqlite:////tmp/app.db` opens an absolute path, `sqlite::memory:`
    /// opens an in-memory database.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let path = path_from_url(url)?;
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&path)
        }
        .map_err(|e| DbError::ConnectionFailure(e.to_string()))?;

        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| DbError::ConnectionFailure(e.to_string()))?;

        debug!(%path, "opened SQLite database");
        Ok(Self {
            conn: Some(conn),
            tx_open: false,
            path,
        })
    }

    fn conn(&self) -> Result<&Connection, DbError> {
        self.conn
            .as_ref()
            .ok_or_else(|| DbError::ConnectionFailure("connection is closed".to_string()))
    }

    fn query_json(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| DbError::operation("query", e))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let bound = rusqlite::params_from_iter(params.iter().map(json_to_sqlite));
        let mut rows = stmt
            .query(bound)
            .map_err(|e| DbError::operation("query", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| DbError::operation("query", e))? {
            let mut obj = Row::new();
            for (idx, name) in names.iter().enumerate() {
                let cell = row
                    .get_ref(idx)
                    .map_err(|e| DbError::operation("query", e))?;
                obj.insert(name.clone(), sqlite_value_to_json(cell));
            }
            out.push(obj);
        }
        Ok(out)
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let conn = self.conn()?;
        let bound = rusqlite::params_from_iter(params.iter().map(json_to_sqlite));
        let affected = conn
            .execute(sql, bound)
            .map_err(|e| DbError::operation("execute", e))?;
        Ok(affected as u64)
    }
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read: true,
            write: true,
            transactions: true,
            schema_introspection: true,
            aggregation: true,
        }
    }

    async fn close(&mut self) -> Result<(), DbError> {
        self.tx_open = false;
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, e)| DbError::ConnectionFailure(e.to_string()))?;
        }
        Ok(())
    }

    async fn health_check(&mut self) -> bool {
        self.conn()
            .and_then(|c| {
                c.query_row("SELECT 1", [], |_| Ok(()))
                    .map_err(|e| DbError::operation("health_check", e))
            })
            .is_ok()
    }

    async fn get_schema(&mut self) -> Result<Row, DbError> {
        let tables = self.get_tables().await?;
        let mut schema = Row::new();
        for table in tables {
            let columns = self.get_columns(&table).await?;
            schema.insert(table, json!(columns));
        }
        Ok(schema)
    }

    async fn get_tables(&mut self) -> Result<Vec<String>, DbError> {
        let rows = self.query_json(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
            &[],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    async fn get_columns(&mut self, table: &str) -> Result<Vec<String>, DbError> {
        validate_identifier(table)?;
        let rows = self.query_json(&format!("PRAGMA table_info({})", table), &[])?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.get("name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    async fn get_indexes(&mut self, table: &str) -> Result<Value, DbError> {
        validate_identifier(table)?;
        let rows = self.query_json(&format!("PRAGMA index_list({})", table), &[])?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }

    async fn execute_query(
        &mut self,
        query: &Query,
        params: Option<&[Value]>,
        limit: Option<u64>,
    ) -> Result<Vec<Row>, DbError> {
        let sql = query.expect_sql()?;
        validate_sql(sql, false)?;
        let sql = apply_limit(sql, limit);
        self.query_json(&sql, params.unwrap_or_default())
    }

    async fn explain_query(&mut self, query: &Query) -> Result<Value, DbError> {
        let sql = query.expect_sql()?;
        validate_sql(sql, false)?;
        let rows = self.query_json(&format!("EXPLAIN QUERY PLAN {}", sql), &[])?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }

    async fn insert(&mut self, table: &str, data: &Row) -> Result<Value, DbError> {
        let columns: Vec<&str> = data.keys().map(String::as_str).collect();
        let sql = build_insert(table, &columns, Placeholder::Question)?;
        let values: Vec<Value> = data.values().cloned().collect();
        let affected = self.exec(&sql, &values)?;
        Ok(json!({ "inserted": affected }))
    }

    async fn bulk_insert(&mut self, table: &str, rows: &[Row]) -> Result<Value, DbError> {
        let mut inserted = 0u64;
        for row in rows {
            self.insert(table, row).await?;
            inserted += 1;
        }
        Ok(json!({ "inserted": inserted }))
    }

    async fn update(&mut self, table: &str, filters: &Row, data: &Row) -> Result<Value, DbError> {
        let set_cols: Vec<&str> = data.keys().map(String::as_str).collect();
        let filter_cols: Vec<&str> = filters.keys().map(String::as_str).collect();
        let sql = build_update(table, &set_cols, &filter_cols, Placeholder::Question)?;
        let values: Vec<Value> = data.values().chain(filters.values()).cloned().collect();
        let affected = self.exec(&sql, &values)?;
        Ok(json!({ "updated": affected }))
    }

    async fn delete(&mut self, table: &str, filters: &Row) -> Result<Value, DbError> {
        let filter_cols: Vec<&str> = filters.keys().map(String::as_str).collect();
        let sql = build_delete(table, &filter_cols, Placeholder::Question)?;
        let values: Vec<Value> = filters.values().cloned().collect();
        let affected = self.exec(&sql, &values)?;
        Ok(json!({ "deleted": affected }))
    }

    async fn begin_transaction(&mut self) -> Result<(), DbError> {
        if self.tx_open {
            return Err(DbError::TransactionState(
                "a transaction is already open".to_string(),
            ));
        }
        self.conn()?
            .execute_batch("BEGIN")
            .map_err(|e| DbError::operation("begin", e))?;
        self.tx_open = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        if !self.tx_open {
            return Err(DbError::TransactionState(
                "commit called with no open transaction".to_string(),
            ));
        }
        self.conn()?
            .execute_batch("COMMIT")
            .map_err(|e| DbError::operation("commit", e))?;
        self.tx_open = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        if !self.tx_open {
            return Err(DbError::TransactionState(
                "rollback called with no open transaction".to_string(),
            ));
        }
        self.conn()?
            .execute_batch("ROLLBACK")
            .map_err(|e| DbError::operation("rollback", e))?;
        self.tx_open = false;
        Ok(())
    }

    async fn aggregate(&mut self, _table: &str, pipeline: &Value) -> Result<Vec<Row>, DbError> {
        let sql = pipeline.as_str().ok_or_else(|| {
            DbError::MalformedQuery(
                "relational aggregate takes a complete aggregate query string".to_string(),
            )
        })?;
        self.execute_query(&Query::Sql(sql.to_string()), None, None)
            .await
    }

    async fn fetch_many(
        &mut self,
        query: &Query,
        batch_size: usize,
    ) -> Result<RowBatchStream, DbError> {
        let sql = query.expect_sql()?;
        validate_sql(sql, false)?;
        // Local file reads are cheap; rows are read in one pass and
        // re-batched for the consumer.
        let rows = self.query_json(sql, &[])?;
        let batches: Vec<Result<Vec<Row>, DbError>> = rows
            .chunks(batch_size.max(1))
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(futures::stream::iter(batches).boxed())
    }

    fn validate_query(&self, query: &Query) -> Result<(), DbError> {
        validate_sql(query.expect_sql()?, false)
    }

    fn raw_client(&self) -> String {
        format!("rusqlite connection ({})", self.path)
    }
}

fn path_from_url(url: &str) -> Result<String, DbError> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .ok_or_else(|| DbError::InvalidDescriptor {
            kind: BackendKind::Sqlite.to_string(),
            reason: "URL must start with sqlite://".to_string(),
        })?;
    let path = if rest == ":memory:" {
        rest
    } else {
        rest.strip_prefix('/').unwrap_or(rest)
    };
    if path.is_empty() {
        return Err(DbError::InvalidDescriptor {
            kind: BackendKind::Sqlite.to_string(),
            reason: "missing database path".to_string(),
        });
    }
    Ok(path.to_string())
}

fn json_to_sqlite(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as V;
    match value {
        Value::Null => V::Null,
        Value::Bool(b) => V::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                V::Integer(i)
            } else {
                V::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => V::Text(s.clone()),
        other => V::Text(other.to_string()),
    }
}

fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => json!(format!("[{} bytes]", b.len())),
    }
}
