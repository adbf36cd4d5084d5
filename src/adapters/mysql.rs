use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, Params, Pool};
use serde_json::{json, Value};
use tracing::debug;

use super::postgres::redact_url;
use super::sql::{
    apply_limit, build_delete, build_insert, build_update, validate_identifier, Placeholder,
};
use super::{BackendKind, Capabilities, DatabaseAdapter, Query, Row, RowBatchStream};
use crate::error::DbError;
use crate::security::validate_sql;

/// MySQL-dialect adapter. Shares the relational contract and SQL templates
/// with the generic adapter; the plan format (`EXPLAIN` tabular output) and
/// the index metadata surface (`SHOW INDEX FROM`) are MySQL-specific.
#[derive(Debug)]
pub struct MySqlAdapter {
    pool: Pool,
    tx: Option<Conn>,
    display_url: String,
}

impl MySqlAdapter {
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let opts = Opts::from_url(url).map_err(|e| DbError::InvalidDescriptor {
            kind: BackendKind::MySql.to_string(),
            reason: e.to_string(),
        })?;
        let pool = Pool::new(opts);

        // Ping once so bad credentials surface at connect time.
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| DbError::ConnectionFailure(e.to_string()))?;
        conn.ping()
            .await
            .map_err(|e| DbError::ConnectionFailure(e.to_string()))?;
        drop(conn);

        debug!(url = %redact_url(url), "connected to MySQL");
        Ok(Self {
            pool,
            tx: None,
            display_url: redact_url(url),
        })
    }

    /// Run a statement and collect rows, routing through the pinned
    /// transaction connection when one is open.
    async fn run_query(&mut self, sql: &str, params: Params) -> Result<Vec<Row>, DbError> {
        let mut pooled;
        let conn: &mut Conn = match self.tx.as_mut() {
            Some(conn) => conn,
            None => {
                pooled = self
                    .pool
                    .get_conn()
                    .await
                    .map_err(|e| DbError::ConnectionFailure(e.to_string()))?;
                &mut pooled
            }
        };

        let rows: Vec<mysql_async::Row> = if matches!(params, Params::Empty) {
            // Textual protocol: EXPLAIN/SHOW and friends are not all
            // preparable.
            conn.query(sql)
                .await
                .map_err(|e| DbError::operation("query", e))?
        } else {
            conn.exec(sql, params)
                .await
                .map_err(|e| DbError::operation("query", e))?
        };
        Ok(rows.iter().map(mysql_row_to_json).collect())
    }

    /// Run a statement for effect; returns the affected row count.
    async fn run_exec(&mut self, sql: &str, params: Params) -> Result<u64, DbError> {
        let mut pooled;
        let conn: &mut Conn = match self.tx.as_mut() {
            Some(conn) => conn,
            None => {
                pooled = self
                    .pool
                    .get_conn()
                    .await
                    .map_err(|e| DbError::ConnectionFailure(e.to_string()))?;
                &mut pooled
            }
        };
        conn.exec_drop(sql, params)
            .await
            .map_err(|e| DbError::operation("execute", e))?;
        Ok(conn.affected_rows())
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::MySql
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
        self.tx = None;
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(|e| DbError::ConnectionFailure(e.to_string()))
    }

    async fn health_check(&mut self) -> bool {
        self.run_query("SELECT 1", Params::Empty).await.is_ok()
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
        let rows = self
            .run_query(
                "SELECT table_name AS table_name \
                 FROM information_schema.tables \
                 WHERE table_schema = DATABASE() \
                 ORDER BY table_name",
                Params::Empty,
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.get("table_name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    async fn get_columns(&mut self, table: &str) -> Result<Vec<String>, DbError> {
        let rows = self
            .run_query(
                "SELECT column_name AS column_name \
                 FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? \
                 ORDER BY ordinal_position",
                Params::Positional(vec![mysql_async::Value::Bytes(table.as_bytes().to_vec())]),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.get("column_name").and_then(Value::as_str).map(String::from))
            .collect())
    }

    async fn get_indexes(&mut self, table: &str) -> Result<Value, DbError> {
        validate_identifier(table)?;
        let rows = self
            .run_query(&format!("SHOW INDEX FROM {}", table), Params::Empty)
            .await?;
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
        let params = match params {
            Some(values) if !values.is_empty() => {
                Params::Positional(values.iter().map(json_to_mysql).collect())
            }
            _ => Params::Empty,
        };
        self.run_query(&sql, params).await
    }

    async fn explain_query(&mut self, query: &Query) -> Result<Value, DbError> {
        let sql = query.expect_sql()?;
        validate_sql(sql, false)?;
        // MySQL's tabular EXPLAIN, one object per joined table.
        let rows = self
            .run_query(&format!("EXPLAIN {}", sql), Params::Empty)
            .await?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }

    async fn insert(&mut self, table: &str, data: &Row) -> Result<Value, DbError> {
        let columns: Vec<&str> = data.keys().map(String::as_str).collect();
        let sql = build_insert(table, &columns, Placeholder::Question)?;
        let params = Params::Positional(data.values().map(json_to_mysql).collect());
        let affected = self.run_exec(&sql, params).await?;
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
        let params = Params::Positional(
            data.values()
                .chain(filters.values())
                .map(json_to_mysql)
                .collect(),
        );
        let affected = self.run_exec(&sql, params).await?;
        Ok(json!({ "updated": affected }))
    }

    async fn delete(&mut self, table: &str, filters: &Row) -> Result<Value, DbError> {
        let filter_cols: Vec<&str> = filters.keys().map(String::as_str).collect();
        let sql = build_delete(table, &filter_cols, Placeholder::Question)?;
        let params = Params::Positional(filters.values().map(json_to_mysql).collect());
        let affected = self.run_exec(&sql, params).await?;
        Ok(json!({ "deleted": affected }))
    }

    async fn begin_transaction(&mut self) -> Result<(), DbError> {
        if self.tx.is_some() {
            return Err(DbError::TransactionState(
                "a transaction is already open".to_string(),
            ));
        }
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| DbError::ConnectionFailure(e.to_string()))?;
        conn.query_drop("START TRANSACTION")
            .await
            .map_err(|e| DbError::operation("begin", e))?;
        self.tx = Some(conn);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let mut conn = self.tx.take().ok_or_else(|| {
            DbError::TransactionState("commit called with no open transaction".to_string())
        })?;
        conn.query_drop("COMMIT")
            .await
            .map_err(|e| DbError::operation("commit", e))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        let mut conn = self.tx.take().ok_or_else(|| {
            DbError::TransactionState("rollback called with no open transaction".to_string())
        })?;
        conn.query_drop("ROLLBACK")
            .await
            .map_err(|e| DbError::operation("rollback", e))?;
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
        // The driver buffers result sets per statement; batching here bounds
        // what each downstream consumer sees, not the driver's own buffer.
        let rows = self.run_query(sql, Params::Empty).await?;
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
        format!("mysql_async pool ({})", self.display_url)
    }
}

fn mysql_row_to_json(row: &mysql_async::Row) -> Row {
    let mut out = Row::new();
    for (idx, col) in row.columns_ref().iter().enumerate() {
        let value = row
            .as_ref(idx)
            .map(mysql_value_to_json)
            .unwrap_or(Value::Null);
        out.insert(col.name_str().to_string(), value);
    }
    out
}

fn mysql_value_to_json(value: &mysql_async::Value) -> Value {
    use mysql_async::Value as V;
    match value {
        V::NULL => Value::Null,
        V::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => json!(s),
            Err(_) => json!(format!("[{} bytes]", bytes.len())),
        },
        V::Int(i) => json!(i),
        V::UInt(u) => json!(u),
        V::Float(f) => json!(f),
        V::Double(d) => json!(d),
        V::Date(y, mo, d, h, mi, s, us) => json!(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, mo, d, h, mi, s, us
        )),
        V::Time(neg, days, h, mi, s, us) => json!(format!(
            "{}{:02}:{:02}:{:02}.{:06}",
            if *neg { "-" } else { "" },
            u32::from(*days) * 24 + u32::from(*h),
            mi,
            s,
            us
        )),
    }
}

fn json_to_mysql(value: &Value) -> mysql_async::Value {
    use mysql_async::Value as V;
    match value {
        Value::Null => V::NULL,
        Value::Bool(b) => V::Int(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                V::Int(i)
            } else if let Some(u) = n.as_u64() {
                V::UInt(u)
            } else {
                V::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => V::Bytes(s.clone().into_bytes()),
        // Arrays and objects travel as JSON text.
        other => V::Bytes(other.to_string().into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_to_mysql_scalars() {
        use mysql_async::Value as V;
        assert_eq!(json_to_mysql(&Value::Null), V::NULL);
        assert_eq!(json_to_mysql(&json!(true)), V::Int(1));
        assert_eq!(json_to_mysql(&json!(42)), V::Int(42));
        assert_eq!(json_to_mysql(&json!(2.5)), V::Double(2.5));
        assert_eq!(
            json_to_mysql(&json!("hi")),
            V::Bytes("hi".as_bytes().to_vec())
        );
    }

    #[test]
    fn test_json_to_mysql_object_as_json_text() {
        let v = json_to_mysql(&json!({"a": 1}));
        assert_eq!(v, mysql_async::Value::Bytes(b"{\"a\":1}".to_vec()));
    }

    #[test]
    fn test_mysql_value_to_json_scalars() {
        use mysql_async::Value as V;
        assert_eq!(mysql_value_to_json(&V::NULL), Value::Null);
        assert_eq!(mysql_value_to_json(&V::Int(-3)), json!(-3));
        assert_eq!(mysql_value_to_json(&V::UInt(7)), json!(7));
        assert_eq!(mysql_value_to_json(&V::Bytes(b"abc".to_vec())), json!("abc"));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_descriptor() {
        let err = MySqlAdapter::connect("mysql://not a url").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidDescriptor { .. }));
    }
}
