//! The fixed tool catalog advertised to the model, and the dispatcher that
//! executes one named invocation against the connected adapter.
//!
//! Tool names and parameter schemas are a stability surface: prompts and
//! model behavior key off them, so they never change casually.

use serde_json::{json, Value};
use tracing::debug;

use crate::adapters::{DatabaseAdapter, Query, Row};
use crate::error::DbError;
use crate::llm::ToolSpec;

/// Every tool the session exposes, with the JSON-schema parameters sent to
/// the model verbatim.
pub fn catalog() -> Vec<ToolSpec> {
    let no_params = json!({ "type": "object", "properties": {} });
    let table_param = json!({
        "type": "object",
        "properties": {
            "table": { "type": "string", "description": "Table or collection name" }
        },
        "required": ["table"]
    });
    let query_desc = "SQL text for relational backends, or an object with \
                      'collection' and optional 'filter' for MongoDB";

    vec![
        ToolSpec::function(
            "health_check",
            "Check whether the database connection is alive.",
            no_params.clone(),
        ),
        ToolSpec::function(
            "get_capabilities",
            "Get the capability flags of the connected database (read, write, \
             transactions, schema_introspection, aggregation).",
            no_params.clone(),
        ),
        ToolSpec::function(
            "get_database_schema",
            "Get all tables/collections with their column/field names.",
            no_params.clone(),
        ),
        ToolSpec::function(
            "list_tables",
            "List table or collection names.",
            no_params.clone(),
        ),
        ToolSpec::function(
            "get_table_columns",
            "Get the column or field names of one table/collection.",
            table_param.clone(),
        ),
        ToolSpec::function(
            "get_table_indexes",
            "Get index metadata for one table/collection.",
            table_param.clone(),
        ),
        ToolSpec::function(
            "execute_query",
            "Run a read query and return the resulting rows.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "description": query_desc },
                    "params": {
                        "type": "array",
                        "description": "Positional bind parameters for SQL placeholders"
                    },
                    "limit": { "type": "integer", "description": "Maximum rows to return" }
                },
                "required": ["query"]
            }),
        ),
        ToolSpec::function(
            "explain_query",
            "Get the backend's native execution plan for a query without running it.",
            json!({
                "type": "object",
                "properties": { "query": { "description": query_desc } },
                "required": ["query"]
            }),
        ),
        ToolSpec::function(
            "aggregate_data",
            "Run an aggregation: a complete aggregate SQL string for relational \
             backends, or an array of pipeline stages for MongoDB.",
            json!({
                "type": "object",
                "properties": {
                    "table": { "type": "string" },
                    "pipeline": { "description": "Aggregate SQL string or pipeline stage array" }
                },
                "required": ["table", "pipeline"]
            }),
        ),
        ToolSpec::function(
            "fetch_large_result",
            "Fetch a large result set in batches and return all rows.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "description": query_desc },
                    "batch_size": { "type": "integer", "description": "Rows per batch (default 500)" }
                },
                "required": ["query"]
            }),
        ),
        ToolSpec::function(
            "insert_row",
            "Insert one row/document.",
            json!({
                "type": "object",
                "properties": {
                    "table": { "type": "string" },
                    "data": { "type": "object", "description": "Column/field values" }
                },
                "required": ["table", "data"]
            }),
        ),
        ToolSpec::function(
            "bulk_insert",
            "Insert many rows/documents at once.",
            json!({
                "type": "object",
                "properties": {
                    "table": { "type": "string" },
                    "rows": { "type": "array", "items": { "type": "object" } }
                },
                "required": ["table", "rows"]
            }),
        ),
        ToolSpec::function(
            "update_rows",
            "Update rows/documents matching equality filters.",
            json!({
                "type": "object",
                "properties": {
                    "table": { "type": "string" },
                    "filters": { "type": "object", "description": "Equality match conditions" },
                    "data": { "type": "object", "description": "New values to set" }
                },
                "required": ["table", "filters", "data"]
            }),
        ),
        ToolSpec::function(
            "delete_rows",
            "Delete rows/documents matching equality filters.",
            json!({
                "type": "object",
                "properties": {
                    "table": { "type": "string" },
                    "filters": { "type": "object", "description": "Equality match conditions" }
                },
                "required": ["table", "filters"]
            }),
        ),
        ToolSpec::function(
            "begin_transaction",
            "Begin a transaction. At most one may be open at a time.",
            no_params.clone(),
        ),
        ToolSpec::function(
            "commit_transaction",
            "Commit the open transaction.",
            no_params.clone(),
        ),
        ToolSpec::function(
            "rollback_transaction",
            "Roll back the open transaction.",
            no_params.clone(),
        ),
        ToolSpec::function(
            "get_raw_client",
            "Describe the underlying database client handle.",
            no_params,
        ),
    ]
}

pub fn tool_names() -> Vec<String> {
    catalog().into_iter().map(|t| t.function.name).collect()
}

/// Execute one tool invocation and render its result as text for the
/// conversation.
///
/// Read tools propagate typed errors to the caller. Write and transaction
/// tools instead catch adapter failures and report them as text, so a failed
/// write becomes something the model can react to rather than ending the turn.
pub async fn dispatch(
    adapter: &mut dyn DatabaseAdapter,
    name: &str,
    args: &Value,
) -> Result<String, DbError> {
    debug!(tool = name, "dispatching tool call");
    match name {
        "health_check" => Ok(if adapter.health_check().await {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        }),
        "get_capabilities" => to_text(&adapter.capabilities()),
        "get_database_schema" => to_text(&adapter.get_schema().await?),
        "list_tables" => to_text(&adapter.get_tables().await?),
        "get_table_columns" => {
            let table = str_arg(args, "table")?;
            to_text(&adapter.get_columns(table).await?)
        }
        "get_table_indexes" => {
            let table = str_arg(args, "table")?;
            to_text(&adapter.get_indexes(table).await?)
        }
        "execute_query" => {
            let query = query_arg(args)?;
            let params = params_arg(args);
            let limit = args.get("limit").and_then(Value::as_u64);
            let rows = adapter
                .execute_query(&query, params.as_deref(), limit)
                .await?;
            to_text(&rows)
        }
        "explain_query" => {
            let query = query_arg(args)?;
            to_text(&adapter.explain_query(&query).await?)
        }
        "aggregate_data" => {
            let table = str_arg(args, "table")?;
            let pipeline = args
                .get("pipeline")
                .ok_or_else(|| missing_arg("pipeline"))?;
            to_text(&adapter.aggregate(table, pipeline).await?)
        }
        "fetch_large_result" => {
            let query = query_arg(args)?;
            let batch_size = args
                .get("batch_size")
                .and_then(Value::as_u64)
                .unwrap_or(500) as usize;
            let mut stream = adapter.fetch_many(&query, batch_size).await?;
            let mut rows: Vec<Row> = Vec::new();
            use futures::TryStreamExt;
            while let Some(batch) = stream.try_next().await? {
                rows.extend(batch);
            }
            to_text(&rows)
        }
        "insert_row" => {
            let table = match str_arg(args, "table") {
                Ok(t) => t,
                Err(e) => return Ok(failure_text("insert", &e)),
            };
            let data = match obj_arg(args, "data") {
                Ok(d) => d,
                Err(e) => return Ok(failure_text("insert", &e)),
            };
            match adapter.insert(table, &data).await {
                Ok(result) => to_text(&result),
                Err(e) => Ok(failure_text("insert", &e)),
            }
        }
        "bulk_insert" => {
            let outcome = bulk_insert_args(args);
            match outcome {
                Ok((table, rows)) => match adapter.bulk_insert(&table, &rows).await {
                    Ok(result) => to_text(&result),
                    Err(e) => Ok(failure_text("bulk insert", &e)),
                },
                Err(e) => Ok(failure_text("bulk insert", &e)),
            }
        }
        "update_rows" => {
            let parsed = (|| {
                Ok::<_, DbError>((
                    str_arg(args, "table")?.to_string(),
                    obj_arg(args, "filters")?,
                    obj_arg(args, "data")?,
                ))
            })();
            match parsed {
                Ok((table, filters, data)) => match adapter.update(&table, &filters, &data).await {
                    Ok(result) => to_text(&result),
                    Err(e) => Ok(failure_text("update", &e)),
                },
                Err(e) => Ok(failure_text("update", &e)),
            }
        }
        "delete_rows" => {
            let parsed = (|| {
                Ok::<_, DbError>((str_arg(args, "table")?.to_string(), obj_arg(args, "filters")?))
            })();
            match parsed {
                Ok((table, filters)) => match adapter.delete(&table, &filters).await {
                    Ok(result) => to_text(&result),
                    Err(e) => Ok(failure_text("delete", &e)),
                },
                Err(e) => Ok(failure_text("delete", &e)),
            }
        }
        "begin_transaction" => Ok(match adapter.begin_transaction().await {
            Ok(()) => "transaction started".to_string(),
            Err(e) => failure_text("begin transaction", &e),
        }),
        "commit_transaction" => Ok(match adapter.commit().await {
            Ok(()) => "transaction committed".to_string(),
            Err(e) => failure_text("commit", &e),
        }),
        "rollback_transaction" => Ok(match adapter.rollback().await {
            Ok(()) => "transaction rolled back".to_string(),
            Err(e) => failure_text("rollback", &e),
        }),
        "get_raw_client" => Ok(adapter.raw_client()),
        unknown => Err(DbError::MalformedQuery(format!(
            "unknown tool: {}",
            unknown
        ))),
    }
}

fn to_text(value: &impl serde::Serialize) -> Result<String, DbError> {
    serde_json::to_string(value).map_err(|e| DbError::operation("serialize", e))
}

fn failure_text(action: &str, err: &DbError) -> String {
    format!("{} failed: {}", action, err)
}

fn missing_arg(name: &str) -> DbError {
    DbError::MalformedQuery(format!("missing required argument: {}", name))
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, DbError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| missing_arg(name))
}

fn obj_arg(args: &Value, name: &str) -> Result<Row, DbError> {
    args.get(name)
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| missing_arg(name))
}

fn query_arg(args: &Value) -> Result<Query, DbError> {
    let raw = args.get("query").ok_or_else(|| missing_arg("query"))?;
    serde_json::from_value(raw.clone()).map_err(|e| {
        DbError::MalformedQuery(format!("query must be SQL text or a document query: {}", e))
    })
}

fn params_arg(args: &Value) -> Option<Vec<Value>> {
    args.get("params").and_then(Value::as_array).cloned()
}

fn bulk_insert_args(args: &Value) -> Result<(String, Vec<Row>), DbError> {
    let table = str_arg(args, "table")?.to_string();
    let rows = args
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| missing_arg("rows"))?;
    let rows: Vec<Row> = rows
        .iter()
        .map(|r| {
            r.as_object()
                .cloned()
                .ok_or_else(|| DbError::MalformedQuery("each row must be an object".to_string()))
        })
        .collect::<Result<_, _>>()?;
    Ok((table, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SqliteAdapter;

    async fn memory_adapter() -> SqliteAdapter {
        let mut adapter = SqliteAdapter::connect("sqlite::memory:").await.unwrap();
        dispatch(
            &mut adapter,
            "execute_query",
            &json!({"query": "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"}),
        )
        .await
        .unwrap();
        adapter
    }

    #[test]
    fn test_catalog_names_are_stable() {
        let expected = [
            "health_check",
            "get_capabilities",
            "get_database_schema",
            "list_tables",
            "get_table_columns",
            "get_table_indexes",
            "execute_query",
            "explain_query",
            "aggregate_data",
            "fetch_large_result",
            "insert_row",
            "bulk_insert",
            "update_rows",
            "delete_rows",
            "begin_transaction",
            "commit_transaction",
            "rollback_transaction",
            "get_raw_client",
        ];
        assert_eq!(tool_names(), expected);
    }

    #[test]
    fn test_catalog_specs_are_function_typed() {
        for spec in catalog() {
            assert_eq!(spec.spec_type, "function");
            assert!(!spec.function.description.is_empty());
            assert!(spec.function.parameters.get("type").is_some());
        }
    }

    #[tokio::test]
    async fn test_dispatch_insert_and_query() {
        let mut adapter = memory_adapter().await;
        let result = dispatch(
            &mut adapter,
            "insert_row",
            &json!({"table": "users", "data": {"id": 1, "name": "ada"}}),
        )
        .await
        .unwrap();
        assert_eq!(result, r#"{"inserted":1}"#);

        let rows = dispatch(
            &mut adapter,
            "execute_query",
            &json!({"query": "SELECT name FROM users"}),
        )
        .await
        .unwrap();
        assert_eq!(rows, r#"[{"name":"ada"}]"#);
    }

    #[tokio::test]
    async fn test_write_failure_becomes_text_not_error() {
        let mut adapter = memory_adapter().await;
        let result = dispatch(
            &mut adapter,
            "insert_row",
            &json!({"table": "no_such_table", "data": {"x": 1}}),
        )
        .await
        .unwrap();
        assert!(result.starts_with("insert failed:"));

        // Missing arguments are also reported as text for write tools.
        let result = dispatch(&mut adapter, "update_rows", &json!({"table": "users"}))
            .await
            .unwrap();
        assert!(result.contains("failed"));
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let mut adapter = memory_adapter().await;
        let err = dispatch(
            &mut adapter,
            "execute_query",
            &json!({"query": "DROP TABLE users"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DbError::ForbiddenOperation { .. }));
    }

    #[tokio::test]
    async fn test_transaction_misuse_is_reported_as_text() {
        let mut adapter = memory_adapter().await;
        let result = dispatch(&mut adapter, "commit_transaction", &json!({}))
            .await
            .unwrap();
        assert!(result.contains("failed"));

        let result = dispatch(&mut adapter, "begin_transaction", &json!({}))
            .await
            .unwrap();
        assert_eq!(result, "transaction started");
        let result = dispatch(&mut adapter, "rollback_transaction", &json!({}))
            .await
            .unwrap();
        assert_eq!(result, "transaction rolled back");
    }

    #[tokio::test]
    async fn test_capabilities_and_raw_client() {
        let mut adapter = memory_adapter().await;
        let caps = dispatch(&mut adapter, "get_capabilities", &json!({}))
            .await
            .unwrap();
        let caps: Value = serde_json::from_str(&caps).unwrap();
        assert_eq!(caps["transactions"], json!(true));

        let raw = dispatch(&mut adapter, "get_raw_client", &json!({}))
            .await
            .unwrap();
        assert!(raw.contains("rusqlite"));
    }

    #[tokio::test]
    async fn test_fetch_large_result_returns_all_rows() {
        let mut adapter = memory_adapter().await;
        for i in 0..5 {
            dispatch(
                &mut adapter,
                "insert_row",
                &json!({"table": "users", "data": {"id": i}}),
            )
            .await
            .unwrap();
        }
        let rows = dispatch(
            &mut adapter,
            "fetch_large_result",
            &json!({"query": "SELECT id FROM users", "batch_size": 2}),
        )
        .await
        .unwrap();
        let rows: Vec<Value> = serde_json::from_str(&rows).unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let mut adapter = memory_adapter().await;
        let err = dispatch(&mut adapter, "drop_everything", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::MalformedQuery(_)));
    }
}
