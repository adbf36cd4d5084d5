mod mongo;
mod mysql;
mod postgres;
pub mod sql;
mod sqlite;

pub use mongo::MongoAdapter;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::DbError;

/// One result row (relational) or document (Mongo), as a JSON object.
/// Results feed a text conversation, so everything is normalized to JSON.
pub type Row = serde_json::Map<String, Value>;

/// Finite, non-restartable sequence of row batches from `fetch_many`.
pub type RowBatchStream = BoxStream<'static, Result<Vec<Row>, DbError>>;

/// The backend families we can construct adapters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    MySql,
    Sqlite,
    Mongo,
}

impl BackendKind {
    /// URL scheme prefixes accepted for this kind. Checked by the factory
    /// before any connection attempt.
    pub fn url_prefixes(&self) -> &'static [&'static str] {
        match self {
            BackendKind::Postgres => &["postgres://", "postgresql://"],
            BackendKind::MySql => &["mysql://"],
            BackendKind::Sqlite => &["sqlite://", "sqlite:"],
            BackendKind::Mongo => &["mongodb://", "mongodb+srv://"],
        }
    }

    /// Fail fast on a descriptor whose scheme contradicts the declared kind,
    /// instead of surfacing an opaque driver error later.
    pub fn validate_url(&self, url: &str) -> Result<(), DbError> {
        if self.url_prefixes().iter().any(|p| url.starts_with(p)) {
            return Ok(());
        }
        Err(DbError::InvalidDescriptor {
            kind: self.to_string(),
            reason: format!(
                "URL must start with one of {:?}",
                self.url_prefixes()
            ),
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Postgres => "postgres",
            BackendKind::MySql => "mysql",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Mongo => "mongodb",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BackendKind {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "mysql" => Ok(BackendKind::MySql),
            "sqlite" => Ok(BackendKind::Sqlite),
            "mongo" | "mongodb" => Ok(BackendKind::Mongo),
            other => Err(DbError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Fixed ability flags an adapter declares at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub transactions: bool,
    pub schema_introspection: bool,
    pub aggregation: bool,
}

/// A read query, in the shape the backend family understands.
///
/// Relational backends take raw SQL text; the document store takes a
/// structured target + filter. An adapter rejects the wrong arm with
/// [`DbError::MalformedQuery`] instead of coercing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Query {
    Sql(String),
    Document(DocumentQuery),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentQuery {
    pub collection: String,
    #[serde(default)]
    pub filter: Option<Value>,
}

impl Query {
    pub fn expect_sql(&self) -> Result<&str, DbError> {
        match self {
            Query::Sql(sql) => Ok(sql),
            Query::Document(_) => Err(DbError::MalformedQuery(
                "this backend takes SQL text, not a structured document query".to_string(),
            )),
        }
    }

    pub fn expect_document(&self) -> Result<&DocumentQuery, DbError> {
        match self {
            Query::Document(doc) => Ok(doc),
            Query::Sql(_) => Err(DbError::MalformedQuery(
                "this backend takes a structured query with a 'collection' key, not SQL text; \
                 example: {\"collection\": \"users\", \"filter\": {\"age\": {\"$gt\": 18}}}"
                    .to_string(),
            )),
        }
    }
}

/// Uniform contract over one live backend connection.
///
/// Methods take `&mut self`: a connection here is a single logical resource,
/// owned exclusively by one session and never used concurrently.
#[async_trait]
pub trait DatabaseAdapter: Send + std::fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Fixed at construction; computable without touching the connection.
    fn capabilities(&self) -> Capabilities;

    /// Release the connection. The adapter must not be used afterwards.
    async fn close(&mut self) -> Result<(), DbError>;

    /// Trivial round-trip probe. Never errors; unreachable means `false`.
    async fn health_check(&mut self) -> bool;

    /// Tables/collections mapped to their column/field names.
    async fn get_schema(&mut self) -> Result<Row, DbError>;

    async fn get_tables(&mut self) -> Result<Vec<String>, DbError>;

    /// Column names for a table. The document-store variant samples one
    /// document, so the field set is a best-effort approximation.
    async fn get_columns(&mut self, table: &str) -> Result<Vec<String>, DbError>;

    /// Index metadata in the backend's native shape; opaque to callers.
    async fn get_indexes(&mut self, table: &str) -> Result<Value, DbError>;

    /// Run a read query. The validation guard is applied in raw-query mode,
    /// and `limit` is applied by the backend-idiomatic mechanism.
    async fn execute_query(
        &mut self,
        query: &Query,
        params: Option<&[Value]>,
        limit: Option<u64>,
    ) -> Result<Vec<Row>, DbError>;

    /// Native execution plan; format is backend-specific and not normalized.
    async fn explain_query(&mut self, query: &Query) -> Result<Value, DbError>;

    async fn insert(&mut self, table: &str, data: &Row) -> Result<Value, DbError>;

    async fn bulk_insert(&mut self, table: &str, rows: &[Row]) -> Result<Value, DbError>;

    async fn update(&mut self, table: &str, filters: &Row, data: &Row) -> Result<Value, DbError>;

    async fn delete(&mut self, table: &str, filters: &Row) -> Result<Value, DbError>;

    /// At most one transaction may be outstanding. Backends without
    /// transaction support (`capabilities().transactions == false`) accept
    /// these as logged no-ops; everyone else fails loudly on misuse.
    async fn begin_transaction(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Relational: `pipeline` is a complete aggregate query string.
    /// Document store: `pipeline` is an ordered array of stage objects.
    async fn aggregate(&mut self, table: &str, pipeline: &Value) -> Result<Vec<Row>, DbError>;

    /// Batched reads for large result sets. Batch size is advisory;
    /// backends may return fewer rows per batch.
    async fn fetch_many(
        &mut self,
        query: &Query,
        batch_size: usize,
    ) -> Result<RowBatchStream, DbError>;

    /// Pre-flight a query without executing it.
    fn validate_query(&self, query: &Query) -> Result<(), DbError>;

    /// Textual description of the underlying client, the escape hatch the
    /// tool surface exposes for operations this abstraction does not cover.
    fn raw_client(&self) -> String;
}

/// Validate the descriptor against the kind, construct the concrete adapter
/// and return it connected.
pub async fn create_adapter(
    kind: BackendKind,
    url: &str,
) -> Result<Box<dyn DatabaseAdapter>, DbError> {
    kind.validate_url(url)?;
    let adapter: Box<dyn DatabaseAdapter> = match kind {
        BackendKind::Postgres => Box::new(PostgresAdapter::connect(url).await?),
        BackendKind::MySql => Box::new(MySqlAdapter::connect(url).await?),
        BackendKind::Sqlite => Box::new(SqliteAdapter::connect(url).await?),
        BackendKind::Mongo => Box::new(MongoAdapter::connect(url).await?),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing_aliases() {
        assert_eq!("postgres".parse::<BackendKind>().unwrap(), BackendKind::Postgres);
        assert_eq!("postgresql".parse::<BackendKind>().unwrap(), BackendKind::Postgres);
        assert_eq!("MySQL".parse::<BackendKind>().unwrap(), BackendKind::MySql);
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert_eq!("mongo".parse::<BackendKind>().unwrap(), BackendKind::Mongo);
        assert_eq!("mongodb".parse::<BackendKind>().unwrap(), BackendKind::Mongo);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = "oracle".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, DbError::UnsupportedBackend(k) if k == "oracle"));
    }

    #[test]
    fn test_descriptor_scheme_must_match_kind() {
        assert!(BackendKind::Postgres
            .validate_url("postgres://user:pw@localhost/db")
            .is_ok());
        assert!(BackendKind::Postgres
            .validate_url("postgresql://user:pw@localhost/db")
            .is_ok());
        assert!(BackendKind::Mongo
            .validate_url("mongodb+srv://cluster.example.net/db")
            .is_ok());

        let err = BackendKind::Postgres
            .validate_url("mongodb://localhost/db")
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidDescriptor { .. }));

        let err = BackendKind::Mongo
            .validate_url("postgres://localhost/db")
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidDescriptor { .. }));
    }

    #[tokio::test]
    async fn test_factory_fails_fast_on_mismatch_without_connecting() {
        // The mismatch is caught before any network attempt, so this returns
        // immediately even though nothing is listening anywhere.
        let err = create_adapter(BackendKind::MySql, "mongodb://localhost/db")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_query_arms_deserialize_untagged() {
        let q: Query = serde_json::from_value(serde_json::json!("SELECT 1")).unwrap();
        assert!(matches!(q, Query::Sql(_)));

        let q: Query = serde_json::from_value(serde_json::json!({
            "collection": "users",
            "filter": {"age": {"$gt": 18}}
        }))
        .unwrap();
        match q {
            Query::Document(doc) => {
                assert_eq!(doc.collection, "users");
                assert!(doc.filter.is_some());
            }
            other => panic!("expected document arm, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_arm_is_descriptive() {
        let sql = Query::Sql("SELECT 1".to_string());
        let err = sql.expect_document().unwrap_err();
        assert!(err.to_string().contains("collection"));

        let doc = Query::Document(DocumentQuery {
            collection: "users".to_string(),
            filter: None,
        });
        assert!(doc.expect_sql().is_err());
    }
}
