//! SQL text plumbing shared by the relational adapters.
//!
//! Values are always parameter-bound by the drivers; table and column names
//! cannot be bound that way, so everything that lands in a structural
//! position must pass [`validate_identifier`] before it is interpolated into
//! a clause template.

use crate::error::DbError;

/// Placeholder style of the target dialect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placeholder {
    /// PostgreSQL-style `$1`, `$2`, ...
    Dollar,
    /// MySQL/SQLite-style `?`.
    Question,
}

impl Placeholder {
    fn render(&self, index: usize) -> String {
        match self {
            Placeholder::Dollar => format!("${}", index),
            Placeholder::Question => "?".to_string(),
        }
    }
}

/// Reject table/column names that could smuggle SQL into a structural
/// position. Dotted qualification (`schema.table`) is allowed; each segment
/// must look like a plain identifier.
pub fn validate_identifier(name: &str) -> Result<(), DbError> {
    if name.is_empty() {
        return Err(DbError::MalformedQuery("empty identifier".to_string()));
    }
    for segment in name.split('.') {
        let mut chars = segment.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };
        if !valid {
            return Err(DbError::MalformedQuery(format!(
                "unsafe identifier: {:?}",
                name
            )));
        }
    }
    Ok(())
}

/// `INSERT INTO t (a, b) VALUES ($1, $2)`.
pub fn build_insert(
    table: &str,
    columns: &[&str],
    placeholder: Placeholder,
) -> Result<String, DbError> {
    validate_identifier(table)?;
    if columns.is_empty() {
        return Err(DbError::MalformedQuery("insert with no columns".to_string()));
    }
    for col in columns {
        validate_identifier(col)?;
    }
    let values: Vec<String> = (1..=columns.len())
        .map(|i| placeholder.render(i))
        .collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        values.join(", ")
    ))
}

/// `UPDATE t SET a = $1 WHERE b = $2 AND c = $3`.
/// Parameters are numbered across the SET clause first, then the filters.
pub fn build_update(
    table: &str,
    set_columns: &[&str],
    filter_columns: &[&str],
    placeholder: Placeholder,
) -> Result<String, DbError> {
    validate_identifier(table)?;
    if set_columns.is_empty() {
        return Err(DbError::MalformedQuery("update with no columns".to_string()));
    }
    if filter_columns.is_empty() {
        return Err(DbError::MalformedQuery(
            "update with no filters refused".to_string(),
        ));
    }
    for col in set_columns.iter().chain(filter_columns) {
        validate_identifier(col)?;
    }
    let set: Vec<String> = set_columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = {}", col, placeholder.render(i + 1)))
        .collect();
    let offset = set_columns.len();
    let filters: Vec<String> = filter_columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = {}", col, placeholder.render(offset + i + 1)))
        .collect();
    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        set.join(", "),
        filters.join(" AND ")
    ))
}

/// `DELETE FROM t WHERE a = $1 AND b = $2`.
pub fn build_delete(
    table: &str,
    filter_columns: &[&str],
    placeholder: Placeholder,
) -> Result<String, DbError> {
    validate_identifier(table)?;
    if filter_columns.is_empty() {
        return Err(DbError::MalformedQuery(
            "delete with no filters refused".to_string(),
        ));
    }
    for col in filter_columns {
        validate_identifier(col)?;
    }
    let filters: Vec<String> = filter_columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = {}", col, placeholder.render(i + 1)))
        .collect();
    Ok(format!(
        "DELETE FROM {} WHERE {}",
        table,
        filters.join(" AND ")
    ))
}

/// Append a LIMIT clause, the relational idiom for bounding raw-query reads.
pub fn apply_limit(sql: &str, limit: Option<u64>) -> String {
    match limit {
        Some(n) => {
            let mut trimmed = sql.trim_end();
            while let Some(stripped) = trimmed.strip_suffix(';') {
                trimmed = stripped.trim_end();
            }
            format!("{} LIMIT {}", trimmed, n)
        }
        None => sql.to_string(),
    }
}
