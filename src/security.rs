use crate::error::DbError;

/// Schema-destroying keywords. Rejected on the raw-query path regardless of
/// mode: the tool surface has no legitimate use for them.
const DDL_KEYWORDS: &[&str] = &["DROP", "TRUNCATE", "ALTER"];

/// Row-mutating keywords. Rejected on the raw-query path unless the caller
/// explicitly allows them. Structured write tools bind their arguments and
/// never pass through here, so blocking these only closes the free-text
/// bypass around those tools.
const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE"];

/// Scan a raw backend-native query string for forbidden keywords.
///
/// This is a lexical heuristic, not a parser. A keyword inside a quoted
/// string literal or an identifier will trip it (false positive), and
/// keyword synonyms or stored-procedure indirection will slip past it
/// (false negative). It is an accepted guardrail, not a security boundary.
pub fn validate_sql(query: &str, allow_write_keywords: bool) -> Result<(), DbError> {
    let upper = query.to_uppercase();

    for &keyword in DDL_KEYWORDS {
        if contains_word(&upper, keyword) {
            return Err(DbError::ForbiddenOperation {
                keyword: keyword.to_string(),
            });
        }
    }

    if !allow_write_keywords {
        for &keyword in DML_KEYWORDS {
            if contains_word(&upper, keyword) {
                return Err(DbError::ForbiddenOperation {
                    keyword: keyword.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Whole-word containment: `DROP` must not match inside `DROPLET`.
fn contains_word(haystack: &str, word: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !haystack[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        let after = abs + word.len();
        let after_ok = after >= haystack.len()
            || !haystack[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}
