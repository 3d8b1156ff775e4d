//! Defence-in-depth deny-list for ad-hoc SQL (C8).
//!
//! Not wired to any endpoint in this binary — the read surface is a fixed
//! catalog of analytical methods on [`crate::storage::Provider`]. This guard
//! exists so an out-of-scope ad-hoc SQL endpoint, if one is ever added
//! upstream of this crate, has a ready-made reject function to call first.
//! It is not a sanitiser and must never be relied on as the sole defence.

use crate::error::Validation;

const FORBIDDEN_KEYWORDS: [&str; 7] = ["DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE", "EXEC"];
const FORBIDDEN_TOKENS: [&str; 2] = ["--", ";"];

/// Rejects a SQL string containing any destructive keyword or statement
/// separator. Case-insensitive.
pub fn validate_sql_query(query: &str) -> Result<(), Validation> {
    let upper = query.to_uppercase();
    for keyword in FORBIDDEN_KEYWORDS {
        if upper.contains(keyword) {
            return Err(Validation::new(format!("query contains forbidden keyword: {keyword}")));
        }
    }
    for token in FORBIDDEN_TOKENS {
        if upper.contains(token) {
            return Err(Validation::new(format!("query contains forbidden token: {token}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_select() {
        assert!(validate_sql_query("SELECT * FROM metrics_catalog WHERE name = 'up'").is_ok());
    }

    #[test]
    fn rejects_drop_table() {
        assert!(validate_sql_query("DROP TABLE queries").is_err());
    }

    #[test]
    fn rejects_statement_separator() {
        assert!(validate_sql_query("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn rejects_comment_token() {
        assert!(validate_sql_query("SELECT 1 -- comment").is_err());
    }

    #[test]
    fn is_case_insensitive() {
        assert!(validate_sql_query("drop table queries").is_err());
    }
}
