//! Lexical classification of SQL text into read / write / unknown.
//!
//! This is deliberately not a parser: the first token (plus a couple of
//! two-word forms) decides the class. Anything unrecognized counts as a
//! write so ambiguous traffic is never treated as replica-safe.

/// Classification of one SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Read,
    Write,
    Unknown,
}

impl QueryClass {
    pub fn is_read(&self) -> bool {
        matches!(self, QueryClass::Read)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, QueryClass::Write)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::Read => "read",
            QueryClass::Write => "write",
            QueryClass::Unknown => "unknown",
        }
    }
}

/// Classify one SQL statement by its leading keyword(s).
pub fn classify(sql: &str) -> QueryClass {
    let upper = sql.trim_start().to_uppercase();
    let Some(first) = upper.split_whitespace().next() else {
        return QueryClass::Write;
    };
    // strip a trailing semicolon so bare statements like "COMMIT;" match
    let first = first.trim_end_matches(';');

    match first {
        "BEGIN" | "COMMIT" | "ROLLBACK" | "END" | "SET" => QueryClass::Unknown,
        "START" => {
            if upper.starts_with("START TRANSACTION") {
                QueryClass::Unknown
            } else {
                QueryClass::Write
            }
        }
        "SELECT" => {
            if upper.contains("FOR UPDATE") || upper.contains("FOR SHARE") {
                QueryClass::Write
            } else {
                QueryClass::Read
            }
        }
        "EXPLAIN" => {
            if upper.starts_with("EXPLAIN ANALYZE") {
                QueryClass::Write
            } else {
                QueryClass::Read
            }
        }
        "WITH" | "SHOW" | "DESCRIBE" | "DESC" => QueryClass::Read,
        "COPY" => {
            // COPY ... TO reads data out; every other COPY form loads it
            if upper.contains(" TO ") {
                QueryClass::Read
            } else {
                QueryClass::Write
            }
        }
        // INSERT, UPDATE, DELETE, MERGE, DDL, GRANT/REVOKE, maintenance
        // commands, SECURITY LABEL and anything unrecognized all count as
        // writes; ambiguous traffic must never be treated as replica-safe
        _ => QueryClass::Write,
    }
}
