//! Read/write routing between the primary and replica pools.
//!
//! A statement may go to the replica only when it cannot mutate state or take
//! row locks. The check is lexical and deliberately conservative: anything
//! that is not recognisably a plain read goes to the primary.

use serde::{Deserialize, Serialize};

/// The pool a statement runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolTarget {
    /// The read/write primary.
    Primary,
    /// The read-only replica.
    Replica,
}

impl std::fmt::Display for PoolTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Replica => f.write_str("replica"),
        }
    }
}

/// Keywords that make a `WITH` statement a write.
const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

/// Functions with side effects that must run on the primary.
const SIDE_EFFECT_FUNCTIONS: &[&str] = &["NEXTVAL", "SETVAL", "PG_ADVISORY_LOCK", "PG_ADVISORY_XACT_LOCK"];

/// Split SQL into upper-cased word tokens, dropping string literals and
/// comments so their contents cannot influence routing.
fn tokens(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut word = String::new();
    let mut chars = sql.chars().peekable();

    let flush = |word: &mut String, out: &mut Vec<String>| {
        if !word.is_empty() {
            out.push(word.to_ascii_uppercase());
            word.clear();
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                flush(&mut word, &mut out);
                // Skip to the closing quote; '' is an escaped quote and just
                // re-enters the literal.
                for next in chars.by_ref() {
                    if next == '\'' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                flush(&mut word, &mut out);
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                flush(&mut word, &mut out);
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            c if c.is_ascii_alphanumeric() || c == '_' => word.push(c),
            _ => flush(&mut word, &mut out),
        }
    }
    flush(&mut word, &mut out);
    out
}

/// Whether `sql` is safe to run on a read replica.
///
/// Accepted: a `SELECT`, or a `WITH` query whose body contains no
/// `INSERT`/`UPDATE`/`DELETE`/`MERGE`. Rejected regardless: locking clauses
/// (`FOR UPDATE`, `FOR SHARE`, `FOR NO KEY UPDATE`, `FOR KEY SHARE`) and
/// sequence or advisory-lock functions.
pub fn is_replica_safe(sql: &str) -> bool {
    let tokens = tokens(sql);
    let Some(first) = tokens.first() else {
        return false;
    };

    let read_shaped = match first.as_str() {
        "SELECT" => true,
        "WITH" => !tokens
            .iter()
            .any(|t| WRITE_KEYWORDS.contains(&t.as_str())),
        _ => false,
    };
    if !read_shaped {
        return false;
    }

    let locks = tokens.windows(2).any(|pair| {
        matches!(
            (pair.first().map(String::as_str), pair.get(1).map(String::as_str)),
            (Some("FOR"), Some("UPDATE" | "SHARE" | "NO" | "KEY"))
        )
    });
    if locks {
        return false;
    }

    !tokens
        .iter()
        .any(|t| SIDE_EFFECT_FUNCTIONS.contains(&t.as_str()))
}

/// Pick the pool for a statement.
pub fn route(sql: &str, use_primary: bool, has_replica: bool) -> PoolTarget {
    if !use_primary && has_replica && is_replica_safe(sql) {
        PoolTarget::Replica
    } else {
        PoolTarget::Primary
    }
}
