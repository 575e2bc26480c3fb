// crates/db/src/search.rs
//! Full-text search over the catalog's message projection.
//!
//! Two FTS5 indexes sit over the same escaped text: `message_stems`
//! (porter/unicode61) answers word-ish queries with stemming, and
//! `message_trigrams` catches substring matches the stemmer misses. A query
//! runs against the stems first and falls back to trigrams when nothing
//! matches. BM25 ordering, FTS5 defaults.

use rusqlite::params;

use angel_core::escape::unescape_searchable;

use crate::error::StoreResult;
use crate::handle::{SessionExec, SessionHandle};

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub session_id: String,
    pub message_id: i64,
    /// Unescaped snippet around the match.
    pub snippet: String,
    pub rank: f64,
}

/// Quote each whitespace token so user input can never hit FTS5 query
/// syntax (`AND`, `-`, `*`, quotes).
fn fts_quote(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Search user/model messages across all tracked sessions.
pub fn search_messages(
    catalog: &SessionHandle,
    query: &str,
    limit: usize,
) -> StoreResult<Vec<SearchHit>> {
    let quoted = fts_quote(query);
    if quoted.is_empty() {
        return Ok(Vec::new());
    }

    let stems = run_fts(catalog, "message_stems", &quoted, limit)?;
    if !stems.is_empty() {
        return Ok(stems);
    }
    // Trigram fallback wants the raw text (its tokens are the substrings).
    run_fts(catalog, "message_trigrams", &quoted, limit)
}

fn run_fts(
    catalog: &SessionHandle,
    table: &str,
    quoted_query: &str,
    limit: usize,
) -> StoreResult<Vec<SearchHit>> {
    let sql = format!(
        "SELECT session_id, message_id,
                snippet({table}, 2, '', '', '…', 16),
                bm25({table}) AS rank
           FROM {table}
          WHERE {table} MATCH ?1
          ORDER BY rank
          LIMIT ?2"
    );
    catalog.query_rows(&sql, params![quoted_query, limit as i64], |row| {
        let raw: String = row.get(2)?;
        Ok(SearchHit {
            session_id: row.get(0)?,
            message_id: row.get(1)?,
            snippet: unescape_searchable(&raw),
            rank: row.get(3)?,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_quote_wraps_tokens() {
        assert_eq!(fts_quote("hello world"), "\"hello\" \"world\"");
        assert_eq!(fts_quote("a AND b"), "\"a\" \"AND\" \"b\"");
        assert_eq!(fts_quote("say \"hi\""), "\"say\" \"\"\"hi\"\"\"");
        assert_eq!(fts_quote("   "), "");
    }
}
