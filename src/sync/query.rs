//! Per-table SQL assembly for SQL-shaped stores.
//!
//! The engine does not talk to a database; it hands stores a query string
//! with the node-id and timestamp filters already injected. The injected
//! clauses are literals, so user-supplied positional parameters keep their
//! numbering.

use super::store::{ModifiedFilter, NodeFilter};

/// Build the SQL for one table: the custom query (or the default
/// `SELECT * FROM <table>`) with the filter clauses injected ahead of any
/// user-supplied WHERE predicate.
pub fn table_query(
    table: &str,
    custom: Option<&str>,
    node: &NodeFilter,
    modified: &ModifiedFilter,
) -> String {
    let base = custom
        .map(str::to_string)
        .unwrap_or_else(|| format!("SELECT * FROM {table}"));
    let clauses = format!(
        "{} AND {}",
        node_clause(table, node),
        modified_clause(table, modified)
    );

    if let Some((_, end)) = keyword_span(&base, "WHERE") {
        // Injected clauses go first: WHERE <ours> AND <user predicate>.
        let head = base[..end].trim_end();
        let tail = base[end..].trim_start();
        format!("{head} {clauses} AND {tail}")
    } else if let Some(start) = trailing_clause_start(&base) {
        let head = base[..start].trim_end();
        let tail = &base[start..];
        format!("{head} WHERE {clauses} {tail}")
    } else {
        format!("{} WHERE {clauses}", base.trim_end())
    }
}

fn node_clause(table: &str, node: &NodeFilter) -> String {
    match node {
        NodeFilter::Only(id) => format!("{table}.node_id = '{id}'"),
        NodeFilter::Except(id) => format!("{table}.node_id != '{id}'"),
    }
}

fn modified_clause(table: &str, modified: &ModifiedFilter) -> String {
    match modified {
        ModifiedFilter::On(hlc) => format!("{table}.modified = '{hlc}'"),
        ModifiedFilter::After(hlc) => format!("{table}.modified > '{hlc}'"),
    }
}

/// First GROUP BY / ORDER BY / LIMIT / HAVING outside quotes, if the query
/// has trailing clauses but no WHERE.
fn trailing_clause_start(sql: &str) -> Option<usize> {
    ["GROUP", "ORDER", "LIMIT", "HAVING"]
        .iter()
        .filter_map(|keyword| keyword_span(sql, keyword).map(|(start, _)| start))
        .min()
}

/// Byte span of the first standalone `keyword` outside single-quoted
/// strings, case-insensitive.
fn keyword_span(sql: &str, keyword: &str) -> Option<(usize, usize)> {
    let bytes = sql.as_bytes();
    let upper = sql.to_ascii_uppercase();
    let mut in_string = false;
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\'' {
            in_string = !in_string;
            index += 1;
            continue;
        }
        if !in_string && upper[index..].starts_with(keyword) {
            let end = index + keyword.len();
            let before_ok = index == 0 || !bytes[index - 1].is_ascii_alphanumeric();
            let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
            if before_ok && after_ok {
                return Some((index, end));
            }
        }
        index += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Hlc, NodeId};

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn injects_before_user_where() {
        let sql = table_query(
            "test",
            Some("SELECT * FROM test WHERE a != ?1 AND b = ?2"),
            &NodeFilter::Except(node("N")),
            &ModifiedFilter::After(Hlc::zero(node("N"))),
        );
        assert_eq!(
            sql,
            "SELECT * FROM test WHERE test.node_id != 'N' AND \
             test.modified > '1970-01-01T00:00:00.000Z-0000-N' AND a != ?1 AND b = ?2"
        );
    }

    #[test]
    fn default_template_gains_a_where() {
        let sql = table_query(
            "t",
            None,
            &NodeFilter::Only(node("p")),
            &ModifiedFilter::On(Hlc::new(1_000, 1, node("p"))),
        );
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE t.node_id = 'p' AND \
             t.modified = '1970-01-01T00:00:01.000Z-0001-p'"
        );
    }

    #[test]
    fn trailing_clauses_stay_after_the_filters() {
        let sql = table_query(
            "t",
            Some("SELECT * FROM t ORDER BY a"),
            &NodeFilter::Only(node("p")),
            &ModifiedFilter::After(Hlc::zero(node("p"))),
        );
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE t.node_id = 'p' AND \
             t.modified > '1970-01-01T00:00:00.000Z-0000-p' ORDER BY a"
        );
    }

    #[test]
    fn where_inside_string_literal_is_ignored() {
        let sql = table_query(
            "t",
            Some("SELECT * FROM t ORDER BY 'where'"),
            &NodeFilter::Only(node("p")),
            &ModifiedFilter::After(Hlc::zero(node("p"))),
        );
        assert!(sql.contains("WHERE t.node_id = 'p'"));
        assert!(sql.ends_with("ORDER BY 'where'"));
    }

    #[test]
    fn lowercase_where_is_found() {
        let sql = table_query(
            "t",
            Some("select * from t where a = ?1"),
            &NodeFilter::Except(node("p")),
            &ModifiedFilter::After(Hlc::zero(node("p"))),
        );
        assert_eq!(
            sql,
            "select * from t where t.node_id != 'p' AND \
             t.modified > '1970-01-01T00:00:00.000Z-0000-p' AND a = ?1"
        );
    }
}
