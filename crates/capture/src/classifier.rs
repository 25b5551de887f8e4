//! Pure SQL classification: extract `(operation, table)` from a write
//! statement without touching the database.
//!
//! A strict token walk runs first; when it cannot find a table name, a
//! looser word scan takes over. Recall is preferred over strictness: a false
//! positive only costs the capture layer an extra before-image lookup, which
//! it tolerates.

use model::Operation;

/// Classify a statement. Returns `None` for SELECT, DDL, and anything else
/// that is not an INSERT/UPDATE/DELETE.
pub fn classify(sql: &str) -> Option<(Operation, String)> {
    let body = skip_noise(sql);
    let (word, _) = take_word(body)?;

    let operation = match word.to_ascii_uppercase().as_str() {
        "INSERT" => Operation::Insert,
        "UPDATE" => Operation::Update,
        "DELETE" => Operation::Delete,
        _ => return None,
    };

    parse_table(body, operation)
        .or_else(|| fallback_table(body, operation))
        .map(|table| (operation, table))
}

/// Lift the WHERE clause out of a statement, truncated at
/// ORDER BY / GROUP BY / LIMIT / OFFSET. Quoted regions are respected.
pub fn extract_where_clause(sql: &str) -> Option<String> {
    let start = find_keyword(sql, "WHERE")? + "WHERE".len();
    let mut clause = &sql[start..];

    let mut cut = clause.len();
    for kw in ["ORDER", "GROUP", "LIMIT", "OFFSET"] {
        if let Some(pos) = find_keyword(clause, kw) {
            cut = cut.min(pos);
        }
    }
    clause = &clause[..cut];

    let clause = clause.trim();
    if clause.is_empty() {
        None
    } else {
        Some(clause.to_string())
    }
}

/// Number of `?` placeholders outside quoted regions.
pub fn count_placeholders(fragment: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;

    for ch in fragment.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '?' => count += 1,
                _ => {}
            },
        }
    }
    count
}

/// Skip leading whitespace and `--` / `/* */` comments.
fn skip_noise(mut s: &str) -> &str {
    loop {
        s = s.trim_start();
        if let Some(rest) = s.strip_prefix("--") {
            match rest.find('\n') {
                Some(i) => s = &rest[i + 1..],
                None => return "",
            }
        } else if let Some(rest) = s.strip_prefix("/*") {
            match rest.find("*/") {
                Some(i) => s = &rest[i + 2..],
                None => return "",
            }
        } else {
            return s;
        }
    }
}

/// Take the next bare word (identifier characters only).
fn take_word(s: &str) -> Option<(&str, &str)> {
    let s = skip_noise(s);
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        None
    } else {
        Some((&s[..end], &s[end..]))
    }
}

/// Strict token walk for the three statement shapes.
fn parse_table(body: &str, operation: Operation) -> Option<String> {
    let (_, mut rest) = take_word(body)?;

    match operation {
        Operation::Insert => {
            // INSERT [OR <conflict-clause>] INTO <name>
            for _ in 0..3 {
                let (word, next) = take_word(rest)?;
                rest = next;
                if word.eq_ignore_ascii_case("INTO") {
                    return read_identifier(rest);
                }
            }
            None
        }
        Operation::Update => {
            // UPDATE [OR <conflict-clause>] <name> SET ...
            let probe = skip_noise(rest);
            if let Some((word, next)) = take_word(probe) {
                if word.eq_ignore_ascii_case("OR") {
                    let (_, next) = take_word(next)?;
                    return read_identifier(next);
                }
            }
            read_identifier(rest)
        }
        Operation::Delete => {
            // DELETE FROM <name>
            let (word, next) = take_word(rest)?;
            if word.eq_ignore_ascii_case("FROM") {
                read_identifier(next)
            } else {
                None
            }
        }
    }
}

/// Read a possibly quoted, possibly schema-qualified identifier and return
/// its final (table) component verbatim.
fn read_identifier(s: &str) -> Option<String> {
    let mut rest = skip_noise(s);
    let mut last: Option<String> = None;

    loop {
        let (part, after) = read_identifier_part(rest)?;
        last = Some(part);
        if let Some(stripped) = after.strip_prefix('.') {
            rest = stripped;
        } else {
            return last;
        }
    }
}

fn read_identifier_part(s: &str) -> Option<(String, &str)> {
    let mut chars = s.chars();
    let first = chars.next()?;

    let close = match first {
        '`' => Some('`'),
        '"' => Some('"'),
        '\'' => Some('\''),
        '[' => Some(']'),
        _ => None,
    };

    if let Some(close) = close {
        let inner = &s[first.len_utf8()..];
        let end = inner.find(close)?;
        return Some((inner[..end].to_string(), &inner[end + close.len_utf8()..]));
    }

    let end = s
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || matches!(c, '(' | ',' | ';' | '.'))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    if end == 0 {
        None
    } else {
        Some((s[..end].to_string(), &s[end..]))
    }
}

/// Lenient word scan used when the token walk finds no name.
fn fallback_table(body: &str, operation: Operation) -> Option<String> {
    let words: Vec<&str> = body.split_whitespace().collect();

    let raw = match operation {
        Operation::Insert => words
            .iter()
            .position(|w| w.eq_ignore_ascii_case("INTO"))
            .and_then(|i| words.get(i + 1)),
        Operation::Update => match words.get(1) {
            Some(w) if w.eq_ignore_ascii_case("OR") => words.get(3),
            other => other,
        },
        Operation::Delete => match words.get(1) {
            Some(w) if w.eq_ignore_ascii_case("FROM") => words.get(2),
            other => other,
        },
    }?;

    let chunk = raw.split('(').next().unwrap_or(raw);
    let chunk = chunk.trim_end_matches([',', ';']);
    let chunk = chunk.rsplit('.').next().unwrap_or(chunk);
    let chunk = chunk.trim_matches(['`', '"', '\'', '[', ']']);

    if chunk.is_empty() {
        None
    } else {
        Some(chunk.to_string())
    }
}

/// Find a standalone keyword outside quoted regions, case-insensitively.
fn find_keyword(sql: &str, keyword: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let klen = keyword.len();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i + klen <= bytes.len() {
        let ch = bytes[i];
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match ch {
            b'\'' | b'"' | b'`' => {
                quote = Some(ch);
                i += 1;
                continue;
            }
            _ => {}
        }

        if sql[i..i + klen].eq_ignore_ascii_case(keyword) {
            let before_ok = i == 0 || !is_ident_byte(bytes[i - 1]);
            let after_ok = i + klen == bytes.len() || !is_ident_byte(bytes[i + klen]);
            if before_ok && after_ok {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_of(sql: &str) -> Option<String> {
        classify(sql).map(|(_, t)| t)
    }

    #[test]
    fn classifies_basic_writes() {
        assert_eq!(
            classify("INSERT INTO users (name) VALUES ('test')"),
            Some((Operation::Insert, "users".into()))
        );
        assert_eq!(
            classify("UPDATE orders SET status = 'done'"),
            Some((Operation::Update, "orders".into()))
        );
        assert_eq!(
            classify("DELETE FROM sessions WHERE id = 1"),
            Some((Operation::Delete, "sessions".into()))
        );
    }

    #[test]
    fn ignores_reads_and_ddl() {
        assert_eq!(classify("SELECT * FROM users"), None);
        assert_eq!(classify("CREATE TABLE t (id INTEGER)"), None);
        assert_eq!(classify("DROP TABLE t"), None);
        assert_eq!(classify("PRAGMA journal_mode=WAL"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn handles_case_and_leading_whitespace() {
        assert_eq!(
            classify("\n\t  insert into Users values (1)"),
            Some((Operation::Insert, "Users".into()))
        );
    }

    #[test]
    fn handles_leading_comments() {
        assert_eq!(
            table_of("-- add a row\nINSERT INTO users VALUES (1)"),
            Some("users".into())
        );
        assert_eq!(
            table_of("/* bulk path */ UPDATE users SET name = 'x'"),
            Some("users".into())
        );
    }

    #[test]
    fn handles_quoted_names_verbatim() {
        assert_eq!(table_of("INSERT INTO `users` VALUES (1)"), Some("users".into()));
        assert_eq!(
            table_of("UPDATE \"user accounts\" SET active = 0"),
            Some("user accounts".into())
        );
        assert_eq!(
            table_of("DELETE FROM 'weird-table!' WHERE id = 1"),
            Some("weird-table!".into())
        );
        assert_eq!(table_of("DELETE FROM [t 1] WHERE id = 1"), Some("t 1".into()));
    }

    #[test]
    fn handles_schema_qualification() {
        assert_eq!(table_of("INSERT INTO main.users VALUES (1)"), Some("users".into()));
        assert_eq!(
            table_of("UPDATE main.`users` SET name = 'x'"),
            Some("users".into())
        );
        assert_eq!(table_of("DELETE FROM aux.logs"), Some("logs".into()));
    }

    #[test]
    fn handles_column_list_adjacent_to_name() {
        assert_eq!(
            table_of("INSERT INTO users(id, name) VALUES (1, 'a')"),
            Some("users".into())
        );
    }

    #[test]
    fn handles_conflict_clauses() {
        assert_eq!(
            table_of("INSERT OR REPLACE INTO users VALUES (1)"),
            Some("users".into())
        );
        assert_eq!(
            table_of("UPDATE OR IGNORE users SET name = 'x'"),
            Some("users".into())
        );
    }

    #[test]
    fn fallback_covers_delete_without_from() {
        // Not valid SQLite, but the lenient path should still name the table.
        assert_eq!(table_of("DELETE users WHERE id = 1"), Some("users".into()));
    }

    #[test]
    fn extracts_where_clause() {
        assert_eq!(
            extract_where_clause("UPDATE t SET a = 1 WHERE id = 5"),
            Some("id = 5".into())
        );
        assert_eq!(
            extract_where_clause("DELETE FROM t WHERE a = 1 AND b = 2 ORDER BY a LIMIT 1"),
            Some("a = 1 AND b = 2".into())
        );
        assert_eq!(extract_where_clause("UPDATE t SET a = 1"), None);
    }

    #[test]
    fn where_inside_string_literal_is_ignored() {
        assert_eq!(
            extract_where_clause("UPDATE t SET a = 'where it ends' WHERE id = 1"),
            Some("id = 1".into())
        );
    }

    #[test]
    fn counts_placeholders_outside_quotes() {
        assert_eq!(count_placeholders("id = ? AND name = ?"), 2);
        assert_eq!(count_placeholders("name = 'a?b' AND id = ?"), 1);
        assert_eq!(count_placeholders("id = 1"), 0);
    }
}
