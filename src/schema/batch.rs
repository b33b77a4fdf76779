//! DDL batching used when applying many table creations at once.

/// Group `sqls` into `;`-joined batches of at most `batch_size` statements,
/// preserving input order. A batch size of 0 or 1 leaves the input as is.
pub fn batch_sqls(sqls: &[String], batch_size: usize) -> Vec<String> {
    if batch_size <= 1 {
        return sqls.to_vec();
    }
    sqls.chunks(batch_size).map(|chunk| chunk.join(";")).collect()
}

/// True when every statement creates a table or a view. Only such
/// statements are safe to batch together.
pub fn all_sqls_are_create_queries(sqls: &[String]) -> bool {
    sqls.iter().all(|sql| is_create_statement(sql))
}

fn is_create_statement(sql: &str) -> bool {
    let mut words = sql.split_whitespace().map(str::to_ascii_lowercase);
    if words.next().as_deref() != Some("create") {
        return false;
    }
    loop {
        match words.next().as_deref() {
            Some("table") | Some("view") => return true,
            // CREATE OR REPLACE VIEW, CREATE TEMPORARY TABLE, ...
            Some("or") | Some("replace") | Some("temporary") | Some("algorithm") => continue,
            Some(w) if w.starts_with("algorithm=") || w.starts_with("definer=") => continue,
            _ => return false,
        }
    }
}
