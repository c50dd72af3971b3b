//! Lightweight SQL front end: statement preview, tokenizing, statement
//! splitting, fingerprinting and SET-statement parsing. Full AST parsing
//! goes through sqlparser and is only needed off the hot path.

use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

/// Coarse statement classification, derived from the leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtType {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Set,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Use,
    Show,
    Explain,
    Ddl,
    Comment,
    Other,
}

impl StmtType {
    /// Statement kinds the executor handles without building a plan
    pub fn handled_without_plan(self) -> bool {
        matches!(
            self,
            StmtType::Set
                | StmtType::Begin
                | StmtType::Commit
                | StmtType::Rollback
                | StmtType::Savepoint
                | StmtType::Use
                | StmtType::Show
                | StmtType::Comment
        )
    }

    pub fn is_dml(self) -> bool {
        matches!(
            self,
            StmtType::Insert | StmtType::Replace | StmtType::Update | StmtType::Delete
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            StmtType::Select => "SELECT",
            StmtType::Insert => "INSERT",
            StmtType::Replace => "REPLACE",
            StmtType::Update => "UPDATE",
            StmtType::Delete => "DELETE",
            StmtType::Set => "SET",
            StmtType::Begin => "BEGIN",
            StmtType::Commit => "COMMIT",
            StmtType::Rollback => "ROLLBACK",
            StmtType::Savepoint => "SAVEPOINT",
            StmtType::Use => "USE",
            StmtType::Show => "SHOW",
            StmtType::Explain => "EXPLAIN",
            StmtType::Ddl => "DDL",
            StmtType::Comment => "COMMENT",
            StmtType::Other => "OTHER",
        }
    }
}

/// Classify a statement by its first meaningful keyword
pub fn preview(sql: &str) -> StmtType {
    let trimmed = strip_leading_comments(sql).trim_start();
    if trimmed.is_empty() {
        return StmtType::Comment;
    }

    let word: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();

    match word.as_str() {
        "select" => StmtType::Select,
        "insert" => StmtType::Insert,
        "replace" => StmtType::Replace,
        "update" => StmtType::Update,
        "delete" => StmtType::Delete,
        "set" => StmtType::Set,
        "begin" => StmtType::Begin,
        "start" => {
            if trimmed.to_ascii_lowercase().starts_with("start transaction") {
                StmtType::Begin
            } else {
                StmtType::Other
            }
        }
        "commit" => StmtType::Commit,
        "rollback" => StmtType::Rollback,
        "savepoint" | "release" => StmtType::Savepoint,
        "use" => StmtType::Use,
        "show" | "desc" | "describe" => StmtType::Show,
        "explain" => StmtType::Explain,
        "create" | "alter" | "drop" | "truncate" | "rename" => StmtType::Ddl,
        _ => StmtType::Other,
    }
}

/// Skip leading `/* … */` and `-- …` / `# …` comments
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if rest.starts_with("/*") {
            // version comments like /*!mycat:sql=...*/ are hints, keep them
            if rest.starts_with("/*!") {
                return rest;
            }
            match rest.find("*/") {
                Some(end) => rest = rest[end + 2..].trim_start(),
                None => return "",
            }
        } else if rest.starts_with("--") || rest.starts_with('#') {
            match rest.find('\n') {
                Some(end) => rest = rest[end + 1..].trim_start(),
                None => return "",
            }
        } else {
            return rest;
        }
    }
}

/// Tokenize a statement into word/literal/punctuation tokens.
/// Quoted strings are kept as single tokens with their quotes.
pub fn tokenize(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' || c == '`' {
            let quote = c;
            let start = i;
            i += 1;
            while i < bytes.len() {
                if bytes[i] as char == '\\' {
                    i += 2;
                    continue;
                }
                if bytes[i] as char == quote {
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(sql[start..i.min(sql.len())].to_string());
            continue;
        }

        if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$' || c == '@' {
            let start = i;
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '$' || c == '@' {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(sql[start..i].to_string());
            continue;
        }

        tokens.push(c.to_string());
        i += 1;
    }

    tokens
}

/// Split a multi-statement string on top-level `;` boundaries, honoring
/// quotes and comments. Empty pieces are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let bytes = sql.as_bytes();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] as char {
            '\'' | '"' | '`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            '-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            ';' => {
                let piece = sql[start..i].trim();
                if !piece.is_empty() {
                    pieces.push(piece);
                }
                start = i + 1;
                i += 1;
            }
            _ => i += 1,
        }
    }

    if start < sql.len() {
        let piece = sql[start..].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
    }

    pieces
}

/// Normalize a statement for fingerprinting: literals become `?`,
/// whitespace collapses, keywords fold to lowercase.
pub fn fingerprint(sql: &str) -> String {
    tokenize(sql)
        .iter()
        .map(|token| {
            if token.starts_with('\'') || token.starts_with('"') {
                "?".to_string()
            } else if token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                "?".to_string()
            } else {
                token.to_ascii_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// MD5 digest of a fingerprint, the grouping key for slow/error metrics
pub fn fingerprint_md5(fp: &str) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(fp.as_bytes()))
}

/// MyCat-style routing hint: `/*!mycat:sql=<statement>*/`
pub const MYCAT_HINT_PREFIX: &str = "/*!mycat:";

/// Extract the override statement from a MyCat hint, if present
pub fn extract_mycat_hint(sql: &str) -> Option<String> {
    let start = sql.find(MYCAT_HINT_PREFIX)?;
    let rest = &sql[start + MYCAT_HINT_PREFIX.len()..];
    let rest = rest.strip_prefix("sql=")?;
    let end = rest.find("*/")?;
    let hint = rest[..end].trim();
    if hint.is_empty() {
        None
    } else {
        Some(hint.to_string())
    }
}

/// Full parse via sqlparser; only needed off the hot path
pub fn parse_one(sql: &str) -> Result<Statement, String> {
    let mut statements =
        Parser::parse_sql(&MySqlDialect {}, sql).map_err(|e| e.to_string())?;
    if statements.len() != 1 {
        return Err(format!("expected one statement, got {}", statements.len()));
    }
    Ok(statements.remove(0))
}

/// Variable scope on a SET statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope {
    None,
    Session,
    Global,
}

/// One assignment of a SET statement
#[derive(Debug, Clone)]
pub struct VariableAssignment {
    pub scope: VarScope,
    pub name: String,
    pub value: String,
    /// COLLATE clause of `SET NAMES 'x' COLLATE 'y'`
    pub extend: Option<String>,
}

/// Parse a SET statement into its assignments. `SET NAMES 'x' [COLLATE 'y']`
/// is surfaced as a single assignment named `names`.
pub fn parse_set(sql: &str) -> Result<Vec<VariableAssignment>, String> {
    let tokens = tokenize(sql);
    if tokens.is_empty() || !tokens[0].eq_ignore_ascii_case("set") {
        return Err(format!("not a SET statement: {}", sql));
    }

    let rest = &tokens[1..];
    if rest.is_empty() {
        return Err("empty SET statement".to_string());
    }

    // SET NAMES 'charset' [COLLATE 'collation']
    if rest[0].eq_ignore_ascii_case("names") {
        let charset = rest
            .get(1)
            .map(|t| unquote(t))
            .ok_or_else(|| "SET NAMES requires a charset".to_string())?;
        let extend = if rest.len() >= 4 && rest[2].eq_ignore_ascii_case("collate") {
            Some(unquote(&rest[3]))
        } else {
            None
        };
        return Ok(vec![VariableAssignment {
            scope: VarScope::None,
            name: "names".to_string(),
            value: charset,
            extend,
        }]);
    }

    // SET [SESSION|GLOBAL|@@session.|@@global.] name = value [, ...]
    let mut assignments = Vec::new();
    let mut i = 0usize;
    while i < rest.len() {
        let mut scope = VarScope::None;
        if rest[i].eq_ignore_ascii_case("session") || rest[i].eq_ignore_ascii_case("local") {
            scope = VarScope::Session;
            i += 1;
        } else if rest[i].eq_ignore_ascii_case("global") {
            scope = VarScope::Global;
            i += 1;
        }

        let mut name = rest
            .get(i)
            .ok_or_else(|| "missing variable name".to_string())?
            .to_ascii_lowercase();
        i += 1;

        if let Some(stripped) = name.strip_prefix("@@global.") {
            scope = VarScope::Global;
            name = stripped.to_string();
        } else if let Some(stripped) = name.strip_prefix("@@session.") {
            scope = VarScope::Session;
            name = stripped.to_string();
        } else if let Some(stripped) = name.strip_prefix("@@") {
            name = stripped.to_string();
        }

        if rest.get(i).map(String::as_str) != Some("=") {
            // SET TRANSACTION …, bare keyword form
            return Ok(vec![VariableAssignment {
                scope,
                name,
                value: rest[i..].join(" "),
                extend: None,
            }]);
        }
        i += 1;

        // value runs to the next top-level comma
        let mut value_tokens = Vec::new();
        let mut depth = 0i32;
        while i < rest.len() {
            match rest[i].as_str() {
                "(" => depth += 1,
                ")" => depth -= 1,
                "," if depth == 0 => break,
                _ => {}
            }
            value_tokens.push(rest[i].clone());
            i += 1;
        }
        if rest.get(i).map(String::as_str) == Some(",") {
            i += 1;
        }

        if value_tokens.is_empty() {
            return Err(format!("missing value for variable {}", name));
        }

        let value = if value_tokens.len() == 1 {
            unquote(&value_tokens[0])
        } else {
            value_tokens.join("")
        };

        assignments.push(VariableAssignment {
            scope,
            name,
            value,
            extend: None,
        });
    }

    Ok(assignments)
}

fn unquote(token: &str) -> String {
    let t = token.trim();
    if t.len() >= 2 {
        let first = t.chars().next().unwrap();
        if (first == '\'' || first == '"' || first == '`') && t.ends_with(first) {
            return t[1..t.len() - 1].to_string();
        }
    }
    t.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_classifies_leading_keyword() {
        assert_eq!(preview("SELECT 1"), StmtType::Select);
        assert_eq!(preview("  select * from t"), StmtType::Select);
        assert_eq!(preview("START TRANSACTION"), StmtType::Begin);
        assert_eq!(preview("begin"), StmtType::Begin);
        assert_eq!(preview("SET autocommit=1"), StmtType::Set);
        assert_eq!(preview("use mydb"), StmtType::Use);
        assert_eq!(preview("SHOW DATABASES"), StmtType::Show);
        assert_eq!(preview("SAVEPOINT sp1"), StmtType::Savepoint);
        assert_eq!(preview("/* leading */ UPDATE t SET x=1"), StmtType::Update);
        assert_eq!(preview("-- only a comment"), StmtType::Comment);
        assert_eq!(preview("/* just this */"), StmtType::Comment);
    }

    #[test]
    fn split_honors_quotes_and_comments() {
        let pieces = split_statements("SELECT 1;SELECT 'a;b';-- c;\nSELECT 2;");
        assert_eq!(pieces, vec!["SELECT 1", "SELECT 'a;b'", "SELECT 2"]);

        let pieces = split_statements("SELECT 1");
        assert_eq!(pieces, vec!["SELECT 1"]);
    }

    #[test]
    fn fingerprint_is_whitespace_stable() {
        let a = fingerprint("SELECT *  FROM t\n WHERE id = 5");
        let b = fingerprint("select * from t where id=5");
        assert_eq!(a, b);
        assert!(a.contains('?'));
        assert_eq!(fingerprint_md5(&a), fingerprint_md5(&b));
    }

    #[test]
    fn fingerprint_masks_literals() {
        let fp = fingerprint("SELECT name FROM users WHERE id = 42 AND city = 'nyc'");
        assert!(!fp.contains("42"));
        assert!(!fp.contains("nyc"));
    }

    #[test]
    fn mycat_hint_extraction() {
        let sql = "/*!mycat:sql=SELECT id FROM t_0001*/ SELECT id FROM t";
        assert_eq!(
            extract_mycat_hint(sql).as_deref(),
            Some("SELECT id FROM t_0001")
        );
        assert!(extract_mycat_hint("SELECT 1").is_none());
    }

    #[test]
    fn parse_set_single_assignment() {
        let vars = parse_set("SET autocommit = 1").unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "autocommit");
        assert_eq!(vars[0].value, "1");
        assert_eq!(vars[0].scope, VarScope::None);
    }

    #[test]
    fn parse_set_global_scope() {
        let vars = parse_set("SET GLOBAL max_connections = 100").unwrap();
        assert_eq!(vars[0].scope, VarScope::Global);

        let vars = parse_set("SET @@global.sql_mode = ''").unwrap();
        assert_eq!(vars[0].scope, VarScope::Global);
        assert_eq!(vars[0].name, "sql_mode");
    }

    #[test]
    fn parse_set_names_with_collate() {
        let vars = parse_set("SET NAMES 'utf8mb4' COLLATE 'utf8mb4_general_ci'").unwrap();
        assert_eq!(vars[0].name, "names");
        assert_eq!(vars[0].value, "utf8mb4");
        assert_eq!(vars[0].extend.as_deref(), Some("utf8mb4_general_ci"));
    }

    #[test]
    fn parse_set_multiple_assignments() {
        let vars = parse_set("SET sql_mode='STRICT_TRANS_TABLES', time_zone='+08:00'").unwrap();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].name, "sql_mode");
        assert_eq!(vars[1].name, "time_zone");
        assert_eq!(vars[1].value, "+08:00");
    }

    #[test]
    fn parse_one_accepts_query() {
        let stmt = parse_one("SELECT 1").unwrap();
        assert!(matches!(stmt, Statement::Query(_)));
    }
}
