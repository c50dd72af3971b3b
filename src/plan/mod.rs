//! Execution plans. The session engine only distinguishes statements it can
//! forward to a single slice (the unshard path) from statements it ignores;
//! multi-fragment sharded planning sits behind `build_plan` and currently
//! resolves to the slice named by the table's routing rule.

use tracing::debug;

use crate::namespace::Namespace;
use crate::parser::StmtType;
use crate::protocol::{error_codes, SqlError};

/// A statement bound to the slice that will execute it
#[derive(Debug, Clone)]
pub struct UnshardPlan {
    pub sql: String,
    pub slice: String,
    /// Physical database to select before execution, when the logical db
    /// maps to a different physical name
    pub phy_db: Option<String>,
}

/// Opaque execution unit produced by plan building
#[derive(Debug, Clone)]
pub enum Plan {
    Unshard(UnshardPlan),
    /// Comment-only statements parse to nothing and execute as a no-op
    Ignore,
}

impl Plan {
    /// Run the plan inside a session executor
    pub async fn execute_in(
        &self,
        req_ctx: &mut crate::util::RequestContext,
        executor: &mut crate::session::SessionExecutor,
    ) -> Result<Option<crate::protocol::ResultSet>, crate::session::ExecError> {
        match self {
            Plan::Ignore => Ok(None),
            Plan::Unshard(plan) => executor.execute_unshard(req_ctx, plan).await,
        }
    }
}

/// Keywords that introduce a table reference
fn introduces_table(token: &str) -> bool {
    token.eq_ignore_ascii_case("from")
        || token.eq_ignore_ascii_case("into")
        || token.eq_ignore_ascii_case("update")
        || token.eq_ignore_ascii_case("join")
        || token.eq_ignore_ascii_case("table")
}

/// Extract `(db, table)` references from a token stream. The db part is
/// None when the statement relies on the session database.
pub fn referenced_tables(tokens: &[String]) -> Vec<(Option<String>, String)> {
    let mut tables = Vec::new();
    let mut expect_table = false;

    for token in tokens {
        if expect_table {
            expect_table = false;
            if token.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '`' || c == '_')
            {
                let cleaned = token.trim_matches('`');
                match cleaned.split_once('.') {
                    Some((db, table)) => {
                        tables.push((Some(db.to_lowercase()), table.to_lowercase()))
                    }
                    None => tables.push((None, cleaned.to_lowercase())),
                }
                continue;
            }
        }
        if introduces_table(token) {
            expect_table = true;
        }
    }

    tables
}

/// Whether every table referenced by the token stream routes to the
/// default slice (no sharding rule applies).
pub fn is_unshard(ns: &Namespace, db: &str, tokens: &[String]) -> bool {
    if !ns.router().has_rules() && !ns.gray_router().has_rules() {
        return true;
    }
    referenced_tables(tokens).iter().all(|(table_db, table)| {
        let rule_db = table_db.as_deref().unwrap_or(db);
        !ns.router().is_sharded(rule_db, table) && !ns.gray_router().is_sharded(rule_db, table)
    })
}

/// Build a plan for a statement. The hint plan, when present, overrides the
/// routing decision while the original statement text is executed.
pub fn build_plan(
    ns: &Namespace,
    db: &str,
    sql: &str,
    stmt_type: StmtType,
    tokens: &[String],
    hint_plan: Option<Plan>,
) -> Result<Plan, SqlError> {
    if stmt_type == StmtType::Comment {
        return Ok(Plan::Ignore);
    }

    if let Some(Plan::Unshard(hint)) = hint_plan {
        debug!(slice = %hint.slice, "routing overridden by hint plan");
        return Ok(Plan::Unshard(UnshardPlan {
            sql: sql.to_string(),
            slice: hint.slice,
            phy_db: hint.phy_db,
        }));
    }

    let phy_db = ns.default_phy_db(db).map(str::to_string);

    // pick the slice from the first sharded table's rule; everything else
    // stays on the default slice
    for (table_db, table) in referenced_tables(tokens) {
        let rule_db = table_db.as_deref().unwrap_or(db);
        if ns.router().is_sharded(rule_db, table.as_str()) {
            let rule = ns.router().get_rule(rule_db, &table);
            return Ok(Plan::Unshard(UnshardPlan {
                sql: sql.to_string(),
                slice: rule.slice(0).to_string(),
                phy_db,
            }));
        }
    }

    if !db.is_empty() && !ns.is_allowed_db(db) {
        return Err(SqlError::new(
            error_codes::ER_BAD_DB_ERROR,
            &format!("Unknown database '{}'", db),
        ));
    }

    Ok(Plan::Unshard(UnshardPlan {
        sql: sql.to_string(),
        slice: ns.router().default_slice().to_string(),
        phy_db,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceConfig;
    use crate::parser::tokenize;

    fn sharded_ns() -> Namespace {
        let config: NamespaceConfig = toml::from_str(
            r#"
            name = "ns1"
            default_slice = "slice-0"
            allowed_dbs = ["orders"]

            [[shard_rules]]
            db = "orders"
            table = "t_order"
            shard_column = "order_id"
            slices = ["slice-1"]
            "#,
        )
        .unwrap();
        Namespace::from_config(&config, 1).unwrap()
    }

    #[test]
    fn extracts_table_references() {
        let tokens = tokenize("SELECT a FROM t1 JOIN db2.t2 ON t1.id = t2.id");
        let tables = referenced_tables(&tokens);
        assert_eq!(tables[0], (None, "t1".to_string()));
        assert_eq!(tables[1], (Some("db2".to_string()), "t2".to_string()));
    }

    #[test]
    fn unshard_check_consults_rules() {
        let ns = sharded_ns();
        assert!(is_unshard(&ns, "orders", &tokenize("SELECT 1 FROM t_user")));
        assert!(!is_unshard(&ns, "orders", &tokenize("SELECT 1 FROM t_order")));
    }

    #[test]
    fn sharded_table_routes_to_rule_slice() {
        let ns = sharded_ns();
        let tokens = tokenize("SELECT * FROM t_order WHERE order_id = 5");
        let plan = build_plan(&ns, "orders", "SELECT * FROM t_order WHERE order_id = 5",
            StmtType::Select, &tokens, None).unwrap();
        match plan {
            Plan::Unshard(p) => assert_eq!(p.slice, "slice-1"),
            _ => panic!("expected unshard plan"),
        }
    }

    #[test]
    fn default_slice_for_plain_tables() {
        let ns = sharded_ns();
        let tokens = tokenize("SELECT * FROM t_user");
        let plan = build_plan(&ns, "orders", "SELECT * FROM t_user", StmtType::Select, &tokens, None)
            .unwrap();
        match plan {
            Plan::Unshard(p) => assert_eq!(p.slice, "slice-0"),
            _ => panic!("expected unshard plan"),
        }
    }

    #[test]
    fn unknown_db_is_rejected() {
        let ns = sharded_ns();
        let tokens = tokenize("SELECT * FROM t_user");
        let err = build_plan(&ns, "wrong_db", "SELECT * FROM t_user", StmtType::Select, &tokens, None)
            .unwrap_err();
        assert_eq!(err.code, error_codes::ER_BAD_DB_ERROR);
    }

    #[test]
    fn comment_only_builds_ignore_plan() {
        let ns = sharded_ns();
        let plan = build_plan(&ns, "orders", "/* hint */", StmtType::Comment, &[], None).unwrap();
        assert!(matches!(plan, Plan::Ignore));
    }
}
