//! Per-connection command execution: transaction and keep-session backend
//! connection maps, session variables, prepared statements, the SET matrix
//! and the query pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::backend::{ConnectionBroker, PooledConn, Role};
use crate::metrics::audit::{self, AuditContext};
use crate::namespace::{Manager, Namespace};
use crate::parser::{self, StmtType, VarScope, VariableAssignment};
use crate::plan::{self, Plan, UnshardPlan};
use crate::protocol::packet::{
    charset_default_collation, collation_charset, collation_id, status::*,
};
use crate::protocol::resultset::Field;
use crate::protocol::{error_codes, ResultSet, SqlError};
use crate::util::RequestContext;

use super::error::ExecError;
use super::stmt::{self, Stmt};
use super::variables::SessionVariables;

const GET_CONN_TIMEOUT: Duration = Duration::from_secs(2);

/// Proxy-internal session variable toggling the SQL audit log
const GENERAL_LOG_VARIABLE: &str = "minerva_general_log";

/// Where a checked-out backend connection must be returned to
#[derive(Debug)]
enum ConnSource {
    Pool,
    Tx(String),
    Ks(String),
}

/// A backend connection with a live row cursor, handed to the response
/// writer and returned through `recycle_continue` on every exit path.
pub struct ContinueConn {
    pub conn: PooledConn,
    source: ConnSource,
}

pub struct SessionExecutor {
    manager: Arc<Manager>,
    pub namespace: String,
    pub user: String,
    pub db: String,
    pub charset: String,
    pub collation_id: u16,
    /// AUTOCOMMIT / IN_TRANS / MORE_RESULTS bits mirrored to the client
    pub status: u16,
    pub client_addr: String,
    pub conn_id: u32,
    client_capability: u32,
    session_variables: SessionVariables,
    stmts: HashMap<u32, Stmt>,
    stmt_id: u32,
    /// Connections pinned by an open transaction, by slice
    tx_conns: HashMap<String, PooledConn>,
    /// Connections pinned by keep-session mode, by slice
    ks_conns: HashMap<String, PooledConn>,
    pub backend_connection_id: u32,
    pub backend_addr: String,
    /// Namespace epoch observed before the current request
    pub ns_change_index_old: u64,
    continue_conn: Option<ContinueConn>,
}

impl SessionExecutor {
    pub fn new(manager: Arc<Manager>, conn_id: u32, client_addr: &str) -> Self {
        Self {
            manager,
            namespace: String::new(),
            user: String::new(),
            db: String::new(),
            charset: "utf8mb4".to_string(),
            collation_id: crate::protocol::packet::DEFAULT_COLLATION_ID,
            status: SERVER_STATUS_AUTOCOMMIT,
            client_addr: client_addr.to_string(),
            conn_id,
            client_capability: 0,
            session_variables: SessionVariables::new(),
            stmts: HashMap::new(),
            stmt_id: 0,
            tx_conns: HashMap::new(),
            ks_conns: HashMap::new(),
            backend_connection_id: 0,
            backend_addr: String::new(),
            ns_change_index_old: 0,
            continue_conn: None,
        }
    }

    pub fn set_client_capability(&mut self, capability: u32) {
        self.client_capability = capability;
    }

    pub fn client_capability(&self) -> u32 {
        self.client_capability
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn get_namespace(&self) -> Result<Arc<Namespace>, ExecError> {
        self.manager.get_namespace(&self.namespace).ok_or_else(|| {
            ExecError::CloseWithResp(SqlError::new(
                error_codes::ER_UNKNOWN_ERROR,
                &format!("namespace {} not found", self.namespace),
            ))
        })
    }

    pub fn is_autocommit(&self) -> bool {
        self.status & SERVER_STATUS_AUTOCOMMIT != 0
    }

    pub fn is_in_transaction(&self) -> bool {
        self.status & SERVER_STATUS_IN_TRANS != 0 || !self.is_autocommit()
    }

    pub fn is_keep_session(&self) -> bool {
        self.manager
            .get_namespace(&self.namespace)
            .map(|ns| ns.is_keep_session())
            .unwrap_or(false)
    }

    pub fn has_ks_conns(&self) -> bool {
        !self.ks_conns.is_empty()
    }

    pub fn audit_ctx(&self) -> AuditContext {
        AuditContext {
            ns: self.namespace.clone(),
            user: self.user.clone(),
            client_addr: self.client_addr.clone(),
            backend_addr: self.backend_addr.clone(),
            db: self.db.clone(),
            conn_id: self.conn_id,
            backend_conn_id: self.backend_connection_id,
            in_tx: self.is_in_transaction(),
        }
    }

    pub fn take_continue_conn(&mut self) -> Option<ContinueConn> {
        self.continue_conn.take()
    }

    /// Return a streamed cursor's connection after the writer is done
    pub async fn recycle_continue(&mut self, cont: Option<ContinueConn>) {
        if let Some(cont) = cont {
            self.return_conn(cont.source, cont.conn).await;
        }
    }

    /// QPS gate. A drained bucket inside a transaction is unrecoverable,
    /// so the limiter error escalates to session close.
    pub fn check_qps(&self, ns: &Namespace) -> Result<(), ExecError> {
        if ns.client_qps_limit() == 0 {
            return Ok(());
        }
        if ns.support_limit_tx() {
            if !ns.try_acquire_qps() {
                return if self.is_in_transaction() {
                    Err(ExecError::CloseWithResp(SqlError::client_qps_limited()))
                } else {
                    Err(ExecError::Sql(SqlError::client_qps_limited()))
                };
            }
        } else if !self.is_in_transaction() && !ns.try_acquire_qps() {
            return Err(ExecError::Sql(SqlError::client_qps_limited()));
        }
        Ok(())
    }

    /// Full single-statement pipeline with metrics and audit recording
    pub async fn handle_query(&mut self, sql: &str) -> Result<Option<ResultSet>, ExecError> {
        let sql = sql.trim_end_matches(';').trim();
        let mut req_ctx = RequestContext::new();
        let start_time = Instant::now();

        let mut result = self.do_query(&mut req_ctx, sql).await;
        if let Ok(Some(result)) = result.as_mut() {
            result.status |= self.status;
        }

        let audit_ctx = self.audit_ctx();
        let err = result.as_ref().err().and_then(|e| e.sql_error()).cloned();
        self.manager.record_session_sql_metrics(
            &mut req_ctx,
            &audit_ctx,
            sql,
            start_time,
            err.as_ref(),
        );

        result
    }

    async fn do_query(
        &mut self,
        req_ctx: &mut RequestContext,
        sql: &str,
    ) -> Result<Option<ResultSet>, ExecError> {
        self.check_sql_allowed(req_ctx, sql)?;

        let stmt_type = req_ctx.stmt_type().unwrap_or(StmtType::Other);
        if stmt_type.handled_without_plan() {
            return self.handle_query_without_plan(req_ctx, sql).await;
        }

        let ns = self.get_namespace()?;
        req_ctx.default_slice = ns.default_slice().to_string();
        req_ctx.from_slave = stmt_type == StmtType::Select
            && !self.is_in_transaction()
            && ns.is_rw_split(&self.user);

        let plan = self.get_plan(req_ctx, &ns, sql, true)?;
        plan.execute_in(req_ctx, self).await
    }

    /// Read-only-user policy plus the namespace blacklist
    fn check_sql_allowed(&mut self, req_ctx: &mut RequestContext, sql: &str) -> Result<(), ExecError> {
        let stmt_type = parser::preview(sql);
        req_ctx.stmt_type = Some(stmt_type);

        let ns = self.get_namespace()?;
        if stmt_type.is_dml() && ns.is_read_only_user(&self.user) {
            return Err(ExecError::internal("write DML is not allowed by read user"));
        }

        let fingerprint = req_ctx.fingerprint(sql).to_string();
        if !ns.is_sql_allowed(&fingerprint) {
            warn!(namespace = %self.namespace, sql, "statement matches blacklist");
            self.manager.record_sql_forbidden(&self.namespace, &fingerprint);
            return Err(ExecError::sql(error_codes::ER_UNKNOWN_ERROR, "sql in blacklist"));
        }
        Ok(())
    }

    async fn handle_query_without_plan(
        &mut self,
        req_ctx: &mut RequestContext,
        sql: &str,
    ) -> Result<Option<ResultSet>, ExecError> {
        let tokens = parser::tokenize(sql);
        if tokens.is_empty() {
            return Ok(None);
        }
        req_ctx.tokens = tokens.clone();

        match req_ctx.stmt_type().unwrap_or(StmtType::Other) {
            StmtType::Show => self.handle_show(req_ctx, sql).await,
            StmtType::Set => self.handle_set(sql).await.map(|_| None),
            StmtType::Begin => {
                self.handle_begin();
                Ok(None)
            }
            StmtType::Commit => self.handle_commit().await.map(|_| None),
            StmtType::Rollback => self.handle_rollback().await.map(|_| None),
            StmtType::Savepoint => self.handle_savepoint(sql).await.map(|_| None),
            StmtType::Use => {
                let db = tokens
                    .get(1)
                    .map(|t| t.trim_matches('`').to_string())
                    .unwrap_or_default();
                self.handle_use_db(&db)?;
                Ok(None)
            }
            StmtType::Comment => Ok(None),
            _ => Err(ExecError::internal(&format!(
                "cannot handle sql without plan, ns: {}, sql: {}",
                self.namespace, sql
            ))),
        }
    }

    /// SHOW goes straight to the default slice; parsing it would trip over
    /// mode-dependent syntax the proxy has no stake in.
    async fn handle_show(
        &mut self,
        req_ctx: &mut RequestContext,
        sql: &str,
    ) -> Result<Option<ResultSet>, ExecError> {
        let ns = self.get_namespace()?;
        let plan = UnshardPlan {
            sql: sql.to_string(),
            slice: ns.default_slice().to_string(),
            phy_db: ns.default_phy_db(&self.db).map(str::to_string),
        };
        req_ctx.from_slave = ns.is_rw_split(&self.user) && !self.is_in_transaction();
        self.execute_unshard(req_ctx, &plan).await
    }

    /// Fast unshard path, MyCat hint resolution, then plan building
    fn get_plan(
        &mut self,
        req_ctx: &mut RequestContext,
        ns: &Arc<Namespace>,
        sql: &str,
        check_hint: bool,
    ) -> Result<Plan, ExecError> {
        let tokens = parser::tokenize(sql);
        req_ctx.tokens = tokens.clone();
        let stmt_type = req_ctx.stmt_type().unwrap_or(StmtType::Other);

        if stmt_type != StmtType::Comment && plan::is_unshard(ns, &self.db, &tokens) {
            if !self.db.is_empty() && !ns.is_allowed_db(&self.db) {
                return Err(ExecError::Sql(SqlError::new(
                    error_codes::ER_BAD_DB_ERROR,
                    &format!("Unknown database '{}'", self.db),
                )));
            }
            return Ok(Plan::Unshard(UnshardPlan {
                sql: sql.to_string(),
                slice: ns.router().default_slice().to_string(),
                phy_db: ns.default_phy_db(&self.db).map(str::to_string),
            }));
        }

        let mut hint_plan = None;
        if check_hint {
            if let Some(hint_sql) = parser::extract_mycat_hint(sql) {
                match self.get_plan(&mut RequestContext::new(), ns, &hint_sql, false) {
                    Ok(plan) => hint_plan = Some(plan),
                    Err(e) => {
                        // hint failures only change routing, never fail the query
                        warn!(namespace = %self.namespace, error = %e, "mycat hint plan failed");
                    }
                }
            }
        }

        plan::build_plan(ns, &self.db, sql, stmt_type, &tokens, hint_plan).map_err(ExecError::Sql)
    }

    /// Execute a single-slice plan, streaming row cursors to the writer
    pub async fn execute_unshard(
        &mut self,
        req_ctx: &mut RequestContext,
        plan: &UnshardPlan,
    ) -> Result<Option<ResultSet>, ExecError> {
        let ns = self.get_namespace()?;
        let role = if req_ctx.from_slave {
            Role::Slave
        } else {
            Role::Master
        };

        let (mut conn, source) = self.get_backend_conn(&ns, &plan.slice, role).await?;
        self.backend_connection_id = conn.id();
        self.backend_addr = conn.addr().to_string();

        let start_time = Instant::now();
        let exec_result = self.init_and_execute(&ns, &mut conn, plan).await;

        let audit_ctx = self.audit_ctx();
        let err = exec_result.as_ref().err().and_then(|e: &ExecError| e.sql_error()).cloned();
        let backend_addr = conn.addr().to_string();
        self.manager
            .record_backend_sql_metrics(
                req_ctx,
                &audit_ctx,
                &plan.slice,
                &plan.sql,
                &backend_addr,
                start_time,
                err.as_ref(),
            )
            .await;

        match exec_result {
            Ok(result) => {
                if result.has_rows() {
                    // cursor stays open; the writer drains it and hands the
                    // connection back afterwards
                    self.continue_conn = Some(ContinueConn { conn, source });
                } else {
                    self.return_conn(source, conn).await;
                }
                Ok(Some(result))
            }
            Err(e) => {
                // transport failures already marked the conn closed; a clean
                // backend ERR leaves it reusable at a packet boundary
                self.return_conn(source, conn).await;
                Err(e)
            }
        }
    }

    async fn init_and_execute(
        &mut self,
        ns: &Arc<Namespace>,
        conn: &mut PooledConn,
        plan: &UnshardPlan,
    ) -> Result<ResultSet, ExecError> {
        let db = plan
            .phy_db
            .clone()
            .or_else(|| (!self.db.is_empty()).then(|| self.db.clone()));
        if let Some(db) = db {
            conn.use_db(&db).await?;
        }

        if self.charset != ns.default_charset() || !self.session_variables.is_empty() {
            conn.sync_session(&self.charset, &self.session_variables.entries())
                .await?;
        }

        let result = conn.execute_stream(&plan.sql).await?;
        Ok(result)
    }

    /// Resolve the backend connection for a slice, honoring the transaction
    /// and keep-session pinning rules.
    async fn get_backend_conn(
        &mut self,
        ns: &Arc<Namespace>,
        slice: &str,
        role: Role,
    ) -> Result<(PooledConn, ConnSource), ExecError> {
        if self.is_in_transaction() {
            if let Some(conn) = self.tx_conns.remove(slice) {
                return Ok((conn, ConnSource::Tx(slice.to_string())));
            }
            // a keep-session conn joins the transaction rather than
            // coexisting with a second conn on the same slice
            let mut conn = match self.ks_conns.remove(slice) {
                Some(conn) => conn,
                None => ns.acquire(slice, Role::Master).await?,
            };
            let begin = if self.is_autocommit() {
                conn.begin().await
            } else {
                conn.set_autocommit(false).await
            };
            if let Err(e) = begin {
                conn.close();
                conn.recycle().await;
                return Err(e.into());
            }
            return Ok((conn, ConnSource::Tx(slice.to_string())));
        }

        if ns.is_keep_session() {
            if let Some(conn) = self.ks_conns.remove(slice) {
                return Ok((conn, ConnSource::Ks(slice.to_string())));
            }
            let conn = ns.acquire(slice, role).await?;
            return Ok((conn, ConnSource::Ks(slice.to_string())));
        }

        let conn = ns.acquire(slice, role).await?;
        Ok((conn, ConnSource::Pool))
    }

    async fn return_conn(&mut self, source: ConnSource, conn: PooledConn) {
        match source {
            ConnSource::Tx(slice) => {
                if conn.is_closed() {
                    conn.recycle().await;
                } else {
                    self.tx_conns.insert(slice, conn);
                }
            }
            ConnSource::Ks(slice) => {
                if conn.is_closed() {
                    conn.recycle().await;
                } else {
                    self.ks_conns.insert(slice, conn);
                }
            }
            ConnSource::Pool => conn.recycle().await,
        }
    }

    pub fn handle_begin(&mut self) {
        self.status |= SERVER_STATUS_IN_TRANS;
    }

    pub async fn handle_commit(&mut self) -> Result<(), ExecError> {
        self.finish_transaction(true).await
    }

    pub async fn handle_rollback(&mut self) -> Result<(), ExecError> {
        self.finish_transaction(false).await
    }

    /// Issue COMMIT/ROLLBACK on every transaction connection, then release
    /// them (back to the keep-session map when that mode is on).
    async fn finish_transaction(&mut self, commit: bool) -> Result<(), ExecError> {
        let keep_session = self.is_keep_session();
        let conns = std::mem::take(&mut self.tx_conns);
        let autocommit = self.is_autocommit();
        let mut first_err: Option<ExecError> = None;

        for (slice, mut conn) in conns {
            let outcome = if commit {
                conn.commit().await
            } else {
                conn.rollback().await
            };
            if let Err(e) = outcome {
                conn.close();
                if first_err.is_none() {
                    first_err = Some(e.into());
                }
            }
            if !autocommit && !conn.is_closed() {
                // pooled connections must not retain autocommit=0
                if let Err(e) = conn.set_autocommit(true).await {
                    conn.close();
                    if first_err.is_none() {
                        first_err = Some(e.into());
                    }
                }
            }
            if keep_session && !conn.is_closed() {
                self.ks_conns.insert(slice, conn);
            } else {
                conn.recycle().await;
            }
        }

        self.status &= !SERVER_STATUS_IN_TRANS;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn handle_savepoint(&mut self, sql: &str) -> Result<(), ExecError> {
        if !self.is_in_transaction() || self.tx_conns.is_empty() {
            return Ok(());
        }
        for conn in self.tx_conns.values_mut() {
            conn.execute(sql).await?;
        }
        Ok(())
    }

    pub fn handle_use_db(&mut self, db: &str) -> Result<(), ExecError> {
        if db.is_empty() {
            return Err(ExecError::internal("must have database, the length of dbName is zero"));
        }
        let ns = self.get_namespace()?;
        if !ns.is_allowed_db(db) {
            return Err(ExecError::Sql(SqlError::new(
                error_codes::ER_NO_DB_ERROR,
                &format!("db {} not allowed", db),
            )));
        }
        self.db = db.to_string();
        Ok(())
    }

    // --- SET handling ------------------------------------------------------

    pub async fn handle_set(&mut self, sql: &str) -> Result<(), ExecError> {
        let assignments = parser::parse_set(sql)
            .map_err(|e| ExecError::internal(&format!("parse sql error, sql: {}, err: {}", sql, e)))?;
        for assignment in assignments {
            self.handle_set_variable(sql, &assignment).await?;
        }
        Ok(())
    }

    async fn handle_set_variable(
        &mut self,
        sql: &str,
        v: &VariableAssignment,
    ) -> Result<(), ExecError> {
        if v.scope == VarScope::Global {
            return Err(ExecError::internal("does not support set variable in global scope"));
        }
        let ns = self.get_namespace()?;
        let name = v.name.as_str();
        let value = v.value.to_lowercase();

        match name {
            "character_set_results" | "character_set_client" | "character_set_connection" => {
                if value == "null" {
                    return Ok(());
                }
                if value == "default" {
                    self.charset = ns.default_charset().to_string();
                    self.collation_id = ns.default_collation_id();
                    return Ok(());
                }
                self.session_variables.set_string(name, &v.value);
                Ok(())
            }
            "group_concat_max_len" => self.set_int_variable(name, &value),
            "autocommit" => match value.as_str() {
                "default" | "on" | "1" => self.handle_set_autocommit(true).await,
                "off" | "0" => self.handle_set_autocommit(false).await,
                _ => Err(wrong_value(name, &value)),
            },
            "names" => {
                let charset = if value == "default" {
                    ns.default_charset().to_string()
                } else {
                    value.clone()
                };
                let collation = match &v.extend {
                    Some(collation_name) => {
                        let id = collation_id(collation_name)
                            .ok_or_else(|| unknown_charset(&charset))?;
                        let collation_charset = collation_charset(collation_name)
                            .ok_or_else(|| unknown_charset(&charset))?;
                        if collation_charset != charset {
                            return Err(unknown_charset(&charset));
                        }
                        id
                    }
                    None => charset_default_collation(&charset)
                        .ok_or_else(|| unknown_charset(&charset))?,
                };
                self.charset = charset;
                self.collation_id = collation;
                Ok(())
            }
            "sql_mode" => {
                self.session_variables.set_string(name, &v.value);
                Ok(())
            }
            "sql_safe_updates" => {
                let on_off = on_off_value(&value).ok_or_else(|| wrong_value(name, &value))?;
                self.session_variables.set_int(name, on_off);
                Ok(())
            }
            "time_zone" => {
                self.session_variables.set_string(name, &v.value);
                Ok(())
            }
            "max_allowed_packet" => Err(ExecError::Sql(SqlError::new(
                error_codes::ER_VARIABLE_IS_READONLY,
                "SESSION variable 'max_allowed_packet' is read-only. Use SET GLOBAL to assign the value",
            ))),
            "wait_timeout" | "interactive_timeout" | "net_write_timeout" | "net_read_timeout" => {
                Ok(())
            }
            "sql_select_limit" => self.set_int_variable(name, &value),
            "transaction" => Err(ExecError::internal("does not support set transaction")),
            "tx_read_only" | "transaction_read_only" => {
                let on_off = on_off_value(&value).ok_or_else(|| wrong_value(name, &value))?;
                // 8.0.3 dropped tx_read_only; rewrite so replay still works
                let effective = if name == "tx_read_only" && self.backend_is_at_least_803() {
                    "transaction_read_only"
                } else {
                    name
                };
                self.session_variables.set_int(effective, on_off);
                Ok(())
            }
            GENERAL_LOG_VARIABLE => {
                let on_off = on_off_value(&value).ok_or_else(|| wrong_value(name, &value))?;
                audit::set_general_log(on_off == 1);
                Ok(())
            }
            _ => {
                if let Some(variable_type) = ns.allowed_session_variables().get(name) {
                    match variable_type.as_str() {
                        "int" => return self.set_int_variable(name, &value),
                        "string" => {
                            self.session_variables.set_string(name, &v.value);
                            return Ok(());
                        }
                        "bool" => {
                            let on_off =
                                on_off_value(&value).ok_or_else(|| wrong_value(name, &value))?;
                            self.session_variables.set_int(name, on_off);
                            return Ok(());
                        }
                        other => {
                            warn!(variable = name, variable_type = other, "unsupported session variable type");
                        }
                    }
                }
                // unknown variables are ignored, with an audit trace so the
                // client's expectation mismatch is discoverable
                audit::log_ignore(
                    &self.audit_ctx(),
                    sql,
                    &format!("variable({}) not supported", name),
                );
                Ok(())
            }
        }
    }

    fn set_int_variable(&mut self, name: &str, value: &str) -> Result<(), ExecError> {
        let parsed: i64 = value.parse().map_err(|_| wrong_value(name, value))?;
        self.session_variables.set_int(name, parsed);
        Ok(())
    }

    fn backend_is_at_least_803(&self) -> bool {
        self.tx_conns
            .values()
            .chain(self.ks_conns.values())
            .next()
            .map(|c| c.supports_transaction_read_only())
            // modern fleets default to 8.x
            .unwrap_or(true)
    }

    /// `SET autocommit = 1` implicitly commits: every transaction
    /// connection is restored and recycled and IN_TRANS drops.
    pub async fn handle_set_autocommit(&mut self, autocommit: bool) -> Result<(), ExecError> {
        if autocommit {
            self.status |= SERVER_STATUS_AUTOCOMMIT;
            self.status &= !SERVER_STATUS_IN_TRANS;
            let mut first_err: Option<ExecError> = None;
            for (_, mut conn) in std::mem::take(&mut self.tx_conns) {
                if let Err(e) = conn.set_autocommit(true).await {
                    conn.close();
                    if first_err.is_none() {
                        first_err = Some(e.into());
                    }
                }
                conn.recycle().await;
            }
            return match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        self.status &= !SERVER_STATUS_AUTOCOMMIT;
        Ok(())
    }

    pub fn session_variables(&self) -> &SessionVariables {
        &self.session_variables
    }

    // --- prepared statements ----------------------------------------------

    pub fn handle_stmt_prepare(&mut self, sql: &str) -> Result<(u32, u16), ExecError> {
        debug!(namespace = %self.namespace, sql, "prepare");
        let sql = sql.trim_end_matches(';');
        self.stmt_id += 1;
        let stmt = Stmt::prepare(self.stmt_id, sql)?;
        let id = stmt.id;
        let param_count = stmt.param_count as u16;
        self.stmts.insert(id, stmt);
        Ok((id, param_count))
    }

    pub async fn handle_stmt_execute(
        &mut self,
        data: &Bytes,
    ) -> Result<Option<ResultSet>, ExecError> {
        if data.len() < 4 {
            return Err(ExecError::sql(
                error_codes::ER_MALFORMED_PACKET,
                "malformed execute packet",
            ));
        }
        let stmt_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let mut stmt = self.stmts.remove(&stmt_id).ok_or_else(|| {
            ExecError::sql(
                error_codes::ER_UNKNOWN_STMT_HANDLER,
                &format!("unknown prepared statement handler ({})", stmt_id),
            )
        })?;

        let result = match stmt::parse_execute(&mut stmt, data) {
            Ok(request) => match stmt.rewrite(&request.values) {
                Ok(sql) => self.handle_query(&sql).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        self.stmts.insert(stmt_id, stmt);
        result
    }

    pub fn handle_stmt_close(&mut self, data: &Bytes) {
        if data.len() >= 4 {
            let stmt_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            self.stmts.remove(&stmt_id);
        }
    }

    pub fn handle_stmt_reset(&mut self, data: &Bytes) -> Result<(), ExecError> {
        if data.len() < 4 {
            return Err(ExecError::sql(
                error_codes::ER_MALFORMED_PACKET,
                "malformed reset packet",
            ));
        }
        let stmt_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        match self.stmts.get_mut(&stmt_id) {
            Some(stmt) => {
                stmt.reset();
                Ok(())
            }
            None => Err(ExecError::sql(
                error_codes::ER_UNKNOWN_STMT_HANDLER,
                &format!("unknown prepared statement handler ({})", stmt_id),
            )),
        }
    }

    /// COM_STMT_SEND_LONG_DATA never gets a response, even on error
    pub fn handle_stmt_send_long_data(&mut self, data: &Bytes) {
        if data.len() < 6 {
            return;
        }
        let stmt_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let param_id = u16::from_le_bytes([data[4], data[5]]);
        if let Some(stmt) = self.stmts.get_mut(&stmt_id) {
            stmt.append_long_data(param_id, &data[6..]);
        }
    }

    pub fn stmt_count(&self) -> usize {
        self.stmts.len()
    }

    // --- field list & ping -------------------------------------------------

    pub async fn handle_field_list(&mut self, data: &Bytes) -> Result<Vec<Field>, ExecError> {
        let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let table = String::from_utf8_lossy(&data[..null_pos]).to_string();
        let wildcard = if null_pos + 1 < data.len() {
            String::from_utf8_lossy(&data[null_pos + 1..]).to_string()
        } else {
            String::new()
        };

        let ns = self.get_namespace()?;
        let slice = ns.router().get_rule(&self.db, &table).slice(0).to_string();
        let role = if ns.is_rw_split(&self.user) {
            Role::Slave
        } else {
            Role::Master
        };

        let (mut conn, source) = self.get_backend_conn(&ns, &slice, role).await?;
        let db = ns
            .default_phy_db(&self.db)
            .map(str::to_string)
            .or_else(|| (!self.db.is_empty()).then(|| self.db.clone()));
        let result = async {
            if let Some(db) = db {
                conn.use_db(&db).await?;
            }
            conn.field_list(&table, &wildcard).await
        }
        .await;

        if result.is_err() {
            conn.close();
        }
        self.return_conn(source, conn).await;
        result.map_err(Into::into)
    }

    /// Opportunistic keep-session health check on COM_PING
    pub async fn handle_ks_ping(&mut self) -> Result<(), ExecError> {
        let mut failed = false;
        for conn in self.ks_conns.values_mut() {
            if conn.ping_with_timeout(GET_CONN_TIMEOUT).await.is_err() {
                conn.close();
                failed = true;
                break;
            }
        }

        if failed {
            let in_tx = self.is_in_transaction();
            for (_, mut conn) in std::mem::take(&mut self.ks_conns) {
                if in_tx {
                    conn.close();
                }
                conn.recycle().await;
            }
            return Err(ExecError::internal("backend connection was bad"));
        }
        Ok(())
    }

    // --- lifecycle ---------------------------------------------------------

    /// Drop keep-session pins after a namespace swap outside a transaction
    pub async fn clear_ks_conns(&mut self) {
        for (_, mut conn) in std::mem::take(&mut self.ks_conns) {
            conn.close();
            conn.recycle().await;
        }
    }

    /// Release keep-session conns on QUIT or close
    pub async fn handle_ks_quit(&mut self) {
        let in_tx = self.is_in_transaction();
        for (_, mut conn) in std::mem::take(&mut self.ks_conns) {
            if in_tx {
                conn.close();
            }
            conn.recycle().await;
        }
    }

    /// Roll back any open transaction; used on session teardown
    pub async fn rollback_on_close(&mut self) {
        if self.status & SERVER_STATUS_IN_TRANS != 0 || !self.tx_conns.is_empty() {
            if let Err(e) = self.handle_rollback().await {
                warn!(conn_id = self.conn_id, error = %e, "rollback on close failed");
            }
        }
    }

    #[cfg(test)]
    pub fn tx_conn_count(&self) -> usize {
        self.tx_conns.len()
    }
}

fn wrong_value(name: &str, value: &str) -> ExecError {
    ExecError::Sql(SqlError::new(
        error_codes::ER_WRONG_VALUE_FOR_VAR,
        &format!("Variable '{}' can't be set to the value of '{}'", name, value),
    ))
}

fn unknown_charset(charset: &str) -> ExecError {
    ExecError::Sql(SqlError::new(
        error_codes::ER_UNKNOWN_CHARACTER_SET,
        &format!("Unknown character set: '{}'", charset),
    ))
}

fn on_off_value(value: &str) -> Option<i64> {
    match value {
        "on" | "1" => Some(1),
        "off" | "0" => Some(0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamespaceConfig;

    fn manager_with(ns_toml: &str) -> Arc<Manager> {
        let config: NamespaceConfig = toml::from_str(ns_toml).unwrap();
        Manager::new("test", 0, &[config])
    }

    fn executor(manager: &Arc<Manager>, ns: &str) -> SessionExecutor {
        let mut executor = SessionExecutor::new(manager.clone(), 1, "127.0.0.1:50000");
        executor.namespace = ns.to_string();
        executor.user = "u".to_string();
        executor
    }

    const BASIC_NS: &str = r#"
        name = "ns1"
        [[users]]
        username = "u"
        password = "p"
    "#;

    #[tokio::test]
    async fn set_autocommit_clears_in_trans() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");

        executor.handle_begin();
        assert!(executor.is_in_transaction());

        executor.handle_set("SET autocommit = 1").await.unwrap();
        assert!(!executor.is_in_transaction());
        assert!(executor.is_autocommit());
        assert_eq!(executor.tx_conn_count(), 0);
    }

    #[tokio::test]
    async fn set_autocommit_off_enters_transaction_mode() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");

        executor.handle_set("SET autocommit = 0").await.unwrap();
        assert!(!executor.is_autocommit());
        assert!(executor.is_in_transaction());
    }

    #[tokio::test]
    async fn set_global_scope_is_rejected() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");

        let err = executor
            .handle_set("SET GLOBAL sql_mode = ''")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("global"));
    }

    #[tokio::test]
    async fn set_names_validates_collation_charset_pair() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");

        executor
            .handle_set("SET NAMES 'utf8mb4' COLLATE 'utf8mb4_bin'")
            .await
            .unwrap();
        assert_eq!(executor.charset, "utf8mb4");
        assert_eq!(executor.collation_id, crate::protocol::packet::collation_id("utf8mb4_bin").unwrap());

        let err = executor
            .handle_set("SET NAMES 'latin1' COLLATE 'utf8mb4_bin'")
            .await
            .unwrap_err();
        assert_eq!(err.sql_error().unwrap().code, error_codes::ER_UNKNOWN_CHARACTER_SET);
    }

    #[tokio::test]
    async fn set_transaction_keyword_is_rejected() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");
        assert!(executor
            .handle_set("SET transaction read only")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn tx_read_only_rewritten_for_modern_backends() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");
        executor.handle_set("SET tx_read_only = 1").await.unwrap();
        assert_eq!(
            executor.session_variables().get("transaction_read_only"),
            Some("1")
        );
        assert!(executor.session_variables().get("tx_read_only").is_none());
    }

    #[tokio::test]
    async fn whitelisted_variable_is_coerced() {
        let manager = manager_with(
            r#"
            name = "ns1"
            [[users]]
            username = "u"
            password = "p"
            [allowed_session_variables]
            max_execution_time = "int"
            optimizer_switch = "string"
            foreign_key_checks = "bool"
            "#,
        );
        let mut executor = executor(&manager, "ns1");

        executor
            .handle_set("SET max_execution_time = 1000")
            .await
            .unwrap();
        assert_eq!(executor.session_variables().get("max_execution_time"), Some("1000"));

        executor
            .handle_set("SET foreign_key_checks = ON")
            .await
            .unwrap();
        assert_eq!(executor.session_variables().get("foreign_key_checks"), Some("1"));

        let err = executor
            .handle_set("SET max_execution_time = 'abc'")
            .await
            .unwrap_err();
        assert_eq!(err.sql_error().unwrap().code, error_codes::ER_WRONG_VALUE_FOR_VAR);
    }

    #[tokio::test]
    async fn unknown_variable_is_silently_ignored() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");
        executor
            .handle_set("SET something_obscure = 42")
            .await
            .unwrap();
        assert!(executor.session_variables().get("something_obscure").is_none());
    }

    #[tokio::test]
    async fn max_allowed_packet_is_read_only() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");
        let err = executor
            .handle_set("SET max_allowed_packet = 1024")
            .await
            .unwrap_err();
        assert_eq!(err.sql_error().unwrap().code, error_codes::ER_VARIABLE_IS_READONLY);
    }

    #[tokio::test]
    async fn qps_gate_closes_session_only_in_transaction() {
        let manager = manager_with(
            r#"
            name = "ns1"
            client_qps_limit = 1
            support_limit_tx = true
            [[users]]
            username = "u"
            password = "p"
            "#,
        );
        let mut executor = executor(&manager, "ns1");
        let ns = executor.get_namespace().unwrap();

        // drain the bucket
        while ns.try_acquire_qps() {}

        let err = executor.check_qps(&ns).unwrap_err();
        assert!(!err.forces_close());

        executor.handle_begin();
        let err = executor.check_qps(&ns).unwrap_err();
        assert!(err.forces_close());
        assert_eq!(err.sql_error().unwrap().code, error_codes::ER_CLIENT_QPS_LIMITED);
    }

    #[tokio::test]
    async fn qps_gate_without_limit_tx_spares_transactions() {
        let manager = manager_with(
            r#"
            name = "ns1"
            client_qps_limit = 1
            support_limit_tx = false
            [[users]]
            username = "u"
            password = "p"
            "#,
        );
        let mut executor = executor(&manager, "ns1");
        let ns = executor.get_namespace().unwrap();
        while ns.try_acquire_qps() {}

        // in transaction: statements pass the gate untouched
        executor.handle_begin();
        executor.check_qps(&ns).unwrap();

        // outside: plain rejection without close
        executor.status &= !SERVER_STATUS_IN_TRANS;
        let err = executor.check_qps(&ns).unwrap_err();
        assert!(!err.forces_close());
    }

    #[tokio::test]
    async fn use_db_validates_allowed_set() {
        let manager = manager_with(
            r#"
            name = "ns1"
            allowed_dbs = ["orders"]
            [[users]]
            username = "u"
            password = "p"
            "#,
        );
        let mut executor = executor(&manager, "ns1");

        executor.handle_use_db("orders").unwrap();
        assert_eq!(executor.db, "orders");

        let err = executor.handle_use_db("secrets").unwrap_err();
        assert_eq!(err.sql_error().unwrap().code, error_codes::ER_NO_DB_ERROR);
    }

    #[tokio::test]
    async fn read_only_user_cannot_write() {
        let manager = manager_with(
            r#"
            name = "ns1"
            [[users]]
            username = "u"
            password = "p"
            rw_flag = 1
            "#,
        );
        let mut executor = executor(&manager, "ns1");
        let mut req_ctx = RequestContext::new();

        let err = executor
            .check_sql_allowed(&mut req_ctx, "UPDATE t SET x = 1")
            .unwrap_err();
        assert!(err.to_string().contains("read user"));

        executor
            .check_sql_allowed(&mut req_ctx, "SELECT 1")
            .unwrap();
    }

    #[tokio::test]
    async fn blacklisted_sql_is_rejected() {
        let manager = manager_with(
            r#"
            name = "ns1"
            black_sqls = ["SELECT * FROM secrets"]
            [[users]]
            username = "u"
            password = "p"
            "#,
        );
        let mut executor = executor(&manager, "ns1");
        let mut req_ctx = RequestContext::new();

        let err = executor
            .check_sql_allowed(&mut req_ctx, "select  *  from  SECRETS")
            .unwrap_err();
        assert!(err.to_string().contains("blacklist"));
    }

    #[tokio::test]
    async fn stmt_prepare_assigns_ids_and_counts_params() {
        let manager = manager_with(BASIC_NS);
        let mut executor = executor(&manager, "ns1");

        let (id1, params1) = executor
            .handle_stmt_prepare("SELECT * FROM t WHERE id = ?")
            .unwrap();
        let (id2, params2) = executor.handle_stmt_prepare("SELECT 1").unwrap();

        assert_ne!(id1, id2);
        assert_eq!(params1, 1);
        assert_eq!(params2, 0);
        assert_eq!(executor.stmt_count(), 2);

        executor.handle_stmt_close(&Bytes::copy_from_slice(&id1.to_le_bytes()));
        assert_eq!(executor.stmt_count(), 1);
    }
}
