//! Append-only SQL audit log.
//!
//! Lines go to the `sql_audit` tracing target so deployments can split them
//! into their own file; rotation is handled by the log shipper. Field order
//! is `ns, user@client_addr -> backend_addr / db` on every branch.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

/// Runtime toggle for OK-line logging, flipped by the proxy-internal
/// `minerva_general_log` session variable. Error and slow lines always log.
static GENERAL_LOG: AtomicBool = AtomicBool::new(true);

pub fn set_general_log(on: bool) {
    GENERAL_LOG.store(on, Ordering::Relaxed);
}

pub fn general_log_enabled() -> bool {
    GENERAL_LOG.load(Ordering::Relaxed)
}

pub const STATUS_OK: &str = "OK";
pub const STATUS_ERR: &str = "ERROR";
pub const STATUS_SLOW: &str = "SLOW";
pub const STATUS_IGNORE: &str = "IGNORE";
pub const STATUS_BACKEND_SLOW: &str = "backend SLOW";
pub const STATUS_BACKEND_ERR: &str = "backend ERR";

pub const AUDIT_TARGET: &str = "sql_audit";

/// Identity fields attached to every audit line
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub ns: String,
    pub user: String,
    pub client_addr: String,
    pub backend_addr: String,
    pub db: String,
    pub conn_id: u32,
    pub backend_conn_id: u32,
    pub in_tx: bool,
}

pub fn log_ok(ctx: &AuditContext, latency_ms: f64, sql: &str) {
    if !general_log_enabled() {
        return;
    }
    info!(
        target: AUDIT_TARGET,
        status = STATUS_OK,
        latency_ms,
        ns = %ctx.ns,
        user = %ctx.user,
        client_addr = %ctx.client_addr,
        backend_addr = %ctx.backend_addr,
        db = %ctx.db,
        conn_id = ctx.conn_id,
        backend_conn_id = ctx.backend_conn_id,
        in_tx = ctx.in_tx,
        sql = %sql,
    );
}

pub fn log_err(ctx: &AuditContext, latency_ms: f64, sql: &str, err: &str) {
    warn!(
        target: AUDIT_TARGET,
        status = STATUS_ERR,
        latency_ms,
        ns = %ctx.ns,
        user = %ctx.user,
        client_addr = %ctx.client_addr,
        backend_addr = %ctx.backend_addr,
        db = %ctx.db,
        conn_id = ctx.conn_id,
        backend_conn_id = ctx.backend_conn_id,
        in_tx = ctx.in_tx,
        sql = %sql,
        err = %err,
    );
}

pub fn log_slow(ctx: &AuditContext, latency_ms: f64, sql: &str) {
    warn!(
        target: AUDIT_TARGET,
        status = STATUS_SLOW,
        latency_ms,
        ns = %ctx.ns,
        user = %ctx.user,
        client_addr = %ctx.client_addr,
        backend_addr = %ctx.backend_addr,
        db = %ctx.db,
        conn_id = ctx.conn_id,
        backend_conn_id = ctx.backend_conn_id,
        in_tx = ctx.in_tx,
        sql = %sql,
    );
}

pub fn log_ignore(ctx: &AuditContext, sql: &str, reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        status = STATUS_IGNORE,
        latency_ms = 0.0,
        ns = %ctx.ns,
        user = %ctx.user,
        client_addr = %ctx.client_addr,
        backend_addr = %ctx.backend_addr,
        db = %ctx.db,
        conn_id = ctx.conn_id,
        backend_conn_id = ctx.backend_conn_id,
        in_tx = ctx.in_tx,
        sql = %sql,
        err = %reason,
    );
}

pub fn log_backend_slow(ctx: &AuditContext, latency_ms: f64, sql: &str) {
    warn!(
        target: AUDIT_TARGET,
        status = STATUS_BACKEND_SLOW,
        latency_ms,
        ns = %ctx.ns,
        user = %ctx.user,
        client_addr = %ctx.client_addr,
        backend_addr = %ctx.backend_addr,
        db = %ctx.db,
        conn_id = ctx.conn_id,
        backend_conn_id = ctx.backend_conn_id,
        in_tx = ctx.in_tx,
        sql = %sql,
    );
}

pub fn log_backend_err(ctx: &AuditContext, latency_ms: f64, sql: &str, err: &str) {
    warn!(
        target: AUDIT_TARGET,
        status = STATUS_BACKEND_ERR,
        latency_ms,
        ns = %ctx.ns,
        user = %ctx.user,
        client_addr = %ctx.client_addr,
        backend_addr = %ctx.backend_addr,
        db = %ctx.db,
        conn_id = ctx.conn_id,
        backend_conn_id = ctx.backend_conn_id,
        in_tx = ctx.in_tx,
        sql = %sql,
        err = %err,
    );
}
