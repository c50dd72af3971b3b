use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::Role;
use crate::config::NamespaceConfig;
use crate::metrics::audit::{self, AuditContext};
use crate::metrics::{metrics, ExecTimeRecord, SqlResponseRegistry};
use crate::parser;
use crate::protocol::{error_codes, SqlError};
use crate::util::RequestContext;

use super::user::UserManager;
use super::Namespace;

type NamespaceSet = HashMap<String, Arc<Namespace>>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("namespace reload not prepared")]
    NotPrepared,
    #[error("namespace build failed: {0}")]
    Build(String),
}

/// Registry of namespaces and users with dual-buffer hot swap.
///
/// Readers resolve the active slot with an acquire load and never lock a
/// writer path; reload populates the inactive slot and flips the index.
pub struct Manager {
    cluster: String,
    /// Backend slow-SQL threshold from the proxy config, ms
    proxy_slow_sql_time_ms: i64,
    start_time: Instant,
    reload_prepared: AtomicBool,
    /// Which of the two slots readers see
    active: AtomicBool,
    namespaces: [RwLock<Arc<NamespaceSet>>; 2],
    users: [RwLock<Arc<UserManager>>; 2],
    /// Per-namespace client connection counters, for the connection cap
    client_connections: DashMap<String, Arc<AtomicI32>>,
    percentiles: SqlResponseRegistry,
}

impl Manager {
    pub fn new(
        cluster: &str,
        proxy_slow_sql_time_ms: i64,
        configs: &[NamespaceConfig],
    ) -> Arc<Self> {
        let mut set = NamespaceSet::new();
        for config in configs {
            match Namespace::from_config(config, 1) {
                Ok(namespace) => {
                    set.insert(config.name.clone(), Arc::new(namespace));
                }
                Err(e) => {
                    warn!(namespace = %config.name, error = %e, "failed to build namespace, skipping");
                }
            }
        }

        let users = UserManager::from_configs(configs.iter());
        let percentiles = SqlResponseRegistry::new();
        for name in set.keys() {
            percentiles.ensure(name);
        }

        Arc::new(Self {
            cluster: cluster.to_string(),
            proxy_slow_sql_time_ms,
            start_time: Instant::now(),
            reload_prepared: AtomicBool::new(false),
            active: AtomicBool::new(false),
            namespaces: [
                RwLock::new(Arc::new(set)),
                RwLock::new(Arc::new(NamespaceSet::new())),
            ],
            users: [
                RwLock::new(Arc::new(users)),
                RwLock::new(Arc::new(UserManager::new())),
            ],
            client_connections: DashMap::new(),
            percentiles,
        })
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    fn current(&self) -> usize {
        self.active.load(Ordering::Acquire) as usize
    }

    fn current_set(&self) -> Arc<NamespaceSet> {
        self.namespaces[self.current()].read().clone()
    }

    fn current_users(&self) -> Arc<UserManager> {
        self.users[self.current()].read().clone()
    }

    pub fn get_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.current_set().get(name).cloned()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.current_set().keys().cloned().collect()
    }

    pub fn check_user(&self, user: &str) -> bool {
        self.current_users().check_user(user)
    }

    pub fn check_password(&self, user: &str, salt: &[u8], auth: &[u8]) -> Option<String> {
        self.current_users().check_password(user, salt, auth)
    }

    pub fn check_hash_password(&self, user: &str, salt: &[u8], auth: &[u8]) -> Option<String> {
        self.current_users().check_hash_password(user, salt, auth)
    }

    pub fn check_sha2_password(&self, user: &str, salt: &[u8], auth: &[u8]) -> Option<String> {
        self.current_users().check_sha2_password(user, salt, auth)
    }

    pub fn get_namespace_by_user(&self, user: &str, password: &str) -> Option<String> {
        self.current_users().get_namespace_by_user(user, password)
    }

    /// Phase one of a reload: build the replacement into the inactive slot.
    /// The flip only happens at commit, so readers keep the old epoch until
    /// then. A later prepare before commit supersedes this one.
    pub fn reload_prepare(&self, config: &NamespaceConfig) -> Result<(), RegistryError> {
        let current = self.current();
        let other = 1 - current;

        let current_set = self.namespaces[current].read().clone();
        let old_index = current_set
            .get(&config.name)
            .map(|ns| ns.change_index())
            .unwrap_or(0);

        let namespace = Namespace::from_config(config, old_index + 1)
            .map_err(RegistryError::Build)?;

        let mut next_set = (*current_set).clone();
        next_set.insert(config.name.clone(), Arc::new(namespace));
        *self.namespaces[other].write() = Arc::new(next_set);

        let mut next_users = (*self.users[current].read().clone()).clone();
        next_users.rebuild_namespace_users(config);
        *self.users[other].write() = Arc::new(next_users);

        self.percentiles.ensure(&config.name);
        self.reload_prepared.store(true, Ordering::Release);
        info!(namespace = %config.name, epoch = old_index + 1, "namespace reload prepared");
        Ok(())
    }

    /// Phase two: flip the active slot and drain the replaced namespace in
    /// the background.
    pub fn reload_commit(&self, name: &str) -> Result<(), RegistryError> {
        if self
            .reload_prepared
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(namespace = %name, "reload commit without prepare");
            return Err(RegistryError::NotPrepared);
        }

        let current = self.current();
        let old = self.namespaces[current].read().get(name).cloned();
        if let Some(old) = old {
            old.close(true);
        }

        self.active.store(current == 0, Ordering::Release);
        info!(namespace = %name, "namespace reload committed");
        Ok(())
    }

    /// Remove a namespace via the same dual-slot flip; idempotent
    pub fn delete_namespace(&self, name: &str) -> Result<(), RegistryError> {
        let current = self.current();
        let other = 1 - current;

        let current_set = self.namespaces[current].read().clone();
        let old = match current_set.get(name) {
            Some(ns) => ns.clone(),
            None => return Ok(()),
        };

        let mut next_set = (*current_set).clone();
        next_set.remove(name);
        *self.namespaces[other].write() = Arc::new(next_set);

        let mut next_users = (*self.users[current].read().clone()).clone();
        next_users.clear_namespace_users(name);
        *self.users[other].write() = Arc::new(next_users);

        self.active.store(current == 0, Ordering::Release);
        self.percentiles.remove(name);
        old.close(true);
        info!(namespace = %name, "namespace deleted");
        Ok(())
    }

    /// MD5 over the sorted namespace dumps, for config drift detection
    pub fn config_fingerprint(&self) -> String {
        let set = self.current_set();
        let mut names: Vec<&String> = set.keys().collect();
        names.sort();

        let mut hasher = Md5::new();
        for name in names {
            if let Ok(dump) = serde_json::to_vec(set[name].config()) {
                hasher.update(&dump);
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Reserve a connection-cap slot. The increment happens first so the
    /// observed count can never admit more than `max` sessions; a rejected
    /// reservation is rolled back and the pre-reservation count returned.
    pub fn try_incr_connection_count(&self, namespace: &str, max: i32) -> Result<i32, i32> {
        let counter = self
            .client_connections
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(AtomicI32::new(0)))
            .clone();
        let reserved = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if max > 0 && reserved > max {
            counter.fetch_sub(1, Ordering::SeqCst);
            return Err(reserved - 1);
        }
        metrics().incr_session_count(&self.cluster, namespace);
        Ok(reserved)
    }

    pub fn decr_connection_count(&self, namespace: &str) {
        match self.client_connections.get(namespace) {
            Some(counter) => {
                counter.fetch_sub(1, Ordering::SeqCst);
            }
            None => warn!(namespace, "connection count missing on decrement"),
        }
        metrics().decr_session_count(&self.cluster, namespace);
    }

    pub fn connection_count(&self, namespace: &str) -> i32 {
        self.client_connections
            .get(namespace)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn add_read_flow(&self, namespace: &str, bytes: usize) {
        metrics().add_read_flow(&self.cluster, namespace, bytes as u64);
    }

    fn operation(req_ctx: &RequestContext, sql: &str) -> String {
        match req_ctx.stmt_type() {
            Some(stmt_type) => stmt_type.name().to_string(),
            None => parser::preview(sql).name().to_string(),
        }
    }

    /// Record timings, audit lines and fingerprint counters for one
    /// session-side statement outcome.
    pub fn record_session_sql_metrics(
        &self,
        req_ctx: &mut RequestContext,
        audit_ctx: &AuditContext,
        sql: &str,
        start_time: Instant,
        err: Option<&SqlError>,
    ) {
        let namespace = audit_ctx.ns.clone();
        let ns = match self.get_namespace(&namespace) {
            Some(ns) => ns,
            None => {
                warn!(namespace = %namespace, sql, "record session SQL metrics: namespace not found");
                return;
            }
        };

        let operation = Self::operation(req_ctx, sql);
        let elapsed = start_time.elapsed();
        let latency_ms = elapsed.as_secs_f64() * 1000.0;

        // limiter rejections carry no execution time worth recording
        let qps_limited = err.map(|e| e.code == error_codes::ER_CLIENT_QPS_LIMITED).unwrap_or(false);
        if !qps_limited {
            metrics().record_sql_timing(&self.cluster, &namespace, &operation, elapsed.as_secs_f64());
        }

        match err {
            None => audit::log_ok(audit_ctx, latency_ms, sql),
            Some(err) => {
                audit::log_err(audit_ctx, latency_ms, sql, &err.to_string());
                let md5 = parser::fingerprint_md5(req_ctx.fingerprint(sql));
                metrics().record_sql_error(&self.cluster, &namespace, &operation, &md5);
            }
        }

        if ns.slow_sql_time_ms() > 0 && latency_ms as i64 > ns.slow_sql_time_ms() {
            audit::log_slow(audit_ctx, latency_ms, sql);
            let md5 = parser::fingerprint_md5(req_ctx.fingerprint(sql));
            metrics().record_slow_sql_fingerprint(&self.cluster, &namespace, &md5);
        }
    }

    /// Record one backend round trip: timing samples for the percentile
    /// aggregator plus backend slow/error fingerprints.
    pub async fn record_backend_sql_metrics(
        &self,
        req_ctx: &mut RequestContext,
        audit_ctx: &AuditContext,
        slice: &str,
        sql: &str,
        backend_addr: &str,
        start_time: Instant,
        err: Option<&SqlError>,
    ) {
        let namespace = &audit_ctx.ns;
        let operation = Self::operation(req_ctx, sql);
        let elapsed = start_time.elapsed();

        metrics().record_backend_sql_timing(
            &self.cluster,
            namespace,
            &operation,
            elapsed.as_secs_f64(),
        );
        self.percentiles
            .record(
                namespace,
                ExecTimeRecord {
                    slice: slice.to_string(),
                    backend_addr: backend_addr.to_string(),
                    exec_time_us: elapsed.as_micros() as i64,
                },
            )
            .await;

        let latency_ms = elapsed.as_secs_f64() * 1000.0;
        if self.proxy_slow_sql_time_ms > 0 && latency_ms as i64 > self.proxy_slow_sql_time_ms {
            audit::log_backend_slow(audit_ctx, latency_ms, sql);
            let md5 = parser::fingerprint_md5(req_ctx.fingerprint(sql));
            metrics().record_backend_slow_sql_fingerprint(&self.cluster, namespace, &md5);
        }

        if let Some(err) = err {
            audit::log_backend_err(audit_ctx, latency_ms, sql, &err.to_string());
            let md5 = parser::fingerprint_md5(req_ctx.fingerprint(sql));
            metrics().record_backend_sql_error(&self.cluster, namespace, &operation, &md5);
        }
    }

    pub fn record_sql_forbidden(&self, namespace: &str, fingerprint: &str) {
        let md5 = parser::fingerprint_md5(fingerprint);
        metrics().record_sql_forbidden(&self.cluster, namespace, &md5);
    }

    /// Periodic task publishing uptime, percentile gauges and backend pool
    /// gauges for every namespace.
    pub fn start_metrics_task(self: &Arc<Self>, interval_s: u64) {
        let manager = self.clone();
        let interval = Duration::from_secs(interval_s.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.collect_metrics().await;
            }
        });
    }

    async fn collect_metrics(&self) {
        metrics().set_uptime(&self.cluster, self.start_time.elapsed().as_secs() as i64);

        self.percentiles.aggregate();
        for namespace in self.percentiles.namespaces() {
            if let Some(snapshot) = self.percentiles.snapshot(&namespace) {
                for (addr, p99_max) in &snapshot.p99_max {
                    metrics().set_backend_percentiles(
                        &self.cluster,
                        &namespace,
                        addr,
                        *p99_max,
                        snapshot.p99_avg.get(addr).copied().unwrap_or(0),
                        snapshot.p95_max.get(addr).copied().unwrap_or(0),
                        snapshot.p95_avg.get(addr).copied().unwrap_or(0),
                    );
                }
            }
        }

        let set = self.current_set();
        for (name, namespace) in set.iter() {
            for (slice_name, slice) in namespace.slices() {
                for role in [Role::Master, Role::Slave, Role::StatisticSlave] {
                    for (addr, stats, up) in slice.stats(role).await {
                        metrics().set_pool_gauges(
                            &self.cluster,
                            name,
                            slice_name,
                            &addr,
                            role.as_str(),
                            stats,
                            up,
                        );
                    }
                }
            }
        }
    }

    /// Shut everything down without the drain delay
    pub fn close(&self) {
        let set = self.current_set();
        for namespace in set.values() {
            namespace.clone().close(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns_config(name: &str, user: &str, password: &str) -> NamespaceConfig {
        toml::from_str(&format!(
            r#"
            name = "{}"
            [[users]]
            username = "{}"
            password = "{}"
            "#,
            name, user, password
        ))
        .unwrap()
    }

    fn new_manager() -> Arc<Manager> {
        Manager::new("test", 0, &[ns_config("ns1", "u", "p")])
    }

    #[tokio::test]
    async fn get_namespace_resolves_active_slot() {
        let manager = new_manager();
        let ns = manager.get_namespace("ns1").unwrap();
        assert_eq!(ns.name(), "ns1");
        assert_eq!(ns.change_index(), 1);
        assert!(manager.get_namespace("missing").is_none());
    }

    #[tokio::test]
    async fn commit_without_prepare_fails() {
        let manager = new_manager();
        assert!(matches!(
            manager.reload_commit("ns1"),
            Err(RegistryError::NotPrepared)
        ));
    }

    #[tokio::test]
    async fn reload_bumps_change_index_monotonically() {
        let manager = new_manager();

        for expected in 2..=5u64 {
            manager.reload_prepare(&ns_config("ns1", "u", "p")).unwrap();
            // prepare must not be visible before commit
            assert_eq!(manager.get_namespace("ns1").unwrap().change_index(), expected - 1);
            manager.reload_commit("ns1").unwrap();
            assert_eq!(manager.get_namespace("ns1").unwrap().change_index(), expected);
        }
    }

    #[tokio::test]
    async fn reload_replaces_users_atomically() {
        let manager = new_manager();
        assert_eq!(manager.get_namespace_by_user("u", "p").as_deref(), Some("ns1"));

        manager
            .reload_prepare(&ns_config("ns1", "u", "p_new"))
            .unwrap();
        // old credentials still valid until commit
        assert_eq!(manager.get_namespace_by_user("u", "p").as_deref(), Some("ns1"));

        manager.reload_commit("ns1").unwrap();
        assert!(manager.get_namespace_by_user("u", "p").is_none());
        assert_eq!(
            manager.get_namespace_by_user("u", "p_new").as_deref(),
            Some("ns1")
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let manager = new_manager();
        manager.delete_namespace("ns1").unwrap();
        assert!(manager.get_namespace("ns1").is_none());
        assert!(!manager.check_user("u"));
        // second delete is a no-op
        manager.delete_namespace("ns1").unwrap();
    }

    #[tokio::test]
    async fn new_namespace_via_reload_starts_at_epoch_one() {
        let manager = new_manager();
        manager.reload_prepare(&ns_config("ns2", "v", "q")).unwrap();
        manager.reload_commit("ns2").unwrap();

        assert_eq!(manager.get_namespace("ns2").unwrap().change_index(), 1);
        // ns1 survives the flip untouched
        assert_eq!(manager.get_namespace("ns1").unwrap().change_index(), 1);
    }

    #[tokio::test]
    async fn connection_counters_track_sessions() {
        let manager = new_manager();
        assert_eq!(manager.connection_count("ns1"), 0);
        manager.try_incr_connection_count("ns1", 0).unwrap();
        manager.try_incr_connection_count("ns1", 0).unwrap();
        assert_eq!(manager.connection_count("ns1"), 2);
        manager.decr_connection_count("ns1");
        assert_eq!(manager.connection_count("ns1"), 1);
    }

    #[tokio::test]
    async fn connection_cap_admits_exactly_max() {
        let manager = new_manager();
        assert!(manager.try_incr_connection_count("ns1", 2).is_ok());
        assert!(manager.try_incr_connection_count("ns1", 2).is_ok());
        assert_eq!(manager.try_incr_connection_count("ns1", 2), Err(2));
        // the failed reservation must not leak into the count
        assert_eq!(manager.connection_count("ns1"), 2);

        manager.decr_connection_count("ns1");
        assert!(manager.try_incr_connection_count("ns1", 2).is_ok());
    }

    #[tokio::test]
    async fn config_fingerprint_changes_with_config() {
        let manager = new_manager();
        let before = manager.config_fingerprint();

        manager
            .reload_prepare(&ns_config("ns1", "u", "p_other"))
            .unwrap();
        manager.reload_commit("ns1").unwrap();

        assert_ne!(before, manager.config_fingerprint());
    }
}
