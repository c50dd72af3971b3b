mod registry;
mod user;

pub use registry::{Manager, RegistryError};
pub use user::UserManager;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{ConnectionBroker, ConnectionError, PooledConn, Role, Slice};
use crate::circuit::QpsLimiter;
use crate::config::{NamespaceConfig, UserConfig, RW_FLAG_READ_ONLY};
use crate::parser;
use crate::protocol::packet::{
    charset_default_collation, collation_id, DEFAULT_COLLATION_ID,
};
use crate::router::Router;

/// Allowed-IP predicate entry: exact address or CIDR block
#[derive(Debug, Clone)]
enum IpRule {
    Exact(IpAddr),
    Cidr(IpAddr, u8),
}

impl IpRule {
    fn parse(spec: &str) -> Option<Self> {
        if let Some((addr, prefix)) = spec.split_once('/') {
            let addr: IpAddr = addr.trim().parse().ok()?;
            let prefix: u8 = prefix.trim().parse().ok()?;
            Some(IpRule::Cidr(addr, prefix))
        } else {
            spec.trim().parse().ok().map(IpRule::Exact)
        }
    }

    fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            IpRule::Exact(addr) => addr == ip,
            IpRule::Cidr(net, prefix) => match (net, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let prefix = (*prefix).min(32) as u32;
                    if prefix == 0 {
                        return true;
                    }
                    let mask = u32::MAX << (32 - prefix);
                    (u32::from(*net) & mask) == (u32::from(*ip) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let prefix = (*prefix).min(128) as u32;
                    if prefix == 0 {
                        return true;
                    }
                    let mask = u128::MAX << (128 - prefix);
                    (u128::from(*net) & mask) == (u128::from(*ip) & mask)
                }
                _ => false,
            },
        }
    }
}

/// A named policy+topology bundle. Immutable once built; hot reload
/// replaces the whole instance and bumps `change_index`.
pub struct Namespace {
    name: String,
    allowed_dbs: HashSet<String>,
    default_phy_dbs: HashMap<String, String>,
    allowed_ips: Vec<IpRule>,
    users: HashMap<String, UserConfig>,
    slices: HashMap<String, Arc<Slice>>,
    default_slice: String,
    default_charset: String,
    default_collation_id: u16,
    router: Router,
    gray_router: Router,
    max_client_connections: i32,
    client_qps_limit: u32,
    support_limit_tx: bool,
    support_multi_query: bool,
    keep_session: bool,
    slow_sql_time_ms: i64,
    max_result_size: usize,
    allowed_session_variables: HashMap<String, String>,
    black_sql_fingerprints: HashSet<String>,
    limiter: QpsLimiter,
    /// Monotonic reload epoch; sessions compare snapshots of this value
    /// around each request to detect hot swaps.
    change_index: u64,
    config: NamespaceConfig,
}

impl Namespace {
    pub fn from_config(config: &NamespaceConfig, change_index: u64) -> Result<Self, String> {
        let mut allowed_ips = Vec::new();
        for spec in &config.allowed_ips {
            match IpRule::parse(spec) {
                Some(rule) => allowed_ips.push(rule),
                None => return Err(format!("invalid allowed ip entry: {}", spec)),
            }
        }

        let mut slices = HashMap::new();
        for slice_config in &config.slices {
            slices.insert(
                slice_config.name.clone(),
                Arc::new(Slice::from_config(slice_config)),
            );
        }
        if !config.slices.is_empty() && !slices.contains_key(&config.default_slice) {
            return Err(format!("default slice {} not defined", config.default_slice));
        }

        let default_collation_id = if config.default_collation.is_empty() {
            charset_default_collation(&config.default_charset).unwrap_or(DEFAULT_COLLATION_ID)
        } else {
            collation_id(&config.default_collation)
                .ok_or_else(|| format!("unknown collation: {}", config.default_collation))?
        };

        let black_sql_fingerprints = config
            .black_sqls
            .iter()
            .map(|sql| parser::fingerprint(sql))
            .collect();

        Ok(Self {
            name: config.name.clone(),
            allowed_dbs: config.allowed_dbs.iter().cloned().collect(),
            default_phy_dbs: config.default_phy_dbs.clone(),
            allowed_ips,
            users: config
                .users
                .iter()
                .map(|u| (u.username.clone(), u.clone()))
                .collect(),
            slices,
            default_slice: config.default_slice.clone(),
            default_charset: config.default_charset.clone(),
            default_collation_id,
            router: Router::from_config(config),
            gray_router: Router::empty(&config.default_slice),
            max_client_connections: config.max_client_connections,
            client_qps_limit: config.client_qps_limit,
            support_limit_tx: config.support_limit_tx,
            support_multi_query: config.support_multi_query,
            keep_session: config.keep_session,
            slow_sql_time_ms: config.slow_sql_time_ms,
            max_result_size: config.max_result_size,
            allowed_session_variables: config.allowed_session_variables.clone(),
            black_sql_fingerprints,
            limiter: QpsLimiter::new(config.client_qps_limit),
            change_index,
            config: config.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn change_index(&self) -> u64 {
        self.change_index
    }

    /// Empty allowlist admits every client
    pub fn is_client_ip_allowed(&self, ip: &IpAddr) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.iter().any(|rule| rule.matches(ip))
    }

    pub fn is_allowed_db(&self, db: &str) -> bool {
        self.allowed_dbs.is_empty() || self.allowed_dbs.contains(db)
    }

    pub fn default_phy_db(&self, db: &str) -> Option<&str> {
        self.default_phy_dbs.get(db).map(String::as_str)
    }

    pub fn default_phy_dbs(&self) -> &HashMap<String, String> {
        &self.default_phy_dbs
    }

    /// Blacklist predicate, matched on the normalized fingerprint
    pub fn is_sql_allowed(&self, fingerprint: &str) -> bool {
        !self.black_sql_fingerprints.contains(fingerprint)
    }

    pub fn is_read_only_user(&self, user: &str) -> bool {
        self.users
            .get(user)
            .map(|u| u.rw_flag == RW_FLAG_READ_ONLY)
            .unwrap_or(false)
    }

    /// Whether this user's reads may be served from slave pools
    pub fn is_rw_split(&self, user: &str) -> bool {
        self.users.get(user).map(|u| u.rw_split).unwrap_or(false)
    }

    pub fn get_slice(&self, name: &str) -> Option<&Arc<Slice>> {
        self.slices.get(name)
    }

    pub fn slices(&self) -> &HashMap<String, Arc<Slice>> {
        &self.slices
    }

    pub fn default_slice(&self) -> &str {
        &self.default_slice
    }

    pub fn default_charset(&self) -> &str {
        &self.default_charset
    }

    pub fn default_collation_id(&self) -> u16 {
        self.default_collation_id
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn gray_router(&self) -> &Router {
        &self.gray_router
    }

    pub fn max_client_connections(&self) -> i32 {
        self.max_client_connections
    }

    pub fn client_qps_limit(&self) -> u32 {
        self.client_qps_limit
    }

    pub fn support_limit_tx(&self) -> bool {
        self.support_limit_tx
    }

    pub fn support_multi_query(&self) -> bool {
        self.support_multi_query
    }

    pub fn is_keep_session(&self) -> bool {
        self.keep_session
    }

    pub fn slow_sql_time_ms(&self) -> i64 {
        self.slow_sql_time_ms
    }

    pub fn max_result_size(&self) -> usize {
        self.max_result_size
    }

    pub fn allowed_session_variables(&self) -> &HashMap<String, String> {
        &self.allowed_session_variables
    }

    /// Non-blocking QPS token grab
    pub fn try_acquire_qps(&self) -> bool {
        self.limiter.try_acquire()
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Dispose of all backend pools. With `delay`, the drain happens in a
    /// background task so in-flight sessions on the old epoch can finish.
    pub fn close(self: Arc<Self>, delay: bool) {
        if delay {
            tokio::spawn(async move {
                for slice in self.slices.values() {
                    slice.close(true).await;
                }
                info!(namespace = %self.name, "old namespace drained and closed");
            });
        } else {
            let this = self;
            tokio::spawn(async move {
                for slice in this.slices.values() {
                    slice.close(false).await;
                }
            });
        }
    }
}

impl ConnectionBroker for Namespace {
    async fn acquire(&self, slice: &str, role: Role) -> Result<PooledConn, ConnectionError> {
        let slice = self
            .slices
            .get(slice)
            .ok_or_else(|| {
                warn!(namespace = %self.name, slice, "acquire on unknown slice");
                ConnectionError::UnknownSlice(slice.to_string())
            })?;
        slice.acquire(role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(toml_src: &str) -> Namespace {
        let config: NamespaceConfig = toml::from_str(toml_src).unwrap();
        Namespace::from_config(&config, 1).unwrap()
    }

    #[test]
    fn empty_allowlist_admits_all() {
        let namespace = ns("name = \"ns1\"");
        assert!(namespace.is_client_ip_allowed(&"10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn exact_and_cidr_ip_rules() {
        let namespace = ns(
            r#"
            name = "ns1"
            allowed_ips = ["127.0.0.1", "192.168.0.0/16"]
            "#,
        );
        assert!(namespace.is_client_ip_allowed(&"127.0.0.1".parse().unwrap()));
        assert!(namespace.is_client_ip_allowed(&"192.168.3.7".parse().unwrap()));
        assert!(!namespace.is_client_ip_allowed(&"10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn cidr_32_matches_only_itself() {
        let namespace = ns(
            r#"
            name = "ns1"
            allowed_ips = ["127.0.0.1/32"]
            "#,
        );
        assert!(namespace.is_client_ip_allowed(&"127.0.0.1".parse().unwrap()));
        assert!(!namespace.is_client_ip_allowed(&"10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn blacklist_matches_by_fingerprint() {
        let namespace = ns(
            r#"
            name = "ns1"
            black_sqls = ["SELECT * FROM secrets WHERE id = 1"]
            "#,
        );
        // whitespace and literal changes still hit the same fingerprint
        let fp = parser::fingerprint("select *  from secrets where id=99");
        assert!(!namespace.is_sql_allowed(&fp));
        let fp = parser::fingerprint("select name from users");
        assert!(namespace.is_sql_allowed(&fp));
    }

    #[test]
    fn read_only_user_flag() {
        let namespace = ns(
            r#"
            name = "ns1"
            [[users]]
            username = "reader"
            password = "p"
            rw_flag = 1
            [[users]]
            username = "writer"
            password = "p"
            rw_flag = 2
            "#,
        );
        assert!(namespace.is_read_only_user("reader"));
        assert!(!namespace.is_read_only_user("writer"));
        assert!(!namespace.is_read_only_user("missing"));
    }

    #[test]
    fn invalid_ip_entry_fails_build() {
        let config: NamespaceConfig = toml::from_str(
            r#"
            name = "ns1"
            allowed_ips = ["not-an-ip"]
            "#,
        )
        .unwrap();
        assert!(Namespace::from_config(&config, 1).is_err());
    }

    #[test]
    fn collation_defaults_follow_charset() {
        let namespace = ns("name = \"ns1\"");
        assert_eq!(namespace.default_charset(), "utf8mb4");
        assert_eq!(namespace.default_collation_id(), DEFAULT_COLLATION_ID);
    }
}
