use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_stats_enabled")]
    pub stats_enabled: bool,
    /// Backend pool metrics collection interval, seconds
    #[serde(default = "default_stats_interval_s")]
    pub stats_interval_s: u64,
    /// Backend slow-SQL threshold, ms; 0 disables backend slow logging
    #[serde(default)]
    pub slow_sql_time_ms: i64,
    #[serde(default)]
    pub num_cpu: usize,
    #[serde(default = "default_log_path")]
    pub log_path: String,
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_keep_days")]
    pub log_keep_days: u32,
    #[serde(default = "default_log_keep_counts")]
    pub log_keep_counts: u32,
    /// Idle session timeout, seconds
    #[serde(default = "default_session_timeout_s")]
    pub session_timeout_s: u64,
    #[serde(default)]
    pub encrypt_key: String,
    /// Coordinator endpoints, for deployments that store namespaces in a
    /// coordination service instead of files
    #[serde(default)]
    pub coordinator_addr: String,
    #[serde(default)]
    pub coordinator_root: String,
    #[serde(default)]
    pub coordinator_username: String,
    #[serde(default)]
    pub coordinator_password: String,
    /// Directory holding per-namespace definition files
    #[serde(default = "default_file_config_path")]
    pub file_config_path: String,
}

fn default_cluster() -> String {
    "default".to_string()
}

fn default_service() -> String {
    "minerva".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:13306".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:13307".to_string()
}

fn default_stats_enabled() -> bool {
    true
}

fn default_stats_interval_s() -> u64 {
    10
}

fn default_log_path() -> String {
    "./logs".to_string()
}

fn default_log_file_name() -> String {
    "minerva".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_keep_days() -> u32 {
    3
}

fn default_log_keep_counts() -> u32 {
    72
}

fn default_session_timeout_s() -> u64 {
    3600
}

fn default_file_config_path() -> String {
    "./namespaces".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty proxy config must deserialize")
    }
}

/// One namespace definition: users, policy, topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default)]
    pub allowed_dbs: Vec<String>,
    /// Logical db -> physical db name
    #[serde(default)]
    pub default_phy_dbs: HashMap<String, String>,
    /// Client IPs / CIDR blocks allowed to connect; empty allows all
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub slices: Vec<SliceConfig>,
    #[serde(default)]
    pub shard_rules: Vec<ShardRuleConfig>,
    #[serde(default = "default_slice_name")]
    pub default_slice: String,
    #[serde(default = "default_charset")]
    pub default_charset: String,
    #[serde(default)]
    pub default_collation: String,
    /// 0 means unlimited
    #[serde(default)]
    pub max_client_connections: i32,
    /// Queries per second allowed per namespace; 0 disables the limiter
    #[serde(default)]
    pub client_qps_limit: u32,
    /// Apply the QPS limiter to in-transaction statements too
    #[serde(default)]
    pub support_limit_tx: bool,
    #[serde(default)]
    pub support_multi_query: bool,
    /// Pin backend connections across non-transactional statements
    #[serde(default)]
    pub keep_session: bool,
    /// Session slow-SQL threshold, ms; 0 disables slow logging
    #[serde(default)]
    pub slow_sql_time_ms: i64,
    #[serde(default = "default_max_result_size")]
    pub max_result_size: usize,
    /// Extra session variables clients may set: name -> int|string|bool
    #[serde(default)]
    pub allowed_session_variables: HashMap<String, String>,
    /// Statements refused outright, matched by fingerprint
    #[serde(default)]
    pub black_sqls: Vec<String>,
}

fn default_slice_name() -> String {
    "slice-0".to_string()
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_max_result_size() -> usize {
    16 * 1024 * 1024
}

/// Read/write markers for namespace users
pub const RW_FLAG_READ_ONLY: u8 = 1;
pub const RW_FLAG_WRITE: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_rw_flag")]
    pub rw_flag: u8,
    /// Whether this user's reads may go to slaves
    #[serde(default)]
    pub rw_split: bool,
}

fn default_rw_flag() -> u8 {
    RW_FLAG_WRITE
}

/// One shard unit: a master and optional slave / statistic-slave replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceConfig {
    pub name: String,
    pub user_name: String,
    pub password: String,
    /// master address, `host:port`
    pub master: String,
    #[serde(default)]
    pub slaves: Vec<String>,
    #[serde(default)]
    pub statistic_slaves: Vec<String>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: u64,
}

fn default_capacity() -> usize {
    64
}

fn default_idle_timeout_s() -> u64 {
    3600
}

/// Sharding rule: which table shards, on which column, across which slices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRuleConfig {
    pub db: String,
    pub table: String,
    pub shard_column: String,
    pub slices: Vec<String>,
    #[serde(default = "default_shard_type")]
    pub shard_type: String,
    #[serde(default)]
    pub locations: Vec<usize>,
}

fn default_shard_type() -> String {
    "mod".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_config_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.cluster, "default");
        assert_eq!(config.stats_interval_s, 10);
        assert_eq!(config.log_keep_days, 3);
        assert_eq!(config.log_keep_counts, 72);
        assert_eq!(config.session_timeout_s, 3600);
    }

    #[test]
    fn namespace_config_parses_minimal_toml() {
        let config: NamespaceConfig = toml::from_str(
            r#"
            name = "ns1"
            allowed_dbs = ["orders"]

            [[users]]
            username = "u"
            password = "p"

            [[slices]]
            name = "slice-0"
            user_name = "proxy"
            password = "proxy_pw"
            master = "127.0.0.1:3306"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "ns1");
        assert_eq!(config.users[0].rw_flag, RW_FLAG_WRITE);
        assert_eq!(config.default_slice, "slice-0");
        assert_eq!(config.slices[0].capacity, 64);
        assert!(!config.keep_session);
    }
}
