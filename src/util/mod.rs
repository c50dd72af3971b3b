mod timewheel;

pub use timewheel::TimeoutWheel;

use crate::parser::StmtType;

/// Per-request scratch state threaded through the query pipeline
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub stmt_type: Option<StmtType>,
    pub tokens: Vec<String>,
    pub fingerprint: Option<String>,
    /// Route reads to a slave pool for this request
    pub from_slave: bool,
    pub default_slice: String,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            stmt_type: None,
            tokens: Vec::new(),
            fingerprint: None,
            from_slave: false,
            default_slice: String::new(),
        }
    }

    pub fn stmt_type(&self) -> Option<StmtType> {
        self.stmt_type
    }

    /// Compute and cache the normalized fingerprint for this request's SQL
    pub fn fingerprint(&mut self, sql: &str) -> &str {
        if self.fingerprint.is_none() {
            self.fingerprint = Some(crate::parser::fingerprint(sql));
        }
        self.fingerprint.as_deref().unwrap_or_default()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort reverse lookup of a client host, used only to recognize
/// load-balancer liveness probes during handshake failures. Resolution is
/// delegated to the deployment via `/etc/hosts`-style naming; an override
/// env var keeps this testable without a resolver.
pub fn lookup_hostname(host: &str) -> Option<String> {
    if let Ok(name) = std::env::var("MINERVA_PEER_HOSTNAME") {
        return Some(name);
    }
    // numeric addresses carry no name; non-numeric peers already are one
    if host.parse::<std::net::IpAddr>().is_ok() {
        None
    } else {
        Some(host.to_string())
    }
}
