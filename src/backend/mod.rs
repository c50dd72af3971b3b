mod conn;
mod pool;
mod slice;

pub use conn::{BackendAddr, PooledConn};
pub use pool::{ConnPool, PoolStats};
pub use slice::Slice;

use crate::protocol::SqlError;

/// Which pool within a slice a connection is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
    StatisticSlave,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
            Role::StatisticSlave => "statistic-slave",
        }
    }
}

/// Narrow facade the session engine uses to obtain backend connections
pub trait ConnectionBroker {
    fn acquire(
        &self,
        slice: &str,
        role: Role,
    ) -> impl std::future::Future<Output = Result<PooledConn, ConnectionError>> + Send;
}

/// Backend connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connection disconnected")]
    Disconnected,

    #[error("unknown slice: {0}")]
    UnknownSlice(String),

    #[error("{0}")]
    Server(SqlError),
}

impl ConnectionError {
    /// Map to the error sent to the client; backend errors keep their code
    pub fn to_sql_error(&self) -> SqlError {
        match self {
            ConnectionError::Server(err) => err.clone(),
            other => SqlError::new(
                crate::protocol::error_codes::ER_UNKNOWN_ERROR,
                &other.to_string(),
            ),
        }
    }
}
