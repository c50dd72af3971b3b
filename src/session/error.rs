use thiserror::Error;

use crate::backend::ConnectionError;
use crate::protocol::{error_codes, SqlError};

/// Execution-path errors with the write-then-close contract encoded in the
/// variant: generic errors keep the session open, the close variants force
/// teardown with or without an ERR packet on the wire first.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{0}")]
    Sql(SqlError),

    #[error("session fatal: {0}")]
    CloseWithResp(SqlError),

    #[error("session closed without response")]
    CloseNoResp,
}

impl ExecError {
    pub fn sql(code: u16, message: &str) -> Self {
        ExecError::Sql(SqlError::new(code, message))
    }

    pub fn internal(message: &str) -> Self {
        Self::sql(error_codes::ER_UNKNOWN_ERROR, message)
    }

    pub fn forces_close(&self) -> bool {
        matches!(self, ExecError::CloseWithResp(_) | ExecError::CloseNoResp)
    }

    /// The ERR payload for the client, when one is owed
    pub fn sql_error(&self) -> Option<&SqlError> {
        match self {
            ExecError::Sql(err) | ExecError::CloseWithResp(err) => Some(err),
            ExecError::CloseNoResp => None,
        }
    }
}

impl From<SqlError> for ExecError {
    fn from(err: SqlError) -> Self {
        ExecError::Sql(err)
    }
}

impl From<ConnectionError> for ExecError {
    fn from(err: ConnectionError) -> Self {
        ExecError::Sql(err.to_sql_error())
    }
}
