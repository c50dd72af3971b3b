//! Client session: handshake, read/exec/write loop and lifecycle.

mod error;
mod executor;
mod stmt;
mod variables;

pub use error::ExecError;
pub use executor::{ContinueConn, SessionExecutor};
pub use stmt::Stmt;
pub use variables::SessionVariables;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::namespace::Manager;
use crate::protocol::packet::status::SERVER_MORE_RESULTS_EXISTS;
use crate::protocol::{
    capabilities, error_codes, ClientConn, Command, Field, HandshakeResponse, InitialHandshake,
    ResultSet, SqlError, CACHING_SHA2_PASSWORD,
};
use crate::util::{self, TimeoutWheel};

/// Version string advertised in the initial handshake
pub const SERVER_VERSION: &str = "5.7.25-minerva";

/// Response envelope produced by command execution and consumed by the
/// framed writer. Error sub-kinds encode the close contract.
pub enum Response {
    Ok(u16),
    Eof(u16),
    Result {
        status: u16,
        result: Option<ResultSet>,
        binary: bool,
    },
    Prepare {
        status: u16,
        stmt_id: u32,
        param_count: u16,
    },
    FieldList {
        status: u16,
        fields: Vec<Field>,
    },
    Error {
        status: u16,
        error: ExecError,
    },
    Noop,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(SqlError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One client connection's session
pub struct Session<S> {
    client: ClientConn<S>,
    manager: Arc<Manager>,
    namespace: String,
    executor: SessionExecutor,
    closed: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    timeout_wheel: Arc<TimeoutWheel>,
    session_timeout: Duration,
    peer_addr: String,
    /// Whether this session holds a slot in the namespace connection cap
    counted: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        connection_id: u32,
        peer_addr: String,
        manager: Arc<Manager>,
        timeout_wheel: Arc<TimeoutWheel>,
        session_timeout: Duration,
    ) -> Self {
        let executor = SessionExecutor::new(manager.clone(), connection_id, &peer_addr);
        Self {
            client: ClientConn::new(stream, connection_id),
            manager,
            namespace: String::new(),
            executor,
            closed: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
            timeout_wheel,
            session_timeout,
            peer_addr,
            counted: false,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.client.connection_id
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.peer_addr.as_str())
            .parse()
            .ok()
    }

    /// Drive the session to completion
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = match self.handshake().await {
            Ok(()) => {
                info!(
                    conn_id = self.connection_id(),
                    namespace = %self.namespace,
                    user = %self.executor.user,
                    "client authenticated"
                );
                self.command_loop().await
            }
            Err(SessionError::Handshake(err)) => {
                let _ = self.client.write_error(&err).await;
                Err(SessionError::Handshake(err))
            }
            Err(e) => Err(e),
        };

        self.teardown().await;
        result
    }

    /// Three-step handshake: greeting, response, OK/ERR
    async fn handshake(&mut self) -> Result<(), SessionError> {
        let greeting =
            InitialHandshake::new(self.connection_id(), SERVER_VERSION, self.executor.status);
        let salt = greeting.auth_plugin_data();

        if let Err(e) = self.client.write_handshake_packet(greeting.encode()).await {
            let host = self
                .peer_addr
                .rsplit_once(':')
                .map(|(h, _)| h)
                .unwrap_or(&self.peer_addr);
            // load balancers probe liveness by connecting and hanging up
            if util::lookup_hostname(host).is_some_and(|name| name.contains("lvs")) {
                return Err(e.into());
            }
            warn!(conn_id = self.connection_id(), error = %e, "initial handshake write failed");
            return Err(e.into());
        }

        let payload = self.client.read_packet().await?;
        let response = HandshakeResponse::parse(&payload)
            .ok_or_else(|| SessionError::Protocol("invalid handshake response".into()))?;

        debug!(
            conn_id = self.connection_id(),
            user = %response.username,
            database = ?response.database,
            plugin = %response.auth_plugin_name,
            "received handshake response"
        );

        self.client.capability =
            capabilities::DEFAULT_CAPABILITIES & response.capability_flags;
        self.executor.set_client_capability(self.client.capability);

        self.authenticate(&response, &salt)
            .map_err(SessionError::Handshake)?;

        // admission happens after auth so the rejection names a namespace
        let ns = self
            .manager
            .get_namespace(&self.namespace)
            .ok_or_else(|| SessionError::Protocol("namespace vanished during handshake".into()))?;

        if let Some(ip) = self.peer_ip() {
            if !ns.is_client_ip_allowed(&ip) {
                let message = format!(
                    "[ns:{}, {}@{}/{}] ip not allowed to connect",
                    self.namespace, self.executor.user, self.peer_addr, self.executor.db
                );
                warn!("{}", message);
                return Err(SessionError::Handshake(SqlError::new(
                    error_codes::ER_ACCESS_DENIED_ERROR,
                    &message,
                )));
            }
        }

        if let Err(current) = self
            .manager
            .try_incr_connection_count(&self.namespace, ns.max_client_connections())
        {
            let message = format!(
                "[ns:{}, {}@{}/{}] too many connections, current:{}, max:{}",
                self.namespace,
                self.executor.user,
                self.peer_addr,
                self.executor.db,
                current,
                ns.max_client_connections()
            );
            warn!("{}", message);
            return Err(SessionError::Handshake(SqlError::new(
                error_codes::ER_CON_COUNT_ERROR,
                &message,
            )));
        }
        self.counted = true;

        self.client.write_ok(self.executor.status).await?;
        Ok(())
    }

    /// Verify credentials and bind the session to its namespace.
    /// The check order is a contract: existence, then scheme selection,
    /// then collation, db, and namespace resolution.
    fn authenticate(&mut self, response: &HandshakeResponse, salt: &[u8]) -> Result<(), SqlError> {
        let user = response.username.as_str();
        if !self.manager.check_user(user) {
            return Err(SqlError::access_denied(user, &self.peer_addr));
        }
        self.executor.user = user.to_string();

        let auth = response.auth_response.as_slice();
        let password = if response.auth_plugin_name.is_empty() {
            if auth.len() == 32 {
                self.manager.check_sha2_password(user, salt, auth)
            } else {
                self.manager
                    .check_hash_password(user, salt, auth)
                    .or_else(|| self.manager.check_password(user, salt, auth))
            }
        } else if response.auth_plugin_name == CACHING_SHA2_PASSWORD {
            self.manager.check_sha2_password(user, salt, auth)
        } else {
            self.manager.check_password(user, salt, auth)
        };

        let password =
            password.ok_or_else(|| SqlError::access_denied(user, &self.peer_addr))?;

        let collation_id = response.character_set as u16;
        let collation_name = crate::protocol::packet::collation_name(collation_id)
            .ok_or_else(|| SqlError::new(error_codes::ER_INTERNAL_ERROR, "invalid collation"))?;
        let charset = crate::protocol::packet::collation_charset(collation_name)
            .ok_or_else(|| SqlError::new(error_codes::ER_INTERNAL_ERROR, "invalid collation"))?;
        self.executor.collation_id = collation_id;
        self.executor.charset = charset.to_string();

        // db validity is checked lazily, on the first USE or query naming it
        self.executor.db = response.database.clone().unwrap_or_default();

        let namespace = self
            .manager
            .get_namespace_by_user(user, &password)
            .ok_or_else(|| SqlError::access_denied(user, &self.peer_addr))?;
        self.namespace = namespace.clone();
        self.executor.namespace = namespace;
        Ok(())
    }

    async fn command_loop(&mut self) -> Result<(), SessionError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }

            let ns = match self.manager.get_namespace(&self.namespace) {
                Some(ns) => ns,
                None => {
                    info!(conn_id = self.connection_id(), namespace = %self.namespace, "namespace removed, closing session");
                    return Ok(());
                }
            };
            self.executor.ns_change_index_old = ns.change_index();
            self.client.set_sequence(0);

            let payload = tokio::select! {
                _ = self.cancel.notified() => {
                    info!(conn_id = self.connection_id(), "session timed out");
                    return Ok(());
                }
                read = self.client.read_packet() => match read {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.maybe_clear_ks_conns().await;
                        if e.kind() == std::io::ErrorKind::UnexpectedEof {
                            info!(conn_id = self.connection_id(), "client disconnected");
                            return Ok(());
                        }
                        return Err(e.into());
                    }
                },
            };

            // re-arm the idle timer for the next read
            let closed = self.closed.clone();
            let cancel = self.cancel.clone();
            self.timeout_wheel
                .add(self.session_timeout, self.connection_id() as u64, move || {
                    closed.store(true, Ordering::Release);
                    cancel.notify_one();
                });

            self.manager.add_read_flow(&self.namespace, payload.len());
            self.maybe_clear_ks_conns().await;

            if payload.is_empty() {
                return Err(SessionError::Protocol("empty command packet".into()));
            }
            let cmd = Command::from(payload[0]);
            let data = payload.slice(1..);

            let response = self.exec_command(cmd, data).await;

            let must_close = match self.write_response(response).await {
                Ok(close) => close,
                Err(e) => {
                    warn!(conn_id = self.connection_id(), error = %e, "session write response error");
                    self.maybe_clear_ks_conns().await;
                    return Err(e.into());
                }
            };

            if cmd == Command::Quit || must_close || self.should_clear_ks_and_close() {
                return Ok(());
            }
        }
    }

    /// Keep-session reload rule: a swap outside a transaction drops the
    /// pinned conns so the next statement re-acquires on the new epoch.
    async fn maybe_clear_ks_conns(&mut self) {
        if !self.executor.has_ks_conns() || self.executor.is_in_transaction() {
            return;
        }
        let swapped = self
            .manager
            .get_namespace(&self.namespace)
            .map(|ns| ns.change_index() > self.executor.ns_change_index_old)
            .unwrap_or(true);
        if swapped {
            debug!(conn_id = self.connection_id(), "namespace swapped, dropping keep-session conns");
            self.executor.clear_ks_conns().await;
        }
    }

    /// A swap landing mid-transaction orphans the transaction; the session
    /// must be torn down.
    fn should_clear_ks_and_close(&self) -> bool {
        self.executor.is_keep_session()
            && self.executor.is_in_transaction()
            && self
                .manager
                .get_namespace(&self.namespace)
                .map(|ns| ns.change_index() > self.executor.ns_change_index_old)
                .unwrap_or(false)
    }

    async fn exec_command(&mut self, cmd: Command, data: Bytes) -> Response {
        if self.should_clear_ks_and_close() {
            return Response::Error {
                status: self.executor.status,
                error: ExecError::CloseWithResp(SqlError::tx_ns_changed()),
            };
        }

        match std::panic::AssertUnwindSafe(self.dispatch(cmd, data))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let backtrace = std::backtrace::Backtrace::force_capture();
                warn!(
                    conn_id = self.connection_id(),
                    panic = %message,
                    stack = %backtrace,
                    "command dispatch panicked"
                );
                Response::Error {
                    status: self.executor.status,
                    error: ExecError::CloseNoResp,
                }
            }
        }
    }

    async fn dispatch(&mut self, cmd: Command, data: Bytes) -> Response {
        let status = self.executor.status;
        match cmd {
            Command::Quit => {
                self.executor.handle_ks_quit().await;
                Response::Noop
            }
            Command::Query => {
                let sql = String::from_utf8_lossy(&data).to_string();
                self.handle_query_cmd(&sql).await
            }
            Command::InitDb => {
                let db = String::from_utf8_lossy(&data).trim().to_string();
                match self.executor.handle_use_db(&db) {
                    Ok(()) => Response::Ok(self.executor.status),
                    Err(error) => Response::Error { status, error },
                }
            }
            Command::Ping => {
                if self.executor.has_ks_conns() {
                    if let Err(error) = self.executor.handle_ks_ping().await {
                        return Response::Error { status, error };
                    }
                }
                Response::Ok(self.executor.status)
            }
            Command::FieldList => match self.executor.handle_field_list(&data).await {
                Ok(fields) => Response::FieldList {
                    status: self.executor.status,
                    fields,
                },
                Err(error) => Response::Error { status, error },
            },
            Command::StmtPrepare => {
                let sql = String::from_utf8_lossy(&data).to_string();
                match self.executor.handle_stmt_prepare(&sql) {
                    Ok((stmt_id, param_count)) => Response::Prepare {
                        status: self.executor.status,
                        stmt_id,
                        param_count,
                    },
                    Err(error) => Response::Error { status, error },
                }
            }
            Command::StmtExecute => match self.executor.handle_stmt_execute(&data).await {
                Ok(result) => Response::Result {
                    status: self.executor.status,
                    result,
                    binary: true,
                },
                Err(error) => Response::Error {
                    status: self.executor.status,
                    error,
                },
            },
            Command::StmtClose => {
                self.executor.handle_stmt_close(&data);
                Response::Noop
            }
            Command::StmtReset => match self.executor.handle_stmt_reset(&data) {
                Ok(()) => Response::Ok(self.executor.status),
                Err(error) => Response::Error { status, error },
            },
            Command::StmtSendLongData => {
                self.executor.handle_stmt_send_long_data(&data);
                Response::Noop
            }
            Command::SetOption => Response::Eof(self.executor.status),
            other => Response::Error {
                status,
                error: ExecError::sql(
                    error_codes::ER_UNKNOWN_ERROR,
                    &format!("command {:?} not supported", other),
                ),
            },
        }
    }

    /// COM_QUERY: QPS gate, optional multi-statement split, per-piece
    /// execution with MORE_RESULTS on everything but the last.
    async fn handle_query_cmd(&mut self, sql: &str) -> Response {
        let status = self.executor.status;
        let ns = match self.executor.get_namespace() {
            Ok(ns) => ns,
            Err(error) => return Response::Error { status, error },
        };

        if let Err(error) = self.executor.check_qps(&ns) {
            return Response::Error { status, error };
        }

        let multi = ns.support_multi_query()
            && self.client.capability & capabilities::CLIENT_MULTI_STATEMENTS != 0;
        let pieces: Vec<String> = if multi {
            crate::parser::split_statements(sql)
                .into_iter()
                .map(str::to_string)
                .collect()
        } else {
            vec![sql.to_string()]
        };

        let Some((last, init)) = pieces.split_last() else {
            return Response::Ok(self.executor.status);
        };

        for piece in init {
            match self.executor.handle_query(piece).await {
                Ok(result) => {
                    let response = Response::Result {
                        status: self.executor.status | SERVER_MORE_RESULTS_EXISTS,
                        result,
                        binary: false,
                    };
                    match self.write_response(response).await {
                        Ok(false) => {}
                        _ => {
                            return Response::Error {
                                status: self.executor.status,
                                error: ExecError::CloseNoResp,
                            }
                        }
                    }
                }
                Err(error) => {
                    return Response::Error {
                        status: self.executor.status,
                        error,
                    }
                }
            }
        }

        match self.executor.handle_query(last).await {
            Ok(result) => Response::Result {
                status: self.executor.status,
                result,
                binary: false,
            },
            Err(error) => Response::Error {
                status: self.executor.status,
                error,
            },
        }
    }

    /// Write one response envelope. Returns whether the session must close.
    /// A streamed cursor's connection is always handed back to the
    /// executor, whatever the write outcome.
    async fn write_response(&mut self, response: Response) -> Result<bool, std::io::Error> {
        let mut cont = self.executor.take_continue_conn();

        let (write_result, close) = match response {
            Response::Ok(status) => (self.client.write_ok(status).await, false),
            Response::Eof(status) => (self.client.write_eof(status).await, false),
            Response::Result {
                status,
                result,
                binary,
            } => match result {
                None => (self.client.write_ok(status).await, false),
                Some(result) => match cont.as_mut() {
                    Some(cont) => {
                        let max_result_size = self
                            .manager
                            .get_namespace(&self.namespace)
                            .map(|ns| ns.max_result_size())
                            .unwrap_or(16 * 1024 * 1024);
                        (
                            self.client
                                .write_result_stream(
                                    status,
                                    &result,
                                    &mut cont.conn,
                                    max_result_size,
                                    binary,
                                )
                                .await,
                            false,
                        )
                    }
                    None => (
                        self.client.write_result_set(status, &result, binary).await,
                        false,
                    ),
                },
            },
            Response::Prepare {
                status,
                stmt_id,
                param_count,
            } => (
                self.client.write_prepare(status, stmt_id, 0, param_count).await,
                false,
            ),
            Response::FieldList { status, fields } => {
                (self.client.write_field_list(status, &fields).await, false)
            }
            Response::Error { status: _, error } => match error {
                ExecError::Sql(err) => (self.client.write_error(&err).await, false),
                ExecError::CloseWithResp(err) => (self.client.write_error(&err).await, true),
                ExecError::CloseNoResp => (Ok(()), true),
            },
            Response::Noop => (Ok(()), false),
        };

        self.executor.recycle_continue(cont).await;

        let written = self.client.take_written();
        if written > 0 {
            crate::metrics::metrics().add_write_flow(
                self.manager.cluster(),
                &self.namespace,
                written as u64,
            );
        }

        write_result.map(|_| close)
    }

    /// Idempotent teardown: roll back, drop pinned conns, release the
    /// connection-cap slot and close the socket.
    async fn teardown(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.timeout_wheel.remove(self.connection_id() as u64);

        self.executor.rollback_on_close().await;
        self.executor.handle_ks_quit().await;

        if self.counted {
            self.manager.decr_connection_count(&self.namespace);
            self.counted = false;
        }

        self.client.shutdown().await;
        debug!(conn_id = self.connection_id(), "session closed");
    }
}
