//! Wire-level integration tests. Sessions run over in-memory duplex pipes
//! against a scripted MySQL backend on a local TCP port, so the full
//! handshake/exec/response path is exercised without an external server.

mod harness;
mod limiter;
mod multi;
mod prepared;
mod reload;
mod session;
