//! qvpn-server: the CONNECT-IP concentrator.
//!
//! Modules:
//! - `config`: TOML configuration
//! - `pool`: address allocator keyed by peer identity
//! - `routes`: destination address to session map
//! - `acl`: access-control evaluator with per-session snapshots
//! - `session` / `registry`: session lifecycle and coordination
//! - `acceptor`: QUIC listener, client certificate auth, CONNECT-IP setup
//! - `demux`: TUN read loop and destination demultiplexer
//! - `control`: the bridge exposed to admin code
//! - `server`: process supervisor (Linux)

pub mod acceptor;
pub mod acl;
pub mod cli;
pub mod config;
pub mod control;
pub mod demux;
pub mod pool;
pub mod registry;
pub mod routes;
pub mod session;
pub mod tls;

#[cfg(target_os = "linux")]
pub mod server;
