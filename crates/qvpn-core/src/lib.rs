//! qvpn-core: Shared library for the qvpn CONNECT-IP concentrator.
//!
//! This crate provides:
//! - Error types and logging setup
//! - VPN network math (gateway derivation, allocatable range)
//! - IP header parsing and ICMP reject replies
//! - CONNECT-IP capsule and datagram codec
//! - Bounded packet buffer pool
//! - TUN port abstraction (Linux implementation behind `cfg(target_os)`)

pub mod buffer;
pub mod constants;
pub mod error;
pub mod logging;
pub mod net;
pub mod packet;
pub mod proto;
pub mod tun;
pub mod types;

pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
pub use types::{GroupId, PeerId};
