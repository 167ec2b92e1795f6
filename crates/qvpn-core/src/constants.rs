//! Protocol and configuration constants for qvpn.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// ALPN identifier for QUIC connections (HTTP/3 family).
pub const ALPN: &[u8] = b"h3";

/// URI template path answered by the concentrator.
pub const CONNECT_PATH: &str = "/vpn";

/// HTTP datagram context ID used for IP payloads.
pub const CONTEXT_ID_IP: u64 = 0;

/// Maximum encoded capsule size accepted on the signalling stream.
pub const MAX_CAPSULE_SIZE: usize = 64 * 1024;

/// Maximum length accepted for a connect request field.
pub const MAX_REQUEST_FIELD: usize = 1024;

// =============================================================================
// Timing Constants
// =============================================================================

/// Deadline for handshake, address assignment and route advertisement.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// QUIC idle timeout.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// QUIC keep-alive interval.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Datapath Constants
// =============================================================================

/// Default TUN MTU.
pub const DEFAULT_MTU: u16 = 1400;

/// Minimum accepted MTU (IPv4 minimum).
pub const MIN_MTU: u16 = 576;

/// Maximum accepted MTU (jumbo frames).
pub const MAX_MTU: u16 = 9000;

/// Number of MTU-sized buffers in the shared packet pool.
pub const PACKET_POOL_SIZE: usize = 256;

/// Depth of each session's bounded downlink queue.
pub const DOWNLINK_QUEUE_DEPTH: usize = 64;

/// Depth of each session's bounded uplink queue.
pub const UPLINK_QUEUE_DEPTH: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_bounds_are_ordered() {
        assert!(MIN_MTU < DEFAULT_MTU);
        assert!(DEFAULT_MTU < MAX_MTU);
    }

    #[test]
    fn handshake_deadline_is_ten_seconds() {
        assert_eq!(HANDSHAKE_TIMEOUT, Duration::from_secs(10));
    }

    #[test]
    fn keep_alive_below_idle_timeout() {
        assert!(KEEP_ALIVE_INTERVAL < IDLE_TIMEOUT);
    }
}
