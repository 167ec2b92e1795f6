//! TUN port abstraction.
//!
//! The concentrator reads and writes complete Layer-3 packets through a
//! kernel TUN interface. The port hides platform quirks: where a driver
//! carries a fixed-size header prefix in front of each packet (e.g. a
//! 10-byte virtio-net header), the port strips it on read and prepends it
//! on write, so callers always see bare IP packets.

#[cfg(target_os = "linux")]
mod tun_linux;

#[cfg(target_os = "linux")]
pub use tun_linux::LinuxTun;

use std::future::Future;
use std::io;

/// A Layer-3 virtual interface.
///
/// `read_packet` is called by a single reader (the demultiplexer);
/// `write_packet` may be called concurrently from many tasks and must
/// serialise internally if the underlying device is single-writer.
pub trait TunPort: Send + Sync + 'static {
    /// Read one IP packet into `buf`, blocking until one is available.
    ///
    /// The packet starts at `buf[0]` with no link-layer header; the byte
    /// length is returned. Fails only on device closure or an unrecoverable
    /// driver error.
    fn read_packet(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Deliver one IP packet to the kernel.
    fn write_packet(&self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Interface MTU.
    fn mtu(&self) -> u16;

    /// Interface name.
    fn name(&self) -> &str;

    /// Fixed-size driver header prefix, in bytes (0 when none applies).
    ///
    /// Read buffers must be at least `mtu() + header_offset()` bytes.
    fn header_offset(&self) -> usize {
        0
    }
}
