//! Linux TUN device wrapper.
//!
//! Requires elevated privileges (CAP_NET_ADMIN) to create TUN devices.

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::process::Command;

use ipnet::IpNet;
use tokio::sync::Mutex;
use tun::{AbstractDevice, AsyncDevice, Configuration};

use super::TunPort;

/// Linux TUN device.
///
/// Wraps the `tun` crate's AsyncDevice behind the [`TunPort`] contract.
pub struct LinuxTun {
    device: AsyncDevice,
    /// Serialises writes; the character device is single-writer.
    write_lock: Mutex<()>,
    name: String,
    local_ip: IpNet,
    mtu: u16,
    header_offset: usize,
}

impl LinuxTun {
    /// Create a TUN device named `name` (empty = system-assigned), assign it
    /// `ip` and bring it up.
    pub async fn create(name: &str, ip: IpNet, mtu: u16) -> io::Result<Self> {
        Self::create_with_offset(name, ip, mtu, 0).await
    }

    /// Like [`LinuxTun::create`], for drivers that prefix every packet with
    /// `header_offset` header bytes.
    pub async fn create_with_offset(
        name: &str,
        ip: IpNet,
        mtu: u16,
        header_offset: usize,
    ) -> io::Result<Self> {
        let mut config = Configuration::default();

        if !name.is_empty() {
            config.tun_name(name);
        }

        config.address(ip.addr());
        config.netmask(prefix_to_netmask(ip.prefix_len(), ip.addr().is_ipv4()));
        config.mtu(mtu);
        config.up();

        let device = tun::create_as_async(&config)
            .map_err(|e| io::Error::other(format!("failed to create tun device: {}", e)))?;

        let actual_name = device
            .tun_name()
            .map_err(|e| io::Error::other(format!("failed to get tun name: {}", e)))?;

        Ok(Self {
            device,
            write_lock: Mutex::new(()),
            name: actual_name,
            local_ip: ip,
            mtu,
            header_offset,
        })
    }

    /// The address assigned to the interface.
    pub fn local_ip(&self) -> IpNet {
        self.local_ip
    }

    /// Route `destination` through this interface.
    ///
    /// Idempotent: replacing an existing identical route is not an error.
    pub fn add_route(&self, destination: IpNet) -> io::Result<()> {
        let status = Command::new("ip")
            .args([
                "route",
                "replace",
                &destination.to_string(),
                "dev",
                &self.name,
            ])
            .status()?;

        if !status.success() {
            return Err(io::Error::other(format!(
                "failed to add route {} via {}",
                destination, self.name
            )));
        }

        Ok(())
    }

    /// Remove a route from this interface.
    pub fn remove_route(&self, destination: IpNet) -> io::Result<()> {
        let status = Command::new("ip")
            .args(["route", "del", &destination.to_string(), "dev", &self.name])
            .status()?;

        if !status.success() {
            return Err(io::Error::other(format!(
                "failed to remove route {} via {}",
                destination, self.name
            )));
        }

        Ok(())
    }
}

impl TunPort for LinuxTun {
    fn read_packet(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            loop {
                let n = self.device.recv(buf).await?;
                if n <= self.header_offset {
                    // Header-only or empty read, nothing to deliver
                    continue;
                }
                if self.header_offset > 0 {
                    buf.copy_within(self.header_offset..n, 0);
                }
                return Ok(n - self.header_offset);
            }
        }
    }

    fn write_packet(&self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            let _guard = self.write_lock.lock().await;
            if self.header_offset == 0 {
                self.device.send(packet).await?;
            } else {
                let mut framed = vec![0u8; self.header_offset + packet.len()];
                framed[self.header_offset..].copy_from_slice(packet);
                self.device.send(&framed).await?;
            }
            Ok(())
        }
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn header_offset(&self) -> usize {
        self.header_offset
    }
}

/// Convert a prefix length to a netmask address.
fn prefix_to_netmask(prefix_len: u8, is_ipv4: bool) -> IpAddr {
    if is_ipv4 {
        let mask = if prefix_len == 0 {
            0
        } else if prefix_len >= 32 {
            u32::MAX
        } else {
            u32::MAX << (32 - prefix_len)
        };
        IpAddr::V4(std::net::Ipv4Addr::from(mask))
    } else {
        let mask = if prefix_len == 0 {
            0
        } else if prefix_len >= 128 {
            u128::MAX
        } else {
            u128::MAX << (128 - prefix_len)
        };
        IpAddr::V6(std::net::Ipv6Addr::from(mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_to_netmask_ipv4() {
        let mask = prefix_to_netmask(24, true);
        assert_eq!(mask, IpAddr::V4(std::net::Ipv4Addr::new(255, 255, 255, 0)));

        let mask = prefix_to_netmask(16, true);
        assert_eq!(mask, IpAddr::V4(std::net::Ipv4Addr::new(255, 255, 0, 0)));

        let mask = prefix_to_netmask(32, true);
        assert_eq!(
            mask,
            IpAddr::V4(std::net::Ipv4Addr::new(255, 255, 255, 255))
        );

        let mask = prefix_to_netmask(0, true);
        assert_eq!(mask, IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)));
    }

    #[test]
    fn test_prefix_to_netmask_ipv6() {
        let mask = prefix_to_netmask(64, false);
        assert_eq!(
            mask,
            IpAddr::V6(std::net::Ipv6Addr::new(
                0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0
            ))
        );
    }

    // Note: actual TUN device tests require elevated privileges.

    #[test]
    #[ignore = "requires root privileges"]
    fn test_create_tun_device() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ip: IpNet = "10.0.0.1/24".parse().unwrap();
            let result = LinuxTun::create("qvpn-test0", ip, 1400).await;
            if let Err(e) = result {
                eprintln!("Expected to fail without root: {}", e);
            }
        });
    }
}
