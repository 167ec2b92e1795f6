//! Fake TUN port for testing.
//!
//! An in-memory [`TunPort`] implementation: packets "from the kernel" are
//! injected and become readable, packets written by the code under test are
//! queued for inspection.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use qvpn_core::tun::TunPort;

struct FakeTunInner {
    /// Packets waiting to be read (as if received from the network).
    incoming: Mutex<VecDeque<Vec<u8>>>,
    incoming_notify: Notify,
    /// Packets written by the code under test.
    outgoing: Mutex<VecDeque<Vec<u8>>>,
    outgoing_notify: Notify,
    closed: AtomicBool,
}

/// Fake TUN port; clones share state.
#[derive(Clone)]
pub struct FakeTun {
    name: String,
    mtu: u16,
    header_offset: usize,
    inner: Arc<FakeTunInner>,
}

impl FakeTun {
    pub fn new(name: &str, mtu: u16) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            header_offset: 0,
            inner: Arc::new(FakeTunInner {
                incoming: Mutex::new(VecDeque::new()),
                incoming_notify: Notify::new(),
                outgoing: Mutex::new(VecDeque::new()),
                outgoing_notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create with default settings.
    pub fn default_v4() -> Self {
        Self::new("tun0", 1400)
    }

    /// Inject a packet as if received from the network.
    pub fn inject_packet(&self, packet: Vec<u8>) {
        self.inner
            .incoming
            .lock()
            .expect("fake tun lock poisoned")
            .push_back(packet);
        self.inner.incoming_notify.notify_one();
    }

    /// Take the next packet that was written to the device, if any.
    pub fn take_outgoing(&self) -> Option<Vec<u8>> {
        self.inner
            .outgoing
            .lock()
            .expect("fake tun lock poisoned")
            .pop_front()
    }

    /// Wait for the next packet written to the device.
    pub async fn next_outgoing(&self) -> Vec<u8> {
        loop {
            let notified = self.inner.outgoing_notify.notified();
            if let Some(packet) = self.take_outgoing() {
                return packet;
            }
            notified.await;
        }
    }

    /// Number of packets written and not yet taken.
    pub fn outgoing_count(&self) -> usize {
        self.inner
            .outgoing
            .lock()
            .expect("fake tun lock poisoned")
            .len()
    }

    /// Close the device: reads and writes fail from now on.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.incoming_notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl TunPort for FakeTun {
    fn read_packet(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            loop {
                if self.is_closed() {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
                }
                let notified = self.inner.incoming_notify.notified();
                let next = self
                    .inner
                    .incoming
                    .lock()
                    .expect("fake tun lock poisoned")
                    .pop_front();
                if let Some(packet) = next {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    return Ok(n);
                }
                notified.await;
            }
        }
    }

    fn write_packet(&self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device closed"));
            }
            if packet.len() > self.mtu as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("packet too large: {} > {}", packet.len(), self.mtu),
                ));
            }
            self.inner
                .outgoing
                .lock()
                .expect("fake tun lock poisoned")
                .push_back(packet.to_vec());
            self.inner.outgoing_notify.notify_one();
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
