//! Destination-IP demultiplexer.
//!
//! A single task owns the TUN read loop: parse the destination address,
//! look up the route table, hand the packet to that session's bounded
//! downlink queue and keep going. A slow peer loses its own packets when
//! its queue fills; it never stalls the loop or other peers. Per
//! destination address, packets reach the target session in TUN arrival
//! order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use qvpn_core::buffer::PacketPool;
use qvpn_core::error::{Error, Result};
use qvpn_core::packet;
use qvpn_core::tun::TunPort;

use crate::routes::{DeliverError, RouteTable};

/// Demultiplexer drop and delivery counters.
#[derive(Debug, Default)]
pub struct DemuxStats {
    pub delivered: AtomicU64,
    /// Packets whose destination had no route entry.
    pub no_route_drops: AtomicU64,
    /// Packets from the kernel that failed header parsing.
    pub malformed_drops: AtomicU64,
    /// Packets dropped because the target session's queue was full.
    pub queue_full_drops: AtomicU64,
}

impl DemuxStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// The single reader of the TUN device.
pub struct Demultiplexer<T: TunPort> {
    tun: Arc<T>,
    routes: Arc<RouteTable>,
    pool: PacketPool,
    stats: Arc<DemuxStats>,
    cancel: CancellationToken,
}

impl<T: TunPort> Demultiplexer<T> {
    pub fn new(
        tun: Arc<T>,
        routes: Arc<RouteTable>,
        pool: PacketPool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tun,
            routes,
            pool,
            stats: Arc::new(DemuxStats::default()),
            cancel,
        }
    }

    pub fn stats(&self) -> Arc<DemuxStats> {
        Arc::clone(&self.stats)
    }

    /// Run the read loop until cancellation or device failure.
    pub async fn run(self) -> Result<()> {
        info!(tun = %self.tun.name(), "Demultiplexer running");

        loop {
            // Pool exhaustion parks the loop: backpressure, not an error
            let mut buf = tokio::select! {
                _ = self.cancel.cancelled() => break,
                buf = self.pool.acquire() => buf,
            };

            let n = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = self.tun.read_packet(buf.as_mut_slice()) => match read {
                    Ok(n) => n,
                    Err(e) => {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        error!(error = %e, "TUN read failed, stopping demultiplexer");
                        return Err(Error::Tun {
                            message: e.to_string(),
                        });
                    }
                },
            };
            buf.set_len(n);

            let dst = match packet::destination(buf.packet()) {
                Ok(dst) => dst,
                Err(e) => {
                    DemuxStats::bump(&self.stats.malformed_drops);
                    debug!(error = %e, "Dropping malformed packet from TUN");
                    continue;
                }
            };

            let Some(handle) = self.routes.lookup(dst) else {
                DemuxStats::bump(&self.stats.no_route_drops);
                trace!(dst = %dst, "No route for destination, dropping");
                continue;
            };

            match handle.try_deliver(buf) {
                Ok(()) => DemuxStats::bump(&self.stats.delivered),
                Err(DeliverError::QueueFull) => {
                    DemuxStats::bump(&self.stats.queue_full_drops);
                    debug!(dst = %dst, peer = %handle.peer_id(), "Downlink queue full, dropping");
                }
                Err(DeliverError::Closed) => {
                    DemuxStats::bump(&self.stats.no_route_drops);
                    trace!(dst = %dst, peer = %handle.peer_id(), "Session closing, dropping");
                }
            }
        }

        info!("Demultiplexer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::SessionHandle;
    use qvpn_core::PeerId;
    use qvpn_test_utils::packets::ipv4_packet;
    use qvpn_test_utils::FakeTun;
    use std::time::{Duration, SystemTime};
    use tokio::sync::mpsc;

    struct Harness {
        tun: FakeTun,
        routes: Arc<RouteTable>,
        stats: Arc<DemuxStats>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn start() -> Harness {
        let tun = FakeTun::default_v4();
        let routes = Arc::new(RouteTable::new());
        let pool = PacketPool::new(8, 1500);
        let cancel = CancellationToken::new();
        let demux = Demultiplexer::new(
            Arc::new(tun.clone()),
            Arc::clone(&routes),
            pool,
            cancel.clone(),
        );
        let stats = demux.stats();
        let task = tokio::spawn(demux.run());
        Harness {
            tun,
            routes,
            stats,
            cancel,
            task,
        }
    }

    fn route(
        harness: &Harness,
        peer: &str,
        addr: &str,
        depth: usize,
    ) -> mpsc::Receiver<qvpn_core::buffer::PooledBuf> {
        let (tx, rx) = mpsc::channel(depth);
        harness
            .routes
            .insert(
                addr.parse().unwrap(),
                SessionHandle::new(PeerId::from(peer), SystemTime::now(), tx),
            )
            .unwrap();
        rx
    }

    async fn eventually(stats: &Arc<DemuxStats>, counter: impl Fn(&DemuxStats) -> u64, want: u64) {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if counter(stats) >= want {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("counter did not reach expected value");
    }

    #[tokio::test]
    async fn routes_packet_to_session_by_destination() {
        let harness = start();
        let mut rx_a = route(&harness, "a", "10.0.0.2", 4);
        let mut rx_b = route(&harness, "b", "10.0.0.3", 4);

        harness.tun.inject_packet(ipv4_packet(
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
            b"a-to-b",
        ));

        let buf = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        let header = qvpn_core::packet::IpHeader::parse(buf.packet()).unwrap();
        assert_eq!(header.src, "10.0.0.2".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(header.dst, "10.0.0.3".parse::<std::net::IpAddr>().unwrap());
        assert!(rx_a.try_recv().is_err());

        harness.cancel.cancel();
        harness.tun.close();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unroutable_packet_increments_counter() {
        let harness = start();
        let _rx = route(&harness, "a", "10.0.0.2", 4);

        harness.tun.inject_packet(ipv4_packet(
            "10.0.0.2".parse().unwrap(),
            "10.0.0.99".parse().unwrap(),
            b"nowhere",
        ));

        eventually(&harness.stats, |s| DemuxStats::get(&s.no_route_drops), 1).await;
        assert_eq!(DemuxStats::get(&harness.stats.delivered), 0);

        harness.cancel.cancel();
        harness.tun.close();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_packet_increments_counter() {
        let harness = start();
        harness.tun.inject_packet(vec![0xff, 0x00, 0x01]);

        eventually(&harness.stats, |s| DemuxStats::get(&s.malformed_drops), 1).await;

        harness.cancel.cancel();
        harness.tun.close();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_peer_drops_do_not_stall_others() {
        let harness = start();
        // Peer a has a queue of 1 and nobody draining it
        let _rx_a = route(&harness, "a", "10.0.0.2", 1);
        let mut rx_b = route(&harness, "b", "10.0.0.3", 4);

        // Fill a's queue, then overflow it
        for _ in 0..3 {
            harness.tun.inject_packet(ipv4_packet(
                "10.0.0.9".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                b"to-a",
            ));
        }
        harness.tun.inject_packet(ipv4_packet(
            "10.0.0.9".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
            b"to-b",
        ));

        // b still receives despite a's queue overflowing
        let buf = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            qvpn_core::packet::destination(buf.packet()).unwrap(),
            "10.0.0.3".parse::<std::net::IpAddr>().unwrap()
        );
        assert!(DemuxStats::get(&harness.stats.queue_full_drops) >= 1);

        harness.cancel.cancel();
        harness.tun.close();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn preserves_per_destination_order() {
        let harness = start();
        let mut rx = route(&harness, "a", "10.0.0.2", 16);

        for i in 0..10u8 {
            harness.tun.inject_packet(ipv4_packet(
                "10.0.0.9".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                &[i],
            ));
        }

        for i in 0..10u8 {
            let buf = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(buf.packet()[20], i);
        }

        harness.cancel.cancel();
        harness.tun.close();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_stops_loop() {
        let harness = start();
        harness.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn device_failure_surfaces_as_error() {
        let harness = start();
        harness.tun.close();
        let result = tokio::time::timeout(Duration::from_secs(1), harness.task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }
}
