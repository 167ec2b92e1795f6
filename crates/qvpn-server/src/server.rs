//! Process supervisor.
//!
//! Assembles the datapath graph (TUN, pool, routes, ACL, acceptor,
//! demultiplexer, control bridge), serves until SIGINT/SIGTERM, then stops
//! accepting, cancels every session and waits for all finalisers before
//! returning.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use qvpn_core::buffer::PacketPool;
use qvpn_core::constants::PACKET_POOL_SIZE;
use qvpn_core::error::{Error, Result};
use qvpn_core::net::NetworkInfo;
use qvpn_core::tun::{LinuxTun, TunPort};

use crate::acceptor::Acceptor;
use crate::acl::AccessController;
use crate::config::ServerConfig;
use crate::control::ControlBridge;
use crate::demux::Demultiplexer;
use crate::registry::SessionRegistry;

/// Interval of the session-count status line.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Run the concentrator until a termination signal.
pub async fn run(config: ServerConfig) -> Result<()> {
    let net = NetworkInfo::new(config.assign_cidr)?;
    info!(
        network = %net.prefix(),
        gateway = %net.gateway(),
        routes = config.advertise_routes.len(),
        "VPN network configured"
    );

    let tun = LinuxTun::create(&config.tun_name, net.gateway_net(), config.mtu)
        .await
        .map_err(|e| Error::Tun {
            message: format!("create TUN device: {e}"),
        })?;
    // Steer the advertised prefixes into the tunnel; transport setup
    // failures are fatal
    for route in &config.advertise_routes {
        tun.add_route(*route).map_err(|e| Error::Tun {
            message: format!("install route {route}: {e}"),
        })?;
    }
    let tun = Arc::new(tun);
    info!(tun = %tun.name(), addr = %tun.local_ip(), mtu = config.mtu, "TUN device ready");

    let cancel = CancellationToken::new();
    let acl = Arc::new(AccessController::from_config(&config.acl));
    let registry = Arc::new(SessionRegistry::new(
        net,
        Arc::clone(&acl),
        &config.advertise_routes,
        cancel.child_token(),
    ));
    let pool = PacketPool::new(
        PACKET_POOL_SIZE,
        config.mtu as usize + tun.header_offset(),
    );

    let demux = Demultiplexer::new(
        Arc::clone(&tun),
        registry.routes(),
        pool.clone(),
        cancel.child_token(),
    );
    let acceptor = Acceptor::bind(
        &config,
        Arc::clone(&registry),
        Arc::clone(&tun),
        pool,
        cancel.child_token(),
    )?;

    // The admin collaborator drives the concentrator through this bridge
    // and nothing else
    let control = ControlBridge::new(Arc::clone(&registry), acl);

    let mut demux_task = tokio::spawn(demux.run());
    let mut acceptor_task = tokio::spawn(acceptor.run());
    let status_task = tokio::spawn(status_loop(control, cancel.child_token()));

    let mut demux_done = false;
    let mut acceptor_done = false;
    let mut first_error = None;

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Termination signal received, draining");
        }
        result = &mut demux_task => {
            demux_done = true;
            first_error = join_outcome("demultiplexer", result);
        }
        result = &mut acceptor_task => {
            acceptor_done = true;
            first_error = join_outcome("acceptor", result);
        }
    }

    // Stop accepts, cancel sessions, then wait for every finaliser
    cancel.cancel();
    registry.drain_all();
    if !acceptor_done {
        if let Some(e) = join_outcome("acceptor", acceptor_task.await) {
            first_error.get_or_insert(e);
        }
    }
    if !demux_done {
        if let Some(e) = join_outcome("demultiplexer", demux_task.await) {
            first_error.get_or_insert(e);
        }
    }
    let _ = status_task.await;

    // The device disappears with the process; route removal is best-effort
    // cleanup for the interval in between
    for route in &config.advertise_routes {
        if let Err(e) = tun.remove_route(*route) {
            debug!(route = %route, error = %e, "Route removal at shutdown failed");
        }
    }

    if !registry.is_empty() {
        warn!(remaining = registry.len(), "Sessions left after drain");
    }

    match first_error {
        None => {
            info!("Concentrator exited");
            Ok(())
        }
        Some(e) => Err(e),
    }
}

/// Normalise a task join result, logging failures.
fn join_outcome(
    name: &str,
    result: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Option<Error> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            error!(task = name, error = %e, "Task failed");
            Some(e)
        }
        Err(e) => {
            error!(task = name, error = %e, "Task panicked");
            Some(Error::Internal {
                message: format!("{name} panicked: {e}"),
            })
        }
    }
}

/// Periodic status line for operators.
async fn status_loop(control: ControlBridge, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                info!(sessions = control.list_sessions().len(), "Status");
            }
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "Cannot install SIGTERM handler, using SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
