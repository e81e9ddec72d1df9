use std::{net::SocketAddr, sync::Arc};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{net::TcpListener, signal::unix::SignalKind};
use tokio_util::sync::CancellationToken;

use crate::graceful::GracefulListener;

pub type TcpGracefulListener = GracefulListener<TcpListener>;

/// What the program gets to work with.
#[derive(Clone)]
pub struct State {
    enabled: bool,
    addresses: Vec<String>,
    listeners: Vec<Arc<TcpGracefulListener>>,
    shutdown: CancellationToken,
    bin_id: Option<String>,
    worker_id: Option<u64>,
    restarter: Restarter,
}

impl State {
    pub(crate) fn worker(
        addresses: Vec<String>,
        listeners: Vec<Arc<TcpGracefulListener>>,
        shutdown: CancellationToken,
        bin_id: String,
        worker_id: u64,
        restarter: Restarter,
    ) -> Self {
        Self {
            enabled: true,
            addresses,
            listeners,
            shutdown,
            bin_id: Some(bin_id),
            worker_id: Some(worker_id),
            restarter,
        }
    }

    /// Program running in-process without a supervisor.
    pub(crate) fn disabled(addresses: Vec<String>, listeners: Vec<Arc<TcpGracefulListener>>) -> Self {
        Self {
            enabled: false,
            addresses,
            listeners,
            shutdown: CancellationToken::new(),
            bin_id: None,
            worker_id: None,
            restarter: Restarter::Unavailable,
        }
    }

    /// False when the program runs in-process as a fallback; restarts and upgrades are off.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Listeners in configured address order.
    pub fn listeners(&self) -> &[Arc<TcpGracefulListener>] {
        &self.listeners
    }

    pub fn listener(&self) -> Option<&Arc<TcpGracefulListener>> {
        self.listeners.first()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn local_addrs(&self) -> Vec<Option<SocketAddr>> {
        self.listeners.iter().map(|l| l.local_addr()).collect()
    }

    /// Cancelled when this worker starts draining.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn graceful_shutdown(&self) {
        self.shutdown.cancelled().await
    }

    pub fn bin_id(&self) -> Option<&str> {
        self.bin_id.as_deref()
    }

    pub fn worker_id(&self) -> Option<u64> {
        self.worker_id
    }

    /// Ask the supervisor for a graceful restart. With restarts disabled this shuts down instead;
    /// without a supervisor it does nothing.
    pub fn restart(&self) {
        self.restarter.restart()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Restarter {
    Supervisor { pid: Pid, signal: SignalKind },
    Unavailable,
}

impl Restarter {
    fn restart(&self) {
        match self {
            Self::Supervisor { pid, signal } => {
                let signal = match Signal::try_from(signal.as_raw_value()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        log::error!("Cannot request restart with signal {signal:?}: {e}");
                        return;
                    }
                };
                if let Err(e) = kill(*pid, Some(signal)) {
                    log::error!("Cannot signal supervisor {pid} for restart: {e}");
                }
            }
            Self::Unavailable => log::warn!("Restart requested but no supervisor is running"),
        }
    }
}
