#![doc = include_str!("../README.md")]

#[cfg(not(unix))]
compile_error!("moult relies on fork/exec and descriptor inheritance and only supports unix targets");

/// Lifecycle message: `info` when the configuration asks for debug output, `debug` otherwise.
macro_rules! debugf {
    ($settings:expr, $($arg:tt)+) => {
        if $settings.debug {
            log::info!($($arg)+)
        } else {
            log::debug!($($arg)+)
        }
    };
}

/// Lifecycle warning, silenced by `no_warn` unless debug output is on.
macro_rules! warnf {
    ($settings:expr, $($arg:tt)+) => {
        if $settings.debug || !$settings.no_warn {
            log::warn!($($arg)+)
        }
    };
}

mod config;
mod fetcher;
mod graceful;
mod handshake;
mod installer;
mod listener;
mod registry;
mod state;
mod supervisor;
mod upgrade;
mod utils;
mod worker;

use std::{io, io::Write, process::exit, sync::Arc};

use tokio::net::TcpListener;

use config::{Program, Settings};
use registry::ListenerRegistry;
use supervisor::{Supervisor, SupervisorError};
use utils::ENV_BIN_CHECK;
use worker::Worker;

// reexports
pub use crate::{
    config::{
        BoxError, Config, ConfigError, PreUpgrade, DEFAULT_CRASH_RESPAWN_LIMIT,
        DEFAULT_MIN_FETCH_INTERVAL, DEFAULT_SANITY_CHECK_TIMEOUT, DEFAULT_TERMINATE_TIMEOUT,
    },
    fetcher::{FetchError, Fetcher, FileFetcher},
    graceful::{GracefulConn, GracefulListener, Ticket, WaitGroup},
    handshake::{HandshakeError, ProcessDescriptor},
    installer::{BinaryInstaller, PosixInstaller},
    listener::{Listener, Severer, KEEPALIVE_PERIOD},
    state::{State, TcpGracefulListener},
    upgrade::{binary_id, UpgradeError, UpgradeRecord},
    utils::RESTART_EXIT_CODE,
};
pub use tokio::signal::unix::SignalKind;

#[derive(derive_more::From, derive_more::Display, Debug)]
#[display("{_variant}")]
pub enum Error {
    #[display("invalid configuration: {}", _0)]
    #[from]
    Config(ConfigError),

    #[display("bad handshake from parent process: {}", _0)]
    #[from]
    Handshake(HandshakeError),

    #[display("failed to spawn worker: {}", _0)]
    Spawn(io::Error),

    #[display("{}", _0)]
    Io(io::Error),
}

impl std::error::Error for Error {}

/// Which half of the supervisor/worker pair this process is. Decided once, from the environment
/// the process was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Process {
    Supervisor,
    Worker(ProcessDescriptor),
}

impl Process {
    /// A process started by a supervisor carries the worker marker and a full
    /// [`ProcessDescriptor`]; anything else is a supervisor, including a supervisor that was
    /// handed listeners by whoever started it.
    pub fn detect() -> Result<Self, HandshakeError> {
        Ok(match ProcessDescriptor::from_env()? {
            Some(descriptor) => Self::Worker(descriptor),
            None => Self::Supervisor,
        })
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker(_))
    }
}

/// Answer an upgrade sanity check if this process was started as one. Returns `true` if it was,
/// in which case the caller should exit without doing anything else.
///
/// [`run`] does this itself; call it earlier to skip expensive initialisation in that case.
pub fn sanity_check() -> bool {
    let token = match std::env::var(ENV_BIN_CHECK) {
        Ok(token) if !token.is_empty() => token,
        _ => return false,
    };
    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(token.as_bytes()).and_then(|_| stdout.flush()) {
        log::error!("Failed to answer sanity check: {e}");
    }
    true
}

/// Run the configured program under a supervisor and exit the process with its status.
///
/// If the supervisor/worker model cannot be set up and the configuration is not
/// [required](Config::required), the program runs in this process instead, with
/// [`State::is_enabled`] returning `false`.
pub async fn run(config: Config) {
    let settings = match config.validate() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{}", Error::from(e));
            exit(1);
        }
    };
    if sanity_check() {
        exit(0);
    }

    let required = settings.required;
    let program = settings.program.clone();
    let addresses = settings.addresses.clone();
    let quiet = settings.no_warn && !settings.debug;

    let failure = match launch(settings).await {
        Ok(code) => exit(code),
        Err(failure) => failure,
    };

    if required || failure.in_worker {
        log::error!("{}", failure.error);
        exit(1);
    }
    if !quiet {
        log::warn!("Upgrades disabled, running in-process: {}", failure.error);
    }
    run_disabled(program, addresses, failure.registry).await;
    exit(0);
}

/// Like [`run`], but returns the status instead of exiting and never falls back to running the
/// program in-process.
pub async fn run_err(config: Config) -> Result<i32, Error> {
    let settings = config.validate()?;
    if sanity_check() {
        return Ok(0);
    }
    launch(settings).await.map_err(|failure| failure.error)
}

struct Failure {
    error: Error,
    registry: Option<ListenerRegistry>,
    in_worker: bool,
}

impl From<SupervisorError> for Failure {
    fn from(e: SupervisorError) -> Self {
        Self {
            error: e.error,
            registry: e.registry,
            in_worker: false,
        }
    }
}

async fn launch(settings: Settings) -> Result<i32, Failure> {
    // a malformed handshake still means a supervisor started us
    let process = Process::detect().map_err(|e| Failure {
        error: e.into(),
        registry: None,
        in_worker: true,
    })?;

    match process {
        Process::Supervisor => Ok(Supervisor::start(settings).await?.run().await?),
        Process::Worker(descriptor) => {
            Worker::new(settings, descriptor)
                .run()
                .await
                .map_err(|e| Failure {
                    error: Error::Io(e),
                    registry: None,
                    in_worker: true,
                })
        }
    }
}

/// Serve the program without a supervisor, over the supervisor's listeners if it got as far as
/// opening them.
async fn run_disabled(
    program: Program,
    addresses: Vec<String>,
    registry: Option<ListenerRegistry>,
) {
    let listeners = match in_process_listeners(&addresses, registry) {
        Ok(listeners) => listeners,
        Err(e) => {
            log::error!("Cannot listen in-process, running without listeners: {e}");
            Vec::new()
        }
    };
    program(State::disabled(addresses, listeners)).await
}

fn in_process_listeners(
    addresses: &[String],
    supervised: Option<ListenerRegistry>,
) -> io::Result<Vec<Arc<TcpGracefulListener>>> {
    let std_listeners = match supervised {
        Some(supervised) => supervised.std_listeners()?,
        None => addresses
            .iter()
            .map(|address| registry::bind_tcp(registry::resolve(address)?))
            .collect::<io::Result<_>>()?,
    };
    std_listeners
        .into_iter()
        .map(|listener| {
            listener.set_nonblocking(true)?;
            Ok(Arc::new(GracefulListener::new(TcpListener::from_std(
                listener,
            )?)))
        })
        .collect()
}
