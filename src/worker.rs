//! The serving half of a supervisor/worker pair.
//!
//! A worker finds its listeners at descriptors `3..3+n`, runs the program over them and waits for
//! one of its triggers. Whatever fires, the drain is the same: stop accepting on every listener,
//! give open connections `terminate_timeout` to finish, force-close the rest. The exit status
//! then tells the supervisor whether to spawn a replacement.

use std::{
    io,
    net::TcpListener as StdTcpListener,
    os::fd::{FromRawFd, RawFd},
    sync::Arc,
    time::Duration,
};

use nix::unistd::getppid;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Settings,
    graceful::GracefulListener,
    handshake::ProcessDescriptor,
    state::{Restarter, State, TcpGracefulListener},
    supervisor::trigger::{Action, Trigger, TriggerReason, Triggers},
    utils::{is_socket, set_cloexec, FIRST_INHERITED_FD, RESTART_EXIT_CODE},
};

/// How long the program may keep running once its listeners are drained.
pub(crate) const PROGRAM_GRACE: Duration = Duration::from_secs(1);

const PANIC_EXIT_CODE: i32 = 1;

pub(crate) struct Worker {
    settings: Settings,
    descriptor: ProcessDescriptor,
}

impl Worker {
    pub(crate) fn new(settings: Settings, descriptor: ProcessDescriptor) -> Self {
        Self {
            settings,
            descriptor,
        }
    }

    /// Serve until drained. Returns the exit status for the supervisor.
    pub(crate) async fn run(self) -> io::Result<i32> {
        let Self {
            settings,
            descriptor,
        } = self;

        let listeners = adopt_listeners(&settings.addresses, descriptor.num_fds)?;
        let mut triggers = Triggers::standard(settings.restart_signal, settings.no_restart)?;
        triggers.push(Trigger::parent_gone(), Action::Terminate);

        let shutdown = CancellationToken::new();
        let state = State::worker(
            settings.addresses.clone(),
            listeners.clone(),
            shutdown.clone(),
            descriptor.bin_id.clone(),
            descriptor.worker_id,
            Restarter::Supervisor {
                pid: getppid(),
                signal: settings.restart_signal,
            },
        );

        debugf!(
            settings,
            "Worker {} running binary {} on {} listener(s)",
            descriptor.worker_id,
            descriptor.bin_id,
            listeners.len()
        );

        let mut program = tokio::spawn((settings.program)(state));

        let action = tokio::select! {
            (reason, action) = triggers.next() => {
                match reason {
                    TriggerReason::Signal(kind) => debugf!(
                        settings,
                        "Worker {} received signal {}, {action:?}",
                        descriptor.worker_id,
                        kind.as_raw_value()
                    ),
                    TriggerReason::ParentGone(pid) => warnf!(
                        settings,
                        "Supervisor {pid} is gone, worker {} shutting down",
                        descriptor.worker_id
                    ),
                }
                action
            }
            res = &mut program => {
                return Ok(match res {
                    Ok(()) => {
                        debugf!(settings, "Program returned, worker {} exiting", descriptor.worker_id);
                        0
                    }
                    Err(e) => {
                        log::error!("Program failed in worker {}: {e}", descriptor.worker_id);
                        PANIC_EXIT_CODE
                    }
                });
            }
        };

        shutdown.cancel();
        drain(&settings, &listeners).await;

        if tokio::time::timeout(PROGRAM_GRACE, &mut program).await.is_err() {
            warnf!(
                settings,
                "Program did not return within {PROGRAM_GRACE:?} of the drain, abandoning it"
            );
            program.abort();
        }

        Ok(match action {
            Action::Restart => RESTART_EXIT_CODE,
            Action::Terminate => 0,
        })
    }
}

/// Release every listener at once, then wait for all of them.
async fn drain(settings: &Settings, listeners: &[Arc<TcpGracefulListener>]) {
    for listener in listeners {
        listener.release(settings.terminate_timeout);
    }
    for listener in listeners {
        if let Err(e) = listener.close().await {
            warnf!(settings, "Closing listener {:?} failed: {e}", listener.local_addr());
        }
    }

    let forced: usize = listeners.iter().map(|l| l.forced_closures()).sum();
    if forced > 0 {
        warnf!(
            settings,
            "Drain timed out after {:?}, force-closed {forced} connection(s)",
            settings.terminate_timeout
        );
    } else {
        debugf!(settings, "All connections drained");
    }
}

/// Wrap descriptors `3..3+count`; descriptor `3 + i` serves `addresses[i]`.
fn adopt_listeners(
    addresses: &[String],
    count: usize,
) -> io::Result<Vec<Arc<TcpGracefulListener>>> {
    if count != addresses.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "supervisor passed {count} listeners but {} addresses are configured",
                addresses.len()
            ),
        ));
    }

    addresses
        .iter()
        .enumerate()
        .map(|(i, address)| {
            let fd = FIRST_INHERITED_FD + i as RawFd;
            adopt_fd(fd).map_err(|e| {
                io::Error::new(e.kind(), format!("inherited fd {fd} for {address}: {e}"))
            })
        })
        .collect()
}

fn adopt_fd(fd: RawFd) -> io::Result<Arc<TcpGracefulListener>> {
    if !is_socket(fd) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a socket"));
    }
    set_cloexec(fd)?;
    // SAFETY: the supervisor installed a listening socket at this descriptor for us to own
    let std_listener = unsafe { StdTcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    log::debug!("Adopted fd {fd} listening on {:?}", listener.local_addr());
    Ok(Arc::new(GracefulListener::new(listener)))
}
