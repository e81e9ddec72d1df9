//! The long-lived half of a supervisor/worker pair.
//!
//! The supervisor owns the listening sockets and never accepts on them. It runs one worker at a
//! time, handing it the sockets at descriptors `3..3+n`, relays signals to it, and replaces it
//! whenever a restart is requested or a fetched binary has been installed.

use std::{
    env, io,
    os::{fd::OwnedFd, unix::process::ExitStatusExt},
    path::PathBuf,
    process::ExitStatus,
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    process::Command,
    sync::mpsc::{unbounded_channel, UnboundedSender},
    time::{interval, sleep_until, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Settings,
    fetcher::Fetcher,
    handshake::{inherited_fd_count, ProcessDescriptor},
    registry::ListenerRegistry,
    upgrade::{binary_id_of, sanity_check, UpgradePipeline, UpgradeRecord},
    utils::{install_inherited_fds, park_inherited_range, RESTART_EXIT_CODE},
    worker::PROGRAM_GRACE,
    Error,
};

use trigger::{Action, TriggerReason, Triggers};

pub(crate) mod trigger;

/// Extra time a draining worker gets on top of `terminate_timeout` before it is killed. Longer
/// than the worker's own grace for its program, so a worker that drains to the deadline still
/// exits on its own.
const KILL_GRACE: Duration = Duration::from_secs(PROGRAM_GRACE.as_secs() + 1);

/// The supervisor could not do its job. Carries the listeners, if they were opened, so the
/// program can still be served in-process.
pub(crate) struct SupervisorError {
    pub(crate) error: Error,
    pub(crate) registry: Option<ListenerRegistry>,
}

impl SupervisorError {
    fn new<E: Into<Error>>(error: E, registry: Option<ListenerRegistry>) -> Self {
        Self {
            error: error.into(),
            registry,
        }
    }
}

#[derive(Debug)]
enum Event {
    Exited {
        worker_id: u64,
        status: io::Result<ExitStatus>,
    },
    Upgraded(UpgradeRecord),
}

/// How a worker ended, as far as the supervisor is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Drained for a restart; spawn a replacement.
    Restart,
    /// Shut down or the program returned.
    Finished,
    Crashed,
}

impl Exit {
    fn of(status: &ExitStatus) -> Self {
        match status.code() {
            Some(RESTART_EXIT_CODE) => Self::Restart,
            Some(0) => Self::Finished,
            _ => Self::Crashed,
        }
    }
}

/// The status the supervisor passes on for a worker that did not finish cleanly: its exit code,
/// or `128 + signal` if it was killed.
fn exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

/// The worker currently running.
#[derive(Debug, Clone)]
struct Child {
    worker_id: u64,
    pid: Pid,
    bin_id: String,
}

pub(crate) struct Supervisor {
    settings: Settings,
    registry: ListenerRegistry,
    bin_path: PathBuf,
    bin_id: String,
    last_worker_id: u64,
    /// Keeps `3..3+n` occupied in the supervisor itself.
    _parked: Vec<OwnedFd>,
}

impl Supervisor {
    /// Open (or adopt) the listeners and identify the running binary.
    pub(crate) async fn start(settings: Settings) -> Result<Self, SupervisorError> {
        let registry = match inherited_fd_count() {
            Ok(Some(count)) => {
                debugf!(settings, "Adopting {count} inherited listener(s)");
                ListenerRegistry::adopt(&settings.addresses, count)
            }
            Ok(None) => ListenerRegistry::bind(&settings.addresses),
            Err(e) => return Err(SupervisorError::new(e, None)),
        }
        .map_err(|e| SupervisorError::new(Error::Io(e), None))?;

        debugf!(
            settings,
            "Supervisor {} listening on {:?}",
            std::process::id(),
            registry.local_addrs()
        );

        let identify = async {
            let bin_path = env::current_exe()?;
            let bin_id = binary_id_of(&bin_path).await?;
            io::Result::Ok((bin_path, bin_id))
        };
        let (bin_path, bin_id) = match identify.await {
            Ok(found) => found,
            Err(e) => return Err(SupervisorError::new(Error::Io(e), Some(registry))),
        };

        let parked = match park_inherited_range(registry.len()) {
            Ok(parked) => parked,
            Err(e) => return Err(SupervisorError::new(Error::Io(e), Some(registry))),
        };

        Ok(Self {
            settings,
            registry,
            bin_path,
            bin_id,
            last_worker_id: 0,
            _parked: parked,
        })
    }

    /// Run workers until one finishes for good. Returns the supervisor's exit status.
    pub(crate) async fn run(mut self) -> Result<i32, SupervisorError> {
        let mut triggers =
            match Triggers::standard(self.settings.restart_signal, self.settings.no_restart) {
                Ok(triggers) => triggers,
                Err(e) => return Err(SupervisorError::new(Error::Io(e), Some(self.registry))),
            };

        let (events_tx, mut events) = unbounded_channel();
        let stop_fetching = CancellationToken::new();
        let _stop_fetching = stop_fetching.clone().drop_guard();
        if let Some(fetch_loop) = self.fetch_loop().await {
            tokio::spawn(fetch_loop.run(events_tx.clone(), stop_fetching));
        }

        let mut child = match self.spawn(&events_tx) {
            Ok(child) => child,
            Err(e) => return Err(SupervisorError::new(Error::Spawn(e), Some(self.registry))),
        };

        let mut restarting = false;
        let mut terminating = false;
        let mut crashes = 0;
        let mut kill_at: Option<Instant> = None;

        loop {
            let kill_deadline = async move {
                match kill_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                (reason, action) = triggers.next() => {
                    if let TriggerReason::Signal(kind) = reason {
                        debugf!(self.settings, "Supervisor received signal {}", kind.as_raw_value());
                    }
                    match action {
                        Action::Terminate if !terminating => {
                            terminating = true;
                            self.signal(&child, Signal::SIGTERM);
                            kill_at = Some(self.kill_deadline());
                        }
                        Action::Restart if !terminating && !restarting => {
                            restarting = true;
                            self.restart(&child);
                            kill_at = Some(self.kill_deadline());
                        }
                        _ => debugf!(self.settings, "Worker {} is already draining", child.worker_id),
                    }
                }

                Some(event) = events.recv() => match event {
                    Event::Upgraded(record) => {
                        self.bin_id = record.bin_id;
                        if self.settings.no_restart_after_fetch || self.settings.no_restart {
                            debugf!(
                                self.settings,
                                "Binary {} installed, waiting for a manual restart",
                                self.bin_id
                            );
                        } else if !terminating && !restarting && child.bin_id != self.bin_id {
                            debugf!(self.settings, "Restarting into binary {}", self.bin_id);
                            restarting = true;
                            self.restart(&child);
                            kill_at = Some(self.kill_deadline());
                        }
                    }

                    Event::Exited { worker_id, status } => {
                        if worker_id != child.worker_id {
                            continue;
                        }
                        kill_at = None;

                        let status = match status {
                            Ok(status) => status,
                            Err(e) => {
                                log::error!("Lost track of worker {worker_id}: {e}");
                                return Ok(1);
                            }
                        };
                        let exit = Exit::of(&status);

                        if terminating {
                            debugf!(self.settings, "Worker {worker_id} exited ({status}), supervisor stopping");
                            return Ok(match exit {
                                Exit::Crashed => exit_code(&status),
                                _ => 0,
                            });
                        }

                        match (exit, restarting) {
                            (Exit::Finished, false) => {
                                debugf!(self.settings, "Worker {worker_id} finished, supervisor stopping");
                                return Ok(0);
                            }
                            (_, true) | (Exit::Restart, false) => {
                                if exit == Exit::Crashed {
                                    warnf!(self.settings, "Worker {worker_id} ended abnormally during restart ({status})");
                                }
                                crashes = 0;
                            }
                            (Exit::Crashed, false) => {
                                if crashes >= self.settings.crash_respawn_limit {
                                    log::error!("Worker {worker_id} crashed ({status}), giving up");
                                    return Ok(exit_code(&status));
                                }
                                crashes += 1;
                                warnf!(
                                    self.settings,
                                    "Worker {worker_id} crashed ({status}), respawning ({crashes}/{})",
                                    self.settings.crash_respawn_limit
                                );
                            }
                        }

                        restarting = false;
                        child = match self.spawn(&events_tx) {
                            Ok(child) => child,
                            Err(e) => {
                                return Err(SupervisorError::new(Error::Spawn(e), Some(self.registry)))
                            }
                        };
                    }
                },

                _ = kill_deadline => {
                    warnf!(
                        self.settings,
                        "Worker {} still running {:?} after the drain deadline, killing it",
                        child.worker_id,
                        self.settings.terminate_timeout + KILL_GRACE
                    );
                    self.signal(&child, Signal::SIGKILL);
                    kill_at = None;
                }
            }
        }
    }

    fn kill_deadline(&self) -> Instant {
        Instant::now() + self.settings.terminate_timeout + KILL_GRACE
    }

    fn restart(&self, child: &Child) {
        let signal = match Signal::try_from(self.settings.restart_signal.as_raw_value()) {
            Ok(signal) => signal,
            Err(e) => {
                log::error!("Restart signal cannot be relayed: {e}");
                return;
            }
        };
        self.signal(child, signal);
    }

    fn signal(&self, child: &Child, signal: Signal) {
        debugf!(self.settings, "Sending {signal:?} to worker {}", child.worker_id);
        if let Err(e) = kill(child.pid, signal) {
            log::debug!("Signalling worker {} failed: {e}", child.worker_id);
        }
    }

    /// Start a worker over the registry's listeners and report its exit on `events`.
    fn spawn(&mut self, events: &UnboundedSender<Event>) -> io::Result<Child> {
        self.last_worker_id += 1;
        let descriptor = ProcessDescriptor {
            bin_id: self.bin_id.clone(),
            worker_id: self.last_worker_id,
            num_fds: self.registry.len(),
            bin_path: self.bin_path.clone(),
        };

        let fds = self.registry.fds_for_worker();
        let mut cmd = Command::new(&self.bin_path);
        cmd.args(env::args_os().skip(1)).envs(descriptor.to_env());
        // SAFETY: only dup2 and fcntl run between fork and exec
        unsafe {
            cmd.pre_exec(move || install_inherited_fds(&fds));
        }

        let mut process = cmd.spawn()?;
        let pid = process
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker exited immediately"))?;

        let worker_id = descriptor.worker_id;
        let events = events.clone();
        tokio::spawn(async move {
            let status = process.wait().await;
            let _ = events.send(Event::Exited { worker_id, status });
        });

        debugf!(
            self.settings,
            "Spawned worker {worker_id} (pid {pid}) running {}",
            descriptor.bin_id
        );
        Ok(Child {
            worker_id,
            pid: Pid::from_raw(pid as i32),
            bin_id: descriptor.bin_id,
        })
    }

    /// The fetch loop, if a fetcher is configured and this binary answers its own sanity check.
    async fn fetch_loop(&mut self) -> Option<FetchLoop> {
        let fetcher = self.settings.fetcher.take()?;

        if let Err(e) = sanity_check(&self.bin_path, self.settings.sanity_check_timeout).await {
            warnf!(
                self.settings,
                "{:?} does not pass its own sanity check, upgrades disabled: {e}",
                self.bin_path
            );
            return None;
        }

        Some(FetchLoop {
            fetcher,
            pipeline: UpgradePipeline::new(&self.settings, self.bin_path.clone()),
            current_id: self.bin_id.clone(),
            min_interval: self.settings.min_fetch_interval,
            debug: self.settings.debug,
            no_warn: self.settings.no_warn,
        })
    }
}

struct FetchLoop {
    fetcher: Box<dyn Fetcher>,
    pipeline: UpgradePipeline,
    current_id: String,
    min_interval: Duration,
    debug: bool,
    no_warn: bool,
}

impl FetchLoop {
    /// Fetch at most once per `min_interval` until `stop` fires. Nothing that goes wrong in here
    /// is fatal: the cycle is logged and retried on the next tick.
    async fn run(mut self, events: UnboundedSender<Event>, stop: CancellationToken) {
        if let Err(e) = self.fetcher.init().await {
            warnf!(self, "Fetcher failed to initialise, upgrades disabled: {e}");
            return;
        }

        let mut ticker = interval(self.min_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => (),
            }

            let bytes = match self.fetcher.fetch().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warnf!(self, "Fetch failed: {e}");
                    continue;
                }
            };

            match self.pipeline.apply(bytes, &self.current_id).await {
                Ok(Some(record)) => {
                    self.current_id = record.bin_id.clone();
                    if events.send(Event::Upgraded(record)).is_err() {
                        return;
                    }
                }
                Ok(None) => (),
                Err(e) => log::error!("Upgrade aborted, still running {}: {e}", self.current_id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use futures::{future::BoxFuture, FutureExt};
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::{config::Config, fetcher::FetchError, upgrade::binary_id};

    struct ScriptedFetcher {
        fail_init: bool,
        calls: Arc<AtomicUsize>,
        reply: fn(usize) -> Result<Option<Vec<u8>>, FetchError>,
    }

    impl Fetcher for ScriptedFetcher {
        fn init(&mut self) -> BoxFuture<'_, Result<(), FetchError>> {
            let fail = self.fail_init;
            async move {
                if fail {
                    Err("no credentials".into())
                } else {
                    Ok(())
                }
            }
            .boxed()
        }

        fn fetch(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, FetchError>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = (self.reply)(n);
            async move { reply }.boxed()
        }
    }

    fn fetch_loop(fetcher: ScriptedFetcher, current: &[u8]) -> FetchLoop {
        let settings = Config::new()
            .program(|_| async {})
            .address("127.0.0.1:0")
            .validate()
            .unwrap();
        FetchLoop {
            fetcher: Box::new(fetcher),
            pipeline: UpgradePipeline::new(&settings, PathBuf::from("/nonexistent/moult-test")),
            current_id: binary_id(current),
            min_interval: Duration::from_secs(1),
            debug: false,
            no_warn: true,
        }
    }

    #[test]
    fn exit_statuses() {
        assert_eq!(Exit::of(&ExitStatus::from_raw(0)), Exit::Finished);
        assert_eq!(
            Exit::of(&ExitStatus::from_raw(RESTART_EXIT_CODE << 8)),
            Exit::Restart
        );
        assert_eq!(Exit::of(&ExitStatus::from_raw(1 << 8)), Exit::Crashed);
        // killed by SIGKILL
        assert_eq!(Exit::of(&ExitStatus::from_raw(9)), Exit::Crashed);
    }

    #[test]
    fn crashed_workers_report_code_or_signal() {
        assert_eq!(exit_code(&ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(&ExitStatus::from_raw(9)), 128 + 9);
        assert_eq!(exit_code(&ExitStatus::from_raw(15)), 128 + 15);
    }

    #[test]
    fn kill_deadline_outlasts_the_program_grace() {
        assert!(KILL_GRACE > PROGRAM_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_init_disables_fetching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = ScriptedFetcher {
            fail_init: true,
            calls: calls.clone(),
            reply: |_| Ok(None),
        };
        let (tx, mut rx) = unbounded_channel();
        fetch_loop(fetcher, b"v1")
            .run(tx, CancellationToken::new())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn errors_and_unchanged_binaries_are_retried_each_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = ScriptedFetcher {
            fail_init: false,
            calls: calls.clone(),
            reply: |n| match n % 3 {
                0 => Err("upstream unavailable".into()),
                1 => Ok(None),
                _ => Ok(Some(b"v1".to_vec())),
            },
        };
        let (tx, mut rx) = unbounded_channel();
        let stop = CancellationToken::new();
        let task = tokio::spawn(fetch_loop(fetcher, b"v1").run(tx, stop.clone()));

        // first tick is immediate, then one per second
        tokio::time::sleep(Duration::from_millis(4500)).await;
        stop.cancel();
        task.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }
}
