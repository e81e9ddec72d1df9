use std::{fmt, future::Future, path::Path, sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};
use tokio::signal::unix::SignalKind;

use crate::{
    fetcher::Fetcher,
    installer::{BinaryInstaller, PosixInstaller},
    state::State,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The user's program. Runs in every worker (or in-process when disabled) and must only return
/// once it is done with the listeners in its [`State`].
pub type Program = Arc<dyn Fn(State) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs against a staged binary before it is trusted; an error cancels the upgrade.
pub type PreUpgrade = Arc<dyn Fn(&Path) -> Result<(), BoxError> + Send + Sync>;

pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SANITY_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CRASH_RESPAWN_LIMIT: u32 = 1;

#[derive(Debug, derive_more::Display, PartialEq, Eq)]
#[display("{_variant}")]
pub enum ConfigError {
    #[display("a program is required")]
    MissingProgram,

    #[display("address and addresses cannot both be set")]
    AmbiguousAddress,

    #[display("at least one listen address is required")]
    NoAddress,

    #[display("the restart signal cannot be the terminate signal")]
    RestartIsTerminate,
}

impl std::error::Error for ConfigError {}

/// Builder for a self-upgrading program.
///
/// ```no_run
/// # async fn serve(_state: moult::State) {}
/// # async fn main_() {
/// let config = moult::Config::new()
///     .program(serve)
///     .address("127.0.0.1:9001");
/// moult::run(config).await;
/// # }
/// ```
pub struct Config {
    pub(crate) program: Option<Program>,
    address: Option<String>,
    addresses: Vec<String>,
    restart_signal: Option<SignalKind>,
    terminate_timeout: Duration,
    min_fetch_interval: Duration,
    sanity_check_timeout: Duration,
    pre_upgrade: Option<PreUpgrade>,
    fetcher: Option<Box<dyn Fetcher>>,
    installer: Arc<dyn BinaryInstaller>,
    crash_respawn_limit: u32,
    pub(crate) required: bool,
    no_restart: bool,
    no_restart_after_fetch: bool,
    debug: bool,
    no_warn: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            program: None,
            address: None,
            addresses: Vec::new(),
            restart_signal: None,
            terminate_timeout: Duration::ZERO,
            min_fetch_interval: Duration::ZERO,
            sanity_check_timeout: Duration::ZERO,
            pre_upgrade: None,
            fetcher: None,
            installer: Arc::new(PosixInstaller),
            crash_respawn_limit: DEFAULT_CRASH_RESPAWN_LIMIT,
            required: false,
            no_restart: false,
            no_restart_after_fetch: false,
            debug: false,
            no_warn: false,
        }
    }

    pub fn program<F, Fut>(mut self, program: F) -> Self
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.program = Some(Arc::new(move |state| program(state).boxed()));
        self
    }

    /// Single listen address. Set this or [`Config::addresses`], not both.
    pub fn address<S: Into<String>>(mut self, address: S) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Listen addresses; the worker gets its listeners in this order.
    pub fn addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// Signal that triggers a graceful restart. Defaults to `SIGUSR2`.
    pub fn restart_signal(mut self, signal: SignalKind) -> Self {
        self.restart_signal = Some(signal);
        self
    }

    /// How long a draining worker waits before force-closing connections. Defaults to 30s.
    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Smallest gap between two fetches. Defaults to 1s.
    pub fn min_fetch_interval(mut self, interval: Duration) -> Self {
        self.min_fetch_interval = interval;
        self
    }

    /// Bound on how long a staged binary may take to answer the sanity check. Defaults to 5s.
    pub fn sanity_check_timeout(mut self, timeout: Duration) -> Self {
        self.sanity_check_timeout = timeout;
        self
    }

    pub fn pre_upgrade<F>(mut self, check: F) -> Self
    where
        F: Fn(&Path) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.pre_upgrade = Some(Arc::new(check));
        self
    }

    pub fn fetcher<F: Fetcher>(mut self, fetcher: F) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    pub fn installer<I: BinaryInstaller>(mut self, installer: I) -> Self {
        self.installer = Arc::new(installer);
        self
    }

    /// Never fall back to running the program in-process, and never respawn a crashed worker.
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Turn the restart signal into a shutdown signal.
    pub fn no_restart(mut self, no_restart: bool) -> Self {
        self.no_restart = no_restart;
        self
    }

    /// Install fetched binaries but wait for a manual restart to run them.
    pub fn no_restart_after_fetch(mut self, no_restart_after_fetch: bool) -> Self {
        self.no_restart_after_fetch = no_restart_after_fetch;
        self
    }

    /// How many consecutive worker crashes are answered with a respawn. Defaults to 1.
    pub fn crash_respawn_limit(mut self, limit: u32) -> Self {
        self.crash_respawn_limit = limit;
        self
    }

    /// Log lifecycle events at info level instead of debug.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn no_warn(mut self, no_warn: bool) -> Self {
        self.no_warn = no_warn;
        self
    }

    pub(crate) fn validate(self) -> Result<Settings, ConfigError> {
        let program = self.program.ok_or(ConfigError::MissingProgram)?;

        let addresses = match (self.address, self.addresses) {
            (Some(_), addresses) if !addresses.is_empty() => {
                return Err(ConfigError::AmbiguousAddress)
            }
            (Some(address), _) => vec![address],
            (None, addresses) if addresses.is_empty() => return Err(ConfigError::NoAddress),
            (None, addresses) => addresses,
        };

        let restart_signal = self
            .restart_signal
            .unwrap_or_else(SignalKind::user_defined2);
        if restart_signal == SignalKind::terminate() {
            return Err(ConfigError::RestartIsTerminate);
        }

        let or_default = |d: Duration, default: Duration| if d.is_zero() { default } else { d };

        Ok(Settings {
            program,
            addresses,
            restart_signal,
            terminate_timeout: or_default(self.terminate_timeout, DEFAULT_TERMINATE_TIMEOUT),
            min_fetch_interval: or_default(self.min_fetch_interval, DEFAULT_MIN_FETCH_INTERVAL),
            sanity_check_timeout: or_default(
                self.sanity_check_timeout,
                DEFAULT_SANITY_CHECK_TIMEOUT,
            ),
            pre_upgrade: self.pre_upgrade,
            fetcher: self.fetcher,
            installer: self.installer,
            crash_respawn_limit: if self.required {
                0
            } else {
                self.crash_respawn_limit
            },
            required: self.required,
            no_restart: self.no_restart,
            no_restart_after_fetch: self.no_restart_after_fetch,
            debug: self.debug,
            no_warn: self.no_warn,
        })
    }
}

/// A validated [`Config`] with every default filled in.
pub(crate) struct Settings {
    pub(crate) program: Program,
    pub(crate) addresses: Vec<String>,
    pub(crate) restart_signal: SignalKind,
    pub(crate) terminate_timeout: Duration,
    pub(crate) min_fetch_interval: Duration,
    pub(crate) sanity_check_timeout: Duration,
    pub(crate) pre_upgrade: Option<PreUpgrade>,
    pub(crate) fetcher: Option<Box<dyn Fetcher>>,
    pub(crate) installer: Arc<dyn BinaryInstaller>,
    pub(crate) crash_respawn_limit: u32,
    pub(crate) required: bool,
    pub(crate) no_restart: bool,
    pub(crate) no_restart_after_fetch: bool,
    pub(crate) debug: bool,
    pub(crate) no_warn: bool,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("addresses", &self.addresses)
            .field("restart_signal", &self.restart_signal)
            .field("terminate_timeout", &self.terminate_timeout)
            .field("min_fetch_interval", &self.min_fetch_interval)
            .field("fetcher", &self.fetcher.is_some())
            .field("required", &self.required)
            .field("no_restart", &self.no_restart)
            .field("no_restart_after_fetch", &self.no_restart_after_fetch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_program() -> Config {
        Config::new().program(|_state| async {})
    }

    #[test]
    fn defaults_are_filled() {
        let settings = with_program().address(":9001").validate().unwrap();
        assert_eq!(settings.addresses, vec![":9001".to_owned()]);
        assert_eq!(settings.restart_signal, SignalKind::user_defined2());
        assert_eq!(settings.terminate_timeout, DEFAULT_TERMINATE_TIMEOUT);
        assert_eq!(settings.min_fetch_interval, DEFAULT_MIN_FETCH_INTERVAL);
        assert_eq!(settings.sanity_check_timeout, DEFAULT_SANITY_CHECK_TIMEOUT);
        assert_eq!(settings.crash_respawn_limit, DEFAULT_CRASH_RESPAWN_LIMIT);
        assert!(settings.fetcher.is_none());
    }

    #[test]
    fn multi_address_form_keeps_order() {
        let settings = with_program()
            .addresses(["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"])
            .terminate_timeout(Duration::from_secs(2))
            .validate()
            .unwrap();
        assert_eq!(
            settings.addresses,
            vec!["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"]
        );
        assert_eq!(settings.terminate_timeout, Duration::from_secs(2));
    }

    #[test]
    fn invalid_configs() {
        assert_eq!(
            Config::new().address(":1").validate().unwrap_err(),
            ConfigError::MissingProgram
        );
        assert_eq!(
            with_program()
                .address(":1")
                .addresses([":2"])
                .validate()
                .unwrap_err(),
            ConfigError::AmbiguousAddress
        );
        assert_eq!(
            with_program().validate().unwrap_err(),
            ConfigError::NoAddress
        );
        assert_eq!(
            with_program()
                .address(":1")
                .restart_signal(SignalKind::terminate())
                .validate()
                .unwrap_err(),
            ConfigError::RestartIsTerminate
        );
    }

    #[test]
    fn required_disables_crash_respawns() {
        let settings = with_program()
            .address(":1")
            .required(true)
            .crash_respawn_limit(5)
            .validate()
            .unwrap();
        assert_eq!(settings.crash_respawn_limit, 0);
    }
}
