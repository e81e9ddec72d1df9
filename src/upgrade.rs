//! Turning fetched bytes into the live binary.
//!
//! Candidate bytes are identified by content. A candidate that differs from the running binary is
//! staged next to it, run through the optional pre-upgrade hook, sanity checked by executing it,
//! and only then moved over the live path. Any failure discards the staged copy and leaves the
//! live binary untouched.

use std::{
    env, io,
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use nix::errno::Errno;
use rand::Rng;
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use tokio::process::Command;

use crate::{
    config::{PreUpgrade, Settings},
    installer::BinaryInstaller,
    utils::{ENV_BIN_CHECK, HANDSHAKE_VARS},
};

#[derive(derive_more::From, derive_more::Display, Debug)]
#[display("{_variant}")]
pub enum UpgradeError {
    #[display("staging failed: {}", _0)]
    #[from]
    Io(io::Error),

    #[display("pre-upgrade check rejected the binary: {}", _0)]
    Rejected(String),

    #[display("sanity check failed: {}", _0)]
    SanityCheck(String),

    #[display("sanity check did not answer within {:?}", _0)]
    SanityTimeout(Duration),
}

impl std::error::Error for UpgradeError {}

/// Content id of a binary: lowercase hex SHA-256.
pub fn binary_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub(crate) async fn binary_id_of(path: &Path) -> io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(binary_id(&bytes))
}

/// A freshly installed binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRecord {
    pub bin_id: String,
    pub bin_path: PathBuf,
}

pub(crate) struct UpgradePipeline {
    bin_path: PathBuf,
    pre_upgrade: Option<PreUpgrade>,
    installer: Arc<dyn BinaryInstaller>,
    sanity_check_timeout: Duration,
}

impl UpgradePipeline {
    pub(crate) fn new(settings: &Settings, bin_path: PathBuf) -> Self {
        Self {
            bin_path,
            pre_upgrade: settings.pre_upgrade.clone(),
            installer: settings.installer.clone(),
            sanity_check_timeout: settings.sanity_check_timeout,
        }
    }

    /// Install `bytes` unless they are the binary already running. `Ok(None)` means there was
    /// nothing to do.
    pub(crate) async fn apply(
        &self,
        bytes: Vec<u8>,
        current_id: &str,
    ) -> Result<Option<UpgradeRecord>, UpgradeError> {
        let bin_id = binary_id(&bytes);
        if bin_id == current_id {
            log::debug!("Fetched binary matches the running one ({bin_id})");
            return Ok(None);
        }
        log::info!("Fetched new binary {bin_id}, staging");

        let staged = {
            let bin_path = self.bin_path.clone();
            let installer = self.installer.clone();
            tokio::task::spawn_blocking(move || stage(&bytes, &bin_path, &*installer))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??
        };

        if let Some(pre_upgrade) = &self.pre_upgrade {
            pre_upgrade(&staged).map_err(|e| UpgradeError::Rejected(e.to_string()))?;
        }

        sanity_check(&staged, self.sanity_check_timeout).await?;

        let installer = self.installer.clone();
        let target = self.bin_path.clone();
        tokio::task::spawn_blocking(move || {
            // `staged` is dropped here; after a successful install there is nothing left to delete
            installer.install(&staged, &target)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        log::info!("Installed binary {bin_id} at {:?}", self.bin_path);
        Ok(Some(UpgradeRecord {
            bin_id,
            bin_path: self.bin_path.clone(),
        }))
    }
}

/// Write `bytes` to a temp file beside `bin_path` (or in the temp dir if that is not writable).
/// The returned path deletes the file when dropped.
fn stage(bytes: &[u8], bin_path: &Path, installer: &dyn BinaryInstaller) -> io::Result<TempPath> {
    let live = std::fs::metadata(bin_path)?;
    let prefix = format!(
        ".{}.",
        bin_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "moult".into())
    );
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(".staged");

    let mut staged: NamedTempFile = match bin_path.parent() {
        Some(dir) => builder
            .tempfile_in(dir)
            .or_else(|_| builder.tempfile_in(env::temp_dir()))?,
        None => builder.tempfile_in(env::temp_dir())?,
    };
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    installer.prepare(staged.as_file(), &live)?;
    // close our handle, exec'ing a file open for writing fails with ETXTBSY
    Ok(staged.into_temp_path())
}

/// Run `binary` with the check token set; it must echo the token to stdout and exit zero.
pub(crate) async fn sanity_check(binary: &Path, timeout: Duration) -> Result<(), UpgradeError> {
    let token = hex::encode(rand::rng().random::<[u8; 16]>());

    let mut cmd = Command::new(binary);
    for var in HANDSHAKE_VARS {
        cmd.env_remove(var);
    }
    cmd.env(ENV_BIN_CHECK, &token)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let run = async {
        let mut attempts = 0;
        loop {
            match cmd.output().await {
                // another thread may have forked while the staged file was still open for writing
                Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempts < 5 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                res => return res,
            }
        }
    };
    let output = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| UpgradeError::SanityTimeout(timeout))?
        .map_err(|e| UpgradeError::SanityCheck(format!("cannot execute {binary:?}: {e}")))?;

    if !output.status.success() {
        return Err(UpgradeError::SanityCheck(format!(
            "{binary:?} exited with {}",
            output.status
        )));
    }
    if output.stdout != token.as_bytes() {
        return Err(UpgradeError::SanityCheck(format!(
            "{binary:?} did not echo the check token"
        )));
    }
    Ok(())
}
