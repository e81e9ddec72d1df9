//! Platform file operations for putting a staged binary in place.

use std::{
    fs::{self, File, Metadata, Permissions},
    io,
    os::unix::fs::{fchown, MetadataExt, PermissionsExt},
    path::Path,
};

use nix::{
    errno::Errno,
    unistd::{getgid, getuid, sync},
};

/// Prepares and installs staged binaries. The upgrade pipeline only talks to this trait.
pub trait BinaryInstaller: Send + Sync + 'static {
    /// Give the staged file the permissions and owner it needs to run in place of `live`.
    fn prepare(&self, staged: &File, live: &Metadata) -> io::Result<()>;

    /// Replace `target` with `staged`. Must leave `target` untouched on failure.
    fn install(&self, staged: &Path, target: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PosixInstaller;

impl BinaryInstaller for PosixInstaller {
    fn prepare(&self, staged: &File, live: &Metadata) -> io::Result<()> {
        staged.set_permissions(Permissions::from_mode((live.mode() & 0o7777) | 0o700))?;
        fchown(staged, Some(getuid().as_raw()), Some(getgid().as_raw()))
    }

    fn install(&self, staged: &Path, target: &Path) -> io::Result<()> {
        match fs::rename(staged, target) {
            Ok(()) => {
                sync();
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
                log::debug!("{staged:?} and {target:?} are on different devices, copying");
                install_across_devices(staged, target)
            }
            Err(e) => Err(e),
        }
    }
}

// Copying straight onto a running executable fails with ETXTBSY, so copy next to it and rename
// over it from the same filesystem.
fn install_across_devices(staged: &Path, target: &Path) -> io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
    let sibling = tempfile::Builder::new()
        .prefix(".moult-install-")
        .tempfile_in(dir)?
        .into_temp_path();
    fs::copy(staged, &sibling)?;
    sibling.persist(target).map_err(|e| e.error)?;
    fs::remove_file(staged)?;
    sync();
    Ok(())
}
