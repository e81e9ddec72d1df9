use std::{
    fs::File,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::stat::{fstat, SFlag},
    unistd,
};

pub(crate) const ENV_IS_WORKER: &str = "MOULT_IS_WORKER";
pub(crate) const ENV_WORKER_ID: &str = "MOULT_WORKER_ID";
pub(crate) const ENV_NUM_FDS: &str = "MOULT_NUM_FDS";
pub(crate) const ENV_BIN_ID: &str = "MOULT_BIN_ID";
pub(crate) const ENV_BIN_PATH: &str = "MOULT_BIN_PATH";
pub(crate) const ENV_BIN_CHECK: &str = "MOULT_BIN_CHECK";
pub(crate) const WORKER_TRUE_VAL: &str = "1";

/// Every handshake variable; scrubbed from commands that must not look like workers.
pub(crate) const HANDSHAKE_VARS: [&str; 6] = [
    ENV_IS_WORKER,
    ENV_WORKER_ID,
    ENV_NUM_FDS,
    ENV_BIN_ID,
    ENV_BIN_PATH,
    ENV_BIN_CHECK,
];

/// Inherited listeners start right after stdio.
pub(crate) const FIRST_INHERITED_FD: RawFd = 3;

/// Exit status of a worker that drained because a restart was requested.
pub const RESTART_EXIT_CODE: i32 = 75;

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn is_cloexec(fd: RawFd) -> io::Result<bool> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    Ok(flags.contains(FdFlag::FD_CLOEXEC))
}

/// Duplicate `fd` onto the lowest free descriptor at or above `min_fd`, with CLOEXEC set.
///
/// Keeping the supervisor's copies above the `3..3+n` range means the dup2 calls made between
/// fork and exec can never clobber a source descriptor.
pub(crate) fn clone_fd_above(fd: RawFd, min_fd: RawFd) -> io::Result<OwnedFd> {
    let new_fd = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(min_fd))?;
    // fcntl hands us a fresh descriptor that nothing else owns
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// Place `fds[i]` at descriptor `3 + i`. Runs in the forked child before exec, so it only makes
/// async-signal-safe calls. dup2 leaves the target without CLOEXEC, which is what lets the
/// listener survive exec.
pub(crate) fn install_inherited_fds(fds: &[RawFd]) -> io::Result<()> {
    for (i, fd) in fds.iter().enumerate() {
        unistd::dup2(*fd, FIRST_INHERITED_FD + i as RawFd)?;
    }
    Ok(())
}

/// Fill every free descriptor below `3 + count` with `/dev/null` and hold on to them.
///
/// While the returned descriptors live, nothing this process opens (such as the pipe `spawn`
/// uses to report a failed exec) can land on a descriptor that [`install_inherited_fds`]
/// overwrites in the child. Opening always takes the lowest free number, so this never touches a
/// descriptor someone else owns.
pub(crate) fn park_inherited_range(count: usize) -> io::Result<Vec<OwnedFd>> {
    let end = FIRST_INHERITED_FD + count as RawFd;
    let mut parked = Vec::new();
    loop {
        // std opens with O_CLOEXEC
        let null = OwnedFd::from(File::open("/dev/null")?);
        if null.as_raw_fd() >= end {
            return Ok(parked);
        }
        parked.push(null);
    }
}

pub(crate) fn is_socket(fd: RawFd) -> bool {
    match fstat(fd) {
        Ok(stat) => SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT == SFlag::S_IFSOCK,
        Err(_) => false,
    }
}
