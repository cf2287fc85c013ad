//! PTY allocation, controller spawning, resize and non-blocking master I/O.
//!
//! Uses the `nix` crate for POSIX PTY APIs. Both ends are opened close-on-exec
//! so a controller never inherits another slot's master; the controller gets
//! its own copies of the slave on fds 0-2 via `dup2`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } = openpty(&winsize, None)?;
    set_cloexec(&master)?;
    set_cloexec(&slave)?;
    Ok(PtyPair { master, slave })
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), nix::Error> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Switch the master to non-blocking mode and register it with the reactor.
pub fn into_async_master(master: OwnedFd) -> std::io::Result<AsyncFd<File>> {
    let raw = master.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    AsyncFd::new(File::from(master))
}

/// Spawn a controller process on the slave side of the PTY.
///
/// The child becomes a session leader (and therefore process group leader)
/// with the PTY slave as its controlling terminal, so job-control signals
/// aimed at it never reach the gateway. stdin/stdout/stderr are all
/// connected to the slave fd.
pub fn spawn_controller(
    pty: &PtyPair,
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args).envs(env).kill_on_drop(true);

    // The child's stdio is handled by pre_exec (dup2 to PTY slave), so tell
    // tokio not to set up pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &impl AsRawFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(winsize),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Send `sig` to the process group led by `pid`.
pub fn signal_group(pid: u32, sig: Signal) -> Result<(), nix::Error> {
    #[allow(clippy::cast_possible_wrap)]
    signal::killpg(Pid::from_raw(pid as i32), sig)
}

/// Send `sig` to a single process.
pub fn signal_process(pid: u32, sig: Signal) -> Result<(), nix::Error> {
    #[allow(clippy::cast_possible_wrap)]
    signal::kill(Pid::from_raw(pid as i32), sig)
}

/// Write the whole buffer to a non-blocking master, waiting for writability
/// whenever the kernel buffer is full.
pub async fn write_all(master: &AsyncFd<File>, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        let mut guard = master.writable().await?;
        match guard.try_io(|inner| {
            let mut file = inner.get_ref();
            file.write(data)
        }) {
            Ok(Ok(0)) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}
