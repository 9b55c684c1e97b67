//! Two-process commit handshake between the filesystem daemon and the
//! unmount driver, over a pair of POSIX message queues.
//!
//! The driver runs `fusermount -u`, then tells the daemon whether to commit;
//! the daemon answers with a one-byte status once the commit pipeline and
//! staging teardown finish. Queue names derive from the mountpoint basename,
//! so both processes find each other without shared state.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use nix::errno::Errno;
use nix::mqueue::{
    mq_close, mq_getattr, mq_open, mq_send, mq_timedreceive, mq_unlink, MQ_OFlag, MqdT,
};
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use tracing::{debug, error};

use crate::error::{Result, WimError};
use crate::ops::MountContext;

/// How long the daemon waits for the commit command before giving up and
/// discarding changes.
pub const DAEMON_RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the driver waits for the daemon's status; rewriting a large
/// archive can take a while.
pub const DRIVER_RECV_TIMEOUT: Duration = Duration::from_secs(600);

const FALLBACK_MSGSIZE: usize = 8192;
const MSGSIZE_MAX_FILE: &str = "/proc/sys/fs/mqueue/msgsize_max";

const U2D_SUFFIX: &str = "unmount-to-daemon-mq";
const D2U_SUFFIX: &str = "daemon-to-unmount-mq";

/// `/<mountpoint-basename>wimfs-<suffix>` with trailing slashes stripped and
/// any remaining slash turned into an underscore.
fn queue_name(mountpoint: &Path, suffix: &str) -> Result<CString> {
    let raw = mountpoint.as_os_str().as_bytes();
    let mut end = raw.len();
    while end > 1 && raw[end - 1] == b'/' {
        end -= 1;
    }
    let trimmed = &raw[..end];
    let base = match trimmed.iter().rposition(|&b| b == b'/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    };

    let mut name = Vec::with_capacity(1 + base.len() + 6 + suffix.len());
    name.push(b'/');
    name.extend_from_slice(base);
    name.extend_from_slice(b"wimfs-");
    name.extend_from_slice(suffix.as_bytes());
    for b in &mut name[1..] {
        if *b == b'/' {
            *b = b'_';
        }
    }
    CString::new(name).map_err(|_| WimError::Invalid)
}

#[derive(Clone, Copy, Debug)]
pub enum Side {
    Daemon,
    Driver,
}

pub struct MessageQueues {
    unmount_to_daemon: MqdT,
    daemon_to_unmount: MqdT,
    u2d_name: CString,
    d2u_name: CString,
}

impl MessageQueues {
    pub fn open(mountpoint: &Path, side: Side) -> Result<Self> {
        let u2d_name = queue_name(mountpoint, U2D_SUFFIX)?;
        let d2u_name = queue_name(mountpoint, D2U_SUFFIX)?;

        let (u2d_flags, d2u_flags) = match side {
            Side::Daemon => (
                MQ_OFlag::O_RDONLY | MQ_OFlag::O_CREAT,
                MQ_OFlag::O_WRONLY | MQ_OFlag::O_CREAT,
            ),
            Side::Driver => (
                MQ_OFlag::O_WRONLY | MQ_OFlag::O_CREAT,
                MQ_OFlag::O_RDONLY | MQ_OFlag::O_CREAT,
            ),
        };

        let unmount_to_daemon =
            mq_open(u2d_name.as_c_str(), u2d_flags, Mode::S_IRWXU, None).map_err(WimError::Mqueue)?;
        let daemon_to_unmount = match mq_open(d2u_name.as_c_str(), d2u_flags, Mode::S_IRWXU, None) {
            Ok(mq) => mq,
            Err(err) => {
                let _ = mq_close(unmount_to_daemon);
                let _ = mq_unlink(u2d_name.as_c_str());
                return Err(WimError::Mqueue(err));
            }
        };

        Ok(Self {
            unmount_to_daemon,
            daemon_to_unmount,
            u2d_name,
            d2u_name,
        })
    }

    fn msgsize(&self, mq: &MqdT) -> usize {
        match mq_getattr(mq) {
            Ok(attr) => attr.msgsize() as usize,
            Err(err) => {
                error!(%err, "mq_getattr failed, reading {MSGSIZE_MAX_FILE}");
                std::fs::read_to_string(MSGSIZE_MAX_FILE)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or_else(|| {
                        error!("assuming message size of {FALLBACK_MSGSIZE}");
                        FALLBACK_MSGSIZE
                    })
            }
        }
    }

    pub fn send_command(&self, commit: bool, check_integrity: bool) -> Result<()> {
        mq_send(
            &self.unmount_to_daemon,
            &[commit as u8, check_integrity as u8],
            1,
        )
        .map_err(WimError::Mqueue)
    }

    /// Daemon side: `Ok(None)` on timeout.
    pub fn recv_command(&self) -> Result<Option<(bool, bool)>> {
        let mut buf = vec![0u8; self.msgsize(&self.unmount_to_daemon).max(2)];
        let mut prio = 0u32;
        let timeout = abs_timeout(DAEMON_RECV_TIMEOUT)?;
        match mq_timedreceive(&self.unmount_to_daemon, &mut buf, &mut prio, &timeout) {
            Ok(n) if n >= 2 => Ok(Some((buf[0] != 0, buf[1] != 0))),
            Ok(_) => Ok(Some((false, false))),
            Err(Errno::ETIMEDOUT) => Ok(None),
            Err(err) => Err(WimError::Mqueue(err)),
        }
    }

    pub fn send_status(&self, status: u8) -> Result<()> {
        mq_send(&self.daemon_to_unmount, &[status], 1).map_err(WimError::Mqueue)
    }

    /// Driver side: errors out rather than guessing after the long timeout.
    pub fn recv_status(&self) -> Result<u8> {
        let mut buf = vec![0u8; self.msgsize(&self.daemon_to_unmount).max(1)];
        let mut prio = 0u32;
        let timeout = abs_timeout(DRIVER_RECV_TIMEOUT)?;
        match mq_timedreceive(&self.daemon_to_unmount, &mut buf, &mut prio, &timeout) {
            Ok(n) if n >= 1 => Ok(buf[0]),
            Ok(_) => Err(WimError::Mqueue(Errno::EBADMSG)),
            Err(Errno::ETIMEDOUT) => Err(WimError::Timeout("unmount status")),
            Err(err) => Err(WimError::Mqueue(err)),
        }
    }

    /// Closes both descriptors and unlinks the names; whichever side closes
    /// last wins the unlink race, which is fine either way.
    pub fn close(self) {
        let _ = mq_close(self.unmount_to_daemon);
        let _ = mq_close(self.daemon_to_unmount);
        let _ = mq_unlink(self.u2d_name.as_c_str());
        let _ = mq_unlink(self.d2u_name.as_c_str());
    }
}

fn abs_timeout(after: Duration) -> Result<TimeSpec> {
    let now = clock_gettime(ClockId::CLOCK_REALTIME).map_err(WimError::Mqueue)?;
    Ok(TimeSpec::new(
        now.tv_sec() + after.as_secs() as i64,
        now.tv_nsec(),
    ))
}

/// Daemon half of the handshake, run from the filesystem destroy callback.
/// Never propagates: whatever happens, staging is torn down and a status is
/// attempted.
pub fn daemon_finish(ctx: &mut MountContext) {
    let queues = match MessageQueues::open(&ctx.config.mountpoint, Side::Daemon) {
        Ok(queues) => queues,
        Err(err) => {
            error!(%err, "cannot open unmount message queues, discarding changes");
            let _ = ctx.shutdown(false, false);
            return;
        }
    };

    let (commit, check_integrity) = match queues.recv_command() {
        Ok(Some(command)) => {
            debug!(commit = command.0, check_integrity = command.1, "received unmount command");
            command
        }
        Ok(None) => {
            error!("timed out waiting for the commit command; not committing");
            (false, false)
        }
        Err(err) => {
            error!(%err, "failed to receive the commit command; not committing");
            (false, false)
        }
    };

    let status = match ctx.shutdown(commit, check_integrity) {
        Ok(()) => 0,
        Err(err) => {
            error!(%err, "unmount failed");
            err.status_code()
        }
    };
    if let Err(err) = queues.send_status(status) {
        error!(%err, "failed to send the unmount status to the driver");
    }
    queues.close();
}

/// Driver half: unmount the kernel mount, then tell the daemon what to do
/// and wait for its verdict.
pub fn unmount(mountpoint: &Path, commit: bool, check_integrity: bool) -> Result<()> {
    let status = Command::new("fusermount")
        .arg("-u")
        .arg(mountpoint)
        .status()
        .map_err(WimError::Fusermount)?;
    if !status.success() {
        return Err(WimError::FusermountStatus(status.code().unwrap_or(-1)));
    }

    let queues = MessageQueues::open(mountpoint, Side::Driver)?;
    let result = queues
        .send_command(commit, check_integrity)
        .and_then(|()| queues.recv_status());
    queues.close();

    match result? {
        0 => Ok(()),
        status => Err(WimError::UnmountStatus(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_derive_from_basename() {
        let name = queue_name(Path::new("/mnt/images/win10///"), U2D_SUFFIX).unwrap();
        assert_eq!(
            name.to_bytes(),
            b"/win10wimfs-unmount-to-daemon-mq"
        );
        let name = queue_name(Path::new("plain"), D2U_SUFFIX).unwrap();
        assert_eq!(name.to_bytes(), b"/plainwimfs-daemon-to-unmount-mq");
    }

    #[test]
    fn command_and_status_roundtrip() {
        let mountpoint = Path::new("/tmp/wimfs-mq-test-roundtrip");
        let daemon = MessageQueues::open(mountpoint, Side::Daemon).unwrap();
        let driver = MessageQueues::open(mountpoint, Side::Driver).unwrap();

        driver.send_command(true, false).unwrap();
        assert_eq!(daemon.recv_command().unwrap(), Some((true, false)));

        daemon.send_status(0).unwrap();
        assert_eq!(driver.recv_status().unwrap(), 0);

        daemon.close();
        driver.close();
    }
}
