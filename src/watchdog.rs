//! The watchdog enforces the wall-clock limit and reacts to out-of-memory events.
//!
//! It waits on two eventfds at once: the *disarm* eventfd, written by the jail process once the
//! payload has been reaped, and the *OOM* eventfd, registered with the memory cgroup. If neither
//! fires before the deadline, or the OOM eventfd fires first, the payload is killed.

use alloc_counter::no_alloc;
use std::ffi::c_int;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

use crate::error::{bail, bail_errno, Error, ErrorKind, Result};
use crate::libc_util::{eventfd_signal, ExitStatus};
use crate::timer::Timer;

/// Exit code of a watchdog that failed to kill the payload.
pub const SUPERVISION_FAILED_EXIT_CODE: c_int = 3;

/// How a watchdog's wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The payload was reaped before any limit was hit.
    Disarmed,
    /// The wall-clock limit expired.
    Deadline,
    /// The memory cgroup reported an out-of-memory event.
    OutOfMemory,
}

impl Verdict {
    /// Encode the verdict as the exit code of a watchdog process.
    pub fn exit_code(self) -> c_int {
        match self {
            Verdict::Disarmed => 0,
            Verdict::Deadline => 1,
            Verdict::OutOfMemory => 2,
        }
    }

    /// Decode the exit status of a watchdog process.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn from_exit_status(status: ExitStatus) -> Result<Verdict> {
        match status {
            ExitStatus::Code(0) => Ok(Verdict::Disarmed),
            ExitStatus::Code(1) => Ok(Verdict::Deadline),
            ExitStatus::Code(2) => Ok(Verdict::OutOfMemory),
            ExitStatus::Code(SUPERVISION_FAILED_EXIT_CODE) => {
                bail!(ErrorKind::Supervision, "watchdog failed to kill the payload")
            }
            _ => bail!(ErrorKind::Supervision, "watchdog exited unexpectedly"),
        }
    }
}

/// A watchdog over one payload.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog<'a> {
    disarm_fd: BorrowedFd<'a>,
    oom_fd: BorrowedFd<'a>,
    timeout: Duration,
}

impl<'a> Watchdog<'a> {
    pub fn new(disarm_fd: BorrowedFd<'a>, oom_fd: BorrowedFd<'a>, timeout: Duration) -> Self {
        Watchdog {
            disarm_fd,
            oom_fd,
            timeout,
        }
    }

    /// Block until the watchdog is disarmed, an OOM event arrives, or the timeout expires.
    ///
    /// Interrupted waits are restarted with the remaining time. If the disarm eventfd and the
    /// OOM eventfd are both readable, the watchdog counts as disarmed: the payload is already gone.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn wait(&self) -> Result<Verdict> {
        let timer = Timer::new();
        let timeout_ns = u64::try_from(self.timeout.as_nanos()).unwrap_or(u64::MAX);

        loop {
            let remaining_ns = timeout_ns.saturating_sub(timer.elapsed());
            if remaining_ns == 0 {
                return Ok(Verdict::Deadline);
            }
            // Round up, so we never spin on a zero-millisecond poll.
            let poll_timeout = remaining_ns.div_ceil(1_000_000).min(c_int::MAX as u64) as c_int;

            let mut fds = [
                libc::pollfd {
                    fd: self.disarm_fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.oom_fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, poll_timeout) };
            if ready == -1 {
                let err = Error::last_os_error(ErrorKind::Supervision);
                if err.errno == libc::EINTR {
                    continue;
                }
                return Err(err.cause("poll failed"));
            }
            if ready == 0 {
                // Clamped or rounded polls can wake early; re-check the deadline.
                continue;
            }

            if fds[0].revents & libc::POLLIN != 0 {
                return Ok(Verdict::Disarmed);
            }
            if fds[1].revents & libc::POLLIN != 0 {
                return Ok(Verdict::OutOfMemory);
            }
            bail!(ErrorKind::Supervision, "eventfd reported an error condition");
        }
    }

    /// Wait, then `SIGKILL` `target` unless the watchdog was disarmed.
    ///
    /// A target that has already exited (`ESRCH`) is not an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn supervise(&self, target: libc::pid_t) -> Result<Verdict> {
        let verdict = self.wait()?;
        if verdict != Verdict::Disarmed {
            kill(target)?;
        }
        Ok(verdict)
    }
}

/// Tell a watchdog waiting on `disarm_fd` that the payload has been reaped.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn disarm(disarm_fd: BorrowedFd) -> Result<()> {
    eventfd_signal(disarm_fd.as_raw_fd(), 1)
        .map_err(|e| e.kind(ErrorKind::Supervision).cause("failed to disarm watchdog"))
}

#[cfg_attr(debug_assertions, no_alloc)]
fn kill(target: libc::pid_t) -> Result<()> {
    if unsafe { libc::kill(target, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    if unsafe { *libc::__errno_location() } == libc::ESRCH {
        return Ok(());
    }
    bail_errno!(ErrorKind::Supervision, "failed to kill the payload");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_round_trip() {
        for verdict in [Verdict::Disarmed, Verdict::Deadline, Verdict::OutOfMemory] {
            assert_eq!(
                Verdict::from_exit_status(ExitStatus::Code(verdict.exit_code())).unwrap(),
                verdict
            );
        }
    }

    #[test]
    fn supervision_failure_is_an_error() {
        let err =
            Verdict::from_exit_status(ExitStatus::Code(SUPERVISION_FAILED_EXIT_CODE)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Supervision);

        let err = Verdict::from_exit_status(ExitStatus::Signal(libc::SIGSEGV)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Supervision);
    }

    #[test]
    fn killing_a_missing_process_is_fine() {
        kill(libc::pid_t::MAX).unwrap();
    }
}
