//! Become root inside a fresh user namespace, before any sandbox is run.
//!
//! A paused holder process is cloned into a new user namespace. Its uid and gid maps are written
//! (directly when only our own id is mapped, otherwise through the setuid `newuidmap(1)` and
//! `newgidmap(1)` helpers), then we join its namespace and the holder is killed.

use std::ffi::c_int;
use std::os::fd::AsRawFd;
use std::process::Command;

use tracing::{debug, span, Level};

use crate::clone::{self, Stack};
use crate::error::{bail, bail_errno, Error, ErrorKind, Result};
use crate::id_map::{IdMap, IdMapping};
use crate::libc_util::waitpid;

/// Size of the stack for the namespace holder, which only ever calls `pause(2)`.
const HOLDER_STACK_SIZE: usize = 64 * 1024; // 64 KB

const NEWUIDMAP: &str = "/usr/bin/newuidmap";
const NEWGIDMAP: &str = "/usr/bin/newgidmap";

/// Map the caller's real ids to root in a new user namespace, plus the payload's `uid` and `gid`
/// when they are other host ids, and switch the calling process into it as root.
///
/// The calling process must be single-threaded.
pub fn enter_fake_root(uid: IdMapping, gid: IdMapping) -> Result<()> {
    let span = span!(Level::DEBUG, "userns");
    let _span_guard = span.enter();

    let (real_uid, real_gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let mut uid_map = IdMap::self_to_inner_uid(0);
    uid_map.push(uid);
    let mut gid_map = IdMap::self_to_inner_gid(0);
    gid_map.push(gid);

    let mut stack = Stack::new(HOLDER_STACK_SIZE);
    let mut holder = || {
        unsafe { libc::pause() };
        0
    };
    let holder_pid = unsafe { clone::spawn(&mut stack, libc::CLONE_NEWUSER, &mut holder) }
        .map_err(|e| e.context("spawning user namespace holder"))?;
    debug!(holder_pid, "spawned user namespace holder");

    let joined = write_uid_map(holder_pid, &uid_map, real_uid)
        .and_then(|()| write_gid_map(holder_pid, &gid_map, real_gid))
        .and_then(|()| join_user_namespace(holder_pid));

    // The holder is only needed to keep the namespace alive until we've joined it.
    unsafe { libc::kill(holder_pid, libc::SIGKILL) };
    let _ = waitpid(holder_pid, libc::__WALL);
    joined?;

    let 0 = (unsafe { libc::setgid(0) }) else {
        bail_errno!(ErrorKind::System, "failed to become root group in user namespace");
    };
    let 0 = (unsafe { libc::setuid(0) }) else {
        bail_errno!(ErrorKind::System, "failed to become root in user namespace");
    };
    debug!("running as root in a new user namespace");
    Ok(())
}

fn write_uid_map(pid: c_int, map: &IdMap, real_uid: u32) -> Result<()> {
    if map.is_self_only(real_uid) {
        debug!("writing uid_map");
        return std::fs::write(
            format!("/proc/{pid}/uid_map"),
            map.into_idmap_file_contents(),
        )
        .map_err(|e| Error::from(e).context("failed to write uid_map"));
    }
    run_helper(NEWUIDMAP, pid, map)
}

fn write_gid_map(pid: c_int, map: &IdMap, real_gid: u32) -> Result<()> {
    if map.is_self_only(real_gid) {
        debug!("writing gid_map");
        std::fs::write(format!("/proc/{pid}/setgroups"), "deny\n")
            .map_err(|e| Error::from(e).context("failed to disable setgroups"))?;
        return std::fs::write(
            format!("/proc/{pid}/gid_map"),
            map.into_idmap_file_contents(),
        )
        .map_err(|e| Error::from(e).context("failed to write gid_map"));
    }
    run_helper(NEWGIDMAP, pid, map)
}

fn run_helper(helper: &str, pid: c_int, map: &IdMap) -> Result<()> {
    let args = map.helper_args();
    debug!(helper, ?args, "running id map helper");
    let status = Command::new(helper)
        .arg(pid.to_string())
        .args(&args)
        .status()
        .map_err(|e| Error::from(e).context("failed to run id map helper"))?;
    if !status.success() {
        debug!(helper, %status, "id map helper failed");
        bail!(ErrorKind::System, "id map helper exited unsuccessfully");
    }
    Ok(())
}

fn join_user_namespace(pid: c_int) -> Result<()> {
    let ns = std::fs::File::open(format!("/proc/{pid}/ns/user"))
        .map_err(|e| Error::from(e).context("failed to open user namespace"))?;
    let 0 = (unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWUSER) }) else {
        bail_errno!(ErrorKind::System, "failed to join user namespace");
    };
    Ok(())
}
