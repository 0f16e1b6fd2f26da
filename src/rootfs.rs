use alloc_counter::no_alloc;
use c_str_macro::c_str;
use std::ffi::{c_char, CStr};
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::ptr;

use crate::config::MountKind;
use crate::error::{bail_errno, ErrorKind, Result};
use crate::libc_util::{mkdirp, mkdirp_parent, touch};
use crate::logging::log_fd;
use crate::mount_table::{Mount, MountPlan, MountpointType};

/// Build the jail's root filesystem from `plan`, switch into it, and `chdir` to `working_dir`.
///
/// Must run inside a fresh mount namespace. Any failure is reported as [`ErrorKind::Mount`];
/// mounts made before the failure are left for the namespace teardown to discard.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn build(plan: &MountPlan, working_dir: &CStr, lfd: RawFd) -> Result<()> {
    build_inner(plan, working_dir, lfd).map_err(|e| e.kind(ErrorKind::Mount))
}

#[cfg_attr(debug_assertions, no_alloc)]
fn build_inner(plan: &MountPlan, working_dir: &CStr, lfd: RawFd) -> Result<()> {
    let root = plan.root();

    // Keep our mounts from propagating back to the host.
    mount(
        None,
        c_str!("/"),
        None,
        libc::MS_PRIVATE | libc::MS_REC,
        None,
    )
    .map_err(|e| e.cause("remounting root as recursive private failed"))?;

    // Back the new root with a size-bounded tmpfs.
    mkdirp(root).map_err(|e| e.context("creating jail root"))?;
    mount(
        Some(c_str!("tmpfs")),
        root,
        Some(c_str!("tmpfs")),
        0,
        Some(c_str!("size=16777216")),
    )
    .map_err(|e| e.cause("mounting tmpfs on jail root failed"))?;
    log_fd!(lfd, "mounted tmpfs on {:?}", root);

    for entry in &plan.mounts {
        apply_mount(entry, lfd)?;
    }

    for link in &plan.symlinks {
        mkdirp_parent(&link.link).map_err(|e| e.context("creating symlink parent"))?;
        let 0 = (unsafe { libc::symlink(link.target.as_ptr(), link.link.as_ptr()) }) else {
            bail_errno!(ErrorKind::Mount, "symlink failed");
        };
        log_fd!(lfd, "symlinked {:?} -> {:?}", link.link, link.target);
    }

    mkdirp(&plan.proc_target).map_err(|e| e.context("creating /proc mountpoint"))?;
    mount(
        Some(c_str!("proc")),
        &plan.proc_target,
        Some(c_str!("proc")),
        libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NODEV,
        None,
    )
    .map_err(|e| e.cause("mounting proc failed"))?;

    // Switch roots, parking the old one under the new root until it's detached.
    mkdirp(&plan.put_old).map_err(|e| e.context("creating old root mountpoint"))?;
    let 0 = (unsafe { libc::syscall(libc::SYS_pivot_root, root.as_ptr(), plan.put_old.as_ptr()) })
    else {
        bail_errno!(ErrorKind::Mount, "pivot_root failed");
    };
    chdir(c_str!("/"))?;
    let 0 = (unsafe { libc::umount2(c_str!("/putold").as_ptr(), libc::MNT_DETACH) }) else {
        bail_errno!(ErrorKind::Mount, "failed to detach old root");
    };
    let 0 = (unsafe { libc::rmdir(c_str!("/putold").as_ptr()) }) else {
        bail_errno!(ErrorKind::Mount, "failed to remove old root mountpoint");
    };
    log_fd!(lfd, "pivoted into {:?}", root);

    mount(
        None,
        c_str!("/"),
        None,
        libc::MS_REMOUNT | libc::MS_REC | libc::MS_RDONLY | libc::MS_NOSUID,
        None,
    )
    .map_err(|e| e.cause("remounting new root read-only failed"))?;

    chdir(working_dir)?;
    log_fd!(lfd, "working directory is {:?}", working_dir);

    Ok(())
}

#[cfg_attr(debug_assertions, no_alloc)]
fn apply_mount(entry: &Mount, lfd: RawFd) -> Result<()> {
    match entry.mountpoint {
        MountpointType::Dir => {
            mkdirp(&entry.target).map_err(|e| e.context("creating directory mountpoint"))?;
        }
        MountpointType::File => {
            mkdirp_parent(&entry.target).map_err(|e| e.context("creating file mountpoint"))?;
            touch(&entry.target).map_err(|e| e.context("creating file mountpoint"))?;
        }
    }

    if entry.kind == MountKind::Tmpfs {
        log_fd!(lfd, "mounting tmpfs on {:?} with {:?}", entry.target, entry.data);
        return mount(
            Some(entry.source.as_c_str()),
            &entry.target,
            Some(c_str!("tmpfs")),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            Some(entry.data.as_c_str()),
        )
        .map_err(|e| e.cause("tmpfs mount failed"));
    }

    log_fd!(lfd, "binding {:?} on {:?}", entry.source, entry.target);
    mount(
        Some(entry.source.as_c_str()),
        &entry.target,
        None,
        libc::MS_BIND | libc::MS_REC,
        None,
    )
    .map_err(|e| e.cause("bind mount failed"))?;

    // A bind remount must repeat any flag the kernel locked on the source, or it fails with EPERM.
    let mut flags = libc::MS_REMOUNT | libc::MS_BIND | libc::MS_REC | libc::MS_NOSUID;
    flags |= locked_flags(&entry.target)?;
    if entry.kind == MountKind::ReadOnlyBind {
        flags |= libc::MS_RDONLY;
    }
    mount(None, &entry.target, None, flags, None).map_err(|e| e.cause("bind remount failed"))
}

/// The mount flags currently in effect on the filesystem holding `path`, restricted to the ones
/// that an unprivileged remount may not clear.
#[cfg_attr(debug_assertions, no_alloc)]
fn locked_flags(path: &CStr) -> Result<libc::c_ulong> {
    let mut buf = MaybeUninit::<libc::statvfs>::uninit();
    let 0 = (unsafe { libc::statvfs(path.as_ptr(), buf.as_mut_ptr()) }) else {
        bail_errno!(ErrorKind::Mount, "statvfs on bind mount failed");
    };
    let f_flag = unsafe { buf.assume_init() }.f_flag;

    let mut flags = 0;
    for (st, ms) in [
        (libc::ST_RDONLY, libc::MS_RDONLY),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ] {
        if f_flag & st != 0 {
            flags |= ms;
        }
    }
    Ok(flags)
}

#[cfg_attr(debug_assertions, no_alloc)]
fn mount(
    source: Option<&CStr>,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
    data: Option<&CStr>,
) -> Result<()> {
    let as_ptr = |s: Option<&CStr>| -> *const c_char { s.map_or(ptr::null(), CStr::as_ptr) };
    let 0 = (unsafe {
        libc::mount(
            as_ptr(source),
            target.as_ptr(),
            as_ptr(fstype),
            flags,
            as_ptr(data).cast(),
        )
    }) else {
        bail_errno!(ErrorKind::Mount);
    };
    Ok(())
}

#[cfg_attr(debug_assertions, no_alloc)]
fn chdir(path: &CStr) -> Result<()> {
    let 0 = (unsafe { libc::chdir(path.as_ptr()) }) else {
        bail_errno!(ErrorKind::Mount, "chdir failed");
    };
    Ok(())
}
