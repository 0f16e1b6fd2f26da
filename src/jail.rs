use alloc_counter::no_alloc;
use std::ffi::{c_char, c_int, CString};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use tracing::{debug, error, span, Level};

use crate::channel::{channel, report_channel, Channel, Message, Report, ReportSender};
use crate::clone::{self, Stack, JAILED_STACK_SIZE, JAIL_STACK_SIZE, WATCHDOG_STACK_SIZE};
use crate::config::{CgroupConfig, Config, ConfigError, Limits};
use crate::error::{bail, bail_errno, Error, ErrorKind, Result};
use crate::libc_util::{eventfd, socket_pair, waitpid, ExitStatus};
use crate::logging::{log_fd, spawn_log_forwarder};
use crate::mount_table::MountPlan;
use crate::resource_group::ResourceGroup;
use crate::result::{SandboxResult, TimeUsage};
use crate::rootfs;
use crate::timer::Timer;
use crate::watchdog::{self, Verdict, Watchdog, SUPERVISION_FAILED_EXIT_CODE};

/// Namespaces the jailed process unshares for itself. The PID namespace comes from the jail
/// process, which is its init.
const JAILED_NAMESPACES: c_int = libc::CLONE_NEWNS
    | libc::CLONE_NEWUTS
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWCGROUP;

/// Exit code of a jailed process that could not isolate itself.
const SETUP_FAILED_EXIT_CODE: c_int = 1;

/// Exit code of a jailed process whose `execvpe(3)` failed.
const EXEC_FAILED_EXIT_CODE: c_int = 127;

/// A sandbox, resolved from a [`Config`] and ready to run.
///
/// Everything the jail process and the jailed process need is converted to C strings up-front:
/// both are cloned from a possibly multi-threaded process, and cannot allocate.
#[derive(Debug)]
pub struct Jail {
    plan: MountPlan,
    working_dir: CString,
    hostname: CString,
    domainname: CString,

    argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp: Vec<CString>,
    envp_ptrs: Vec<*const c_char>,

    limits: Limits,
    uid: u32,
    gid: u32,
    stdio: [Option<RawFd>; 3],
    cgroup: CgroupConfig,

    /// Spin for this long before reporting `Ready`, to stand in for a slow setup.
    #[cfg(test)]
    setup_burn: Option<std::time::Duration>,
}

impl Jail {
    /// Validate `config` and resolve it into a runnable sandbox.
    pub fn new(config: &Config) -> std::result::Result<Jail, ConfigError> {
        config.validate()?;

        let argv = to_cstrings("argument", &config.argv)?;
        let envp = to_cstrings("environment entry", &config.env)?;
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        Ok(Jail {
            plan: MountPlan::from_config(config)?,
            working_dir: CString::new(config.working_dir.as_os_str().as_bytes()).map_err(|_| {
                ConfigError::InteriorNul {
                    what: "working directory",
                    value: config.working_dir.to_string_lossy().into_owned(),
                }
            })?,
            hostname: to_cstring("hostname", &config.uts.hostname)?,
            domainname: to_cstring("domainname", &config.uts.domainname)?,
            argv,
            argv_ptrs,
            envp,
            envp_ptrs,
            limits: config.limits,
            uid: config.uid.inside_id,
            gid: config.gid.inside_id,
            stdio: [config.stdin_fd, config.stdout_fd, config.stderr_fd],
            cgroup: config.cgroup.clone(),
            #[cfg(test)]
            setup_burn: None,
        })
    }

    /// The command the payload runs.
    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    pub fn envp(&self) -> &[CString] {
        &self.envp
    }

    /// Run the payload to completion and collect its result.
    ///
    /// A payload that exits non-zero, or is killed for exceeding a limit, is still an `Ok`
    /// result. Errors are failures of the sandbox itself; a jailed process that could not isolate
    /// itself shows up as [`ErrorKind::Mount`].
    pub fn run(&self) -> Result<SandboxResult> {
        let span = span!(Level::DEBUG, "sandbox");
        let _span_guard = span.enter();

        let (inside, outside) = channel()?;
        let disarm = eventfd().map_err(|e| e.context("creating disarm eventfd"))?;
        let oom = eventfd().map_err(|e| e.context("creating OOM eventfd"))?;
        let group = ResourceGroup::create(&self.cgroup)?;
        group.register_oom_notification(&oom)?;
        debug!(group = group.name(), "created resource group");

        let (report_tx, report_rx) = report_channel()?;

        // Create the jail process's log stream.
        let (jail_log_tx, jail_log_rx) = socket_pair(libc::SOCK_STREAM)
            .map_err(|e| e.context("creating log stream for jail process"))?;
        let jail_span = span!(Level::DEBUG, "jail");
        let jail_forwarder = spawn_log_forwarder(jail_span.clone(), jail_log_rx);

        // Create the jailed process's log stream.
        let (jailed_log_tx, jailed_log_rx) = socket_pair(libc::SOCK_STREAM)
            .map_err(|e| e.context("creating log stream for jailed process"))?;
        let jailed_span = span!(parent: &jail_span, Level::DEBUG, "jailed");
        let jailed_forwarder = spawn_log_forwarder(jailed_span, jailed_log_rx);

        let run = Run {
            jail: self,
            group,
            inside,
            outside,
            disarm,
            oom,
            report: report_tx,
            jail_log: jail_log_tx,
            jailed_log: jailed_log_tx,
        };
        let mut stacks = Stacks {
            jailed: Stack::new(JAILED_STACK_SIZE),
            watchdog: Stack::new(WATCHDOG_STACK_SIZE),
        };

        let mut stack = Stack::new(JAIL_STACK_SIZE);
        let mut entry = || run.jail_process(&mut stacks);
        let jail_pid = unsafe { clone::spawn(&mut stack, libc::CLONE_NEWPID, &mut entry) }
            .map_err(|e| e.context("spawning jail process"))?;
        debug!(jail_pid, "spawned jail process");

        // Close our copies of every descriptor the children use, so the log forwarders see EOF
        // once the children are gone.
        let group = run.into_group();

        let report = report_rx.recv();
        let status = waitpid(jail_pid, libc::__WALL)
            .map_err(|e| e.context("waiting for jail process"))?;
        debug!(?status, "jail process exited");

        let _ = jail_forwarder.join();
        let _ = jailed_forwarder.join();
        drop(group);

        if let ExitStatus::Signal(signal) = status {
            error!(signal, "jail process was killed");
            bail!(
                ErrorKind::UnexpectedTermination,
                "jail process was killed by a signal"
            );
        }

        let result = report.and_then(Report::into_result)?;
        debug!(?result, "collected result");
        Ok(result)
    }
}

/// The kernel objects of one run. A copy lives in the jail process, and another in the jailed
/// process until it execs.
struct Run<'a> {
    jail: &'a Jail,
    group: ResourceGroup,

    /// Handshake endpoint used by the jailed process.
    inside: Channel,
    /// Handshake endpoint used by the jail process.
    outside: Channel,

    disarm: OwnedFd,
    oom: OwnedFd,
    report: ReportSender,

    jail_log: OwnedFd,
    jailed_log: OwnedFd,
}

/// Stacks for the processes the jail process clones. The jail process cannot allocate them
/// itself.
struct Stacks {
    jailed: Stack,
    watchdog: Stack,
}

impl Run<'_> {
    fn into_group(self) -> ResourceGroup {
        self.group
    }

    /// Entrypoint of the jail process: PID 1 of the sandbox's PID namespace.
    #[cfg_attr(debug_assertions, no_alloc)]
    fn jail_process(&self, stacks: &mut Stacks) -> c_int {
        let lfd = self.jail_log.as_raw_fd();

        let report = match self.supervise(stacks) {
            Ok(result) => Report::completed(result),
            Err(e) => {
                log_fd!(lfd, "error: {}", e);
                Report::failed(e)
            }
        };

        match self.report.send(report) {
            Ok(()) => 0,
            Err(e) => {
                log_fd!(lfd, "failed to send report: {}", e);
                1
            }
        }
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    fn supervise(&self, stacks: &mut Stacks) -> Result<SandboxResult> {
        let lfd = self.jail_log.as_raw_fd();
        let limits = self.jail.limits;

        let (pid, uid, gid) = unsafe { (libc::getpid(), libc::getuid(), libc::getgid()) };
        log_fd!(lfd, "pid={pid} uid={uid} gid={gid}");

        // Not `fork(3)`: its atfork handlers take locks a controller thread may have held when
        // this process was cloned.
        let mut jailed_entry = || -> c_int { self.jailed_process() };
        let jailed_pid = unsafe { clone::spawn(&mut stacks.jailed, 0, &mut jailed_entry) }
            .map_err(|e| e.context("spawning jailed process"))?;
        log_fd!(lfd, "jailed_pid={jailed_pid}");

        let mut timer = Timer::new();

        if let Err(e) = self.await_ready(jailed_pid) {
            abort(jailed_pid);
            return Err(e);
        }
        if let Err(e) = self.group.reset_accounting() {
            abort(jailed_pid);
            return Err(e);
        }

        // The watchdog gets its own copy of our memory (and of `errno`); it reaches us only
        // through the eventfds and its exit status.
        let watchdog = Watchdog::new(self.disarm.as_fd(), self.oom.as_fd(), limits.real_time);
        let mut entry = || match watchdog.supervise(jailed_pid) {
            Ok(verdict) => verdict.exit_code(),
            Err(e) => {
                log_fd!(lfd, "watchdog: {}", e);
                SUPERVISION_FAILED_EXIT_CODE
            }
        };
        let watchdog_pid = match unsafe { clone::spawn(&mut stacks.watchdog, 0, &mut entry) } {
            Ok(pid) => pid,
            Err(e) => {
                abort(jailed_pid);
                return Err(e.context("spawning watchdog"));
            }
        };
        log_fd!(lfd, "watchdog_pid={watchdog_pid}");

        timer.reset();
        let sent = self.outside.send(Message::Run);
        if sent.is_err() {
            unsafe { libc::kill(jailed_pid, libc::SIGKILL) };
        }

        let status = waitpid(jailed_pid, 0);
        let real = timer.elapsed();

        // Only disarm once the payload is reaped.
        let disarmed = watchdog::disarm(self.disarm.as_fd());
        let verdict = waitpid(watchdog_pid, 0).and_then(Verdict::from_exit_status);

        sent?;
        let status = status.map_err(|e| e.context("waiting for jailed process"))?;
        disarmed?;
        let verdict = verdict?;
        log_fd!(lfd, "jailed process exited: {:?}, watchdog: {:?}", status, verdict);

        let time = TimeUsage {
            sys: self.group.read_cpu_sys_ns()?,
            usr: self.group.read_cpu_user_ns()?,
            real,
        };
        let memory = self.group.read_peak_memory_bytes()?;
        let (return_code, signal) = match status {
            ExitStatus::Code(code) => (code, 0),
            ExitStatus::Signal(signal) => (0, signal),
        };

        Ok(SandboxResult {
            time,
            memory,
            return_code,
            signal,
        })
    }

    /// Arm the resource group around the jailed process, then wait for it to finish isolating
    /// itself.
    #[cfg_attr(debug_assertions, no_alloc)]
    fn await_ready(&self, jailed_pid: libc::pid_t) -> Result<()> {
        let limits = self.jail.limits;
        self.group.attach(jailed_pid)?;
        self.group.set_memory_limit(limits.memory)?;
        self.group.set_process_limit(limits.processes)?;

        match self.outside.recv()? {
            Message::Ready => Ok(()),
            Message::Error => bail!(
                ErrorKind::Mount,
                "jailed process failed to isolate itself"
            ),
            Message::Run => bail!(ErrorKind::Channel, "unexpected handshake message"),
        }
    }

    /// Entrypoint of the jailed process. Never returns: it either becomes the payload or exits.
    fn jailed_process(&self) -> ! {
        let lfd = self.jailed_log.as_raw_fd();

        if let Err(e) = self.isolate() {
            log_fd!(lfd, "error: {}", e);
            let _ = self.inside.send(Message::Error);
            unsafe { libc::_exit(SETUP_FAILED_EXIT_CODE) };
        }

        let jail = self.jail;
        unsafe { libc::execvpe(jail.argv_ptrs[0], jail.argv_ptrs.as_ptr(), jail.envp_ptrs.as_ptr()) };
        log_fd!(
            lfd,
            "execvpe failed: {}",
            Error::last_os_error(ErrorKind::System)
        );
        unsafe { libc::_exit(EXEC_FAILED_EXIT_CODE) }
    }

    /// Isolate the jailed process, then perform its half of the handshake.
    #[cfg_attr(debug_assertions, no_alloc)]
    fn isolate(&self) -> Result<()> {
        let jail = self.jail;
        let lfd = self.jailed_log.as_raw_fd();

        let pid = unsafe { libc::getpid() };
        log_fd!(lfd, "pid={pid}");

        let 0 = (unsafe { libc::unshare(JAILED_NAMESPACES) }) else {
            bail_errno!(ErrorKind::Mount, "unshare failed");
        };

        rootfs::build(&jail.plan, &jail.working_dir, lfd)?;

        let hostname = jail.hostname.as_bytes();
        let 0 = (unsafe { libc::sethostname(hostname.as_ptr().cast(), hostname.len()) }) else {
            bail_errno!(ErrorKind::Mount, "sethostname failed");
        };
        let domainname = jail.domainname.as_bytes();
        let 0 = (unsafe { libc::setdomainname(domainname.as_ptr().cast(), domainname.len()) })
        else {
            bail_errno!(ErrorKind::Mount, "setdomainname failed");
        };

        for (target, fd) in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]
            .into_iter()
            .zip(jail.stdio)
        {
            let Some(fd) = fd else {
                continue;
            };
            log_fd!(lfd, "redirecting fd {target} to fd {fd}");
            redirect(fd, target)?;
        }

        // Group first: once the uid is dropped, we may no longer change it.
        let 0 = (unsafe { libc::setgid(jail.gid) }) else {
            bail_errno!(ErrorKind::Mount, "setgid failed");
        };
        let 0 = (unsafe { libc::setuid(jail.uid) }) else {
            bail_errno!(ErrorKind::Mount, "setuid failed");
        };
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        log_fd!(lfd, "after setgid/setuid: uid={uid} gid={gid}");

        let limits = jail.limits;
        set_rlimit(libc::RLIMIT_CPU, limits.cpu_time.as_secs())?;
        set_rlimit(libc::RLIMIT_FSIZE, limits.output)?;
        set_rlimit(libc::RLIMIT_NOFILE, limits.open_files)?;

        #[cfg(test)]
        if let Some(burn) = jail.setup_burn {
            let timer = Timer::new();
            let burn_ns = burn.as_nanos() as u64;
            while timer.elapsed() < burn_ns {
                std::hint::spin_loop();
            }
        }

        self.inside.send(Message::Ready)?;
        match self.inside.recv()? {
            Message::Run => Ok(()),
            _ => bail!(ErrorKind::Channel, "expected run message"),
        }
    }
}

/// Kill and reap the jailed process after a failed setup.
#[cfg_attr(debug_assertions, no_alloc)]
fn abort(jailed_pid: libc::pid_t) {
    unsafe { libc::kill(jailed_pid, libc::SIGKILL) };
    let _ = waitpid(jailed_pid, 0);
}

/// Make `target` refer to `fd`, and survive `execve(2)`.
///
/// `dup2(2)` is a no-op when both are the same descriptor, which would leave a close-on-exec flag
/// in place; clear it instead.
#[cfg_attr(debug_assertions, no_alloc)]
fn redirect(fd: RawFd, target: RawFd) -> Result<()> {
    if fd != target {
        let 0.. = (unsafe { libc::dup2(fd, target) }) else {
            bail_errno!(ErrorKind::Mount, "dup2 failed");
        };
        return Ok(());
    }

    let flags @ 0.. = (unsafe { libc::fcntl(fd, libc::F_GETFD) }) else {
        bail_errno!(ErrorKind::Mount, "fcntl(F_GETFD) failed");
    };
    let 0 = (unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) }) else {
        bail_errno!(ErrorKind::Mount, "fcntl(F_SETFD) failed");
    };
    Ok(())
}

#[cfg_attr(debug_assertions, no_alloc)]
fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    let 0 = (unsafe { libc::setrlimit(resource, &limit) }) else {
        bail_errno!(ErrorKind::Mount, "setrlimit failed");
    };
    Ok(())
}

fn to_cstring(what: &'static str, value: &str) -> std::result::Result<CString, ConfigError> {
    CString::new(value).map_err(|_| ConfigError::InteriorNul {
        what,
        value: value.to_owned(),
    })
}

fn to_cstrings(
    what: &'static str,
    values: &[String],
) -> std::result::Result<Vec<CString>, ConfigError> {
    values.iter().map(|v| to_cstring(what, v)).collect()
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}
