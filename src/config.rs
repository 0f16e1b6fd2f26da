//! Sandbox configuration and its default values.

use serde::Serialize;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::id_map::IdMapping;

/// A malformed or out-of-range configuration value. Raised before any process is spawned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no command given")]
    EmptyCommand,

    #[error("{what} contains an interior NUL: {value:?}")]
    InteriorNul { what: &'static str, value: String },

    #[error("--{option} expects a value of the form a:b, got {value:?}")]
    MalformedPair { option: &'static str, value: String },

    #[error("environment entry must be KEY=VALUE, got {0:?}")]
    MalformedEnv(String),

    #[error("{0} limit must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("open file limit must be at least 3, got {0}")]
    TooFewOpenFiles(u64),

    #[error("{0} cannot be mapped to host id 0")]
    RootIdentity(&'static str),

    #[error("mount destination must be absolute: {0:?}")]
    RelativeDestination(PathBuf),

    #[error("chroot must not be the host root")]
    HostRootChroot,
}

/// Resource ceilings applied to the jailed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Limits {
    /// CPU time, enforced with `RLIMIT_CPU` (whole seconds).
    pub cpu_time: Duration,
    /// Wall-clock time, enforced by the watchdog.
    pub real_time: Duration,
    /// Memory plus swap, in bytes, enforced by the memory accounting group.
    pub memory: u64,
    /// Largest file the payload may write, in bytes (`RLIMIT_FSIZE`).
    pub output: u64,
    /// Number of processes, enforced by the pids accounting group.
    pub processes: u64,
    /// Number of open file descriptors (`RLIMIT_NOFILE`).
    pub open_files: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            cpu_time: Duration::from_secs(3),
            real_time: Duration::from_secs(10),
            memory: 32 * 1024 * 1024,
            output: 10 * 1024 * 1024,
            processes: 16,
            open_files: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MountKind {
    ReadOnlyBind,
    ReadWriteBind,
    Tmpfs,
}

/// One entry of the mount plan. `dest` is relative to the jail's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub options: String,
}

impl MountSpec {
    pub fn ro_bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> MountSpec {
        MountSpec {
            kind: MountKind::ReadOnlyBind,
            source: source.into(),
            dest: dest.into(),
            options: String::new(),
        }
    }

    pub fn rw_bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> MountSpec {
        MountSpec {
            kind: MountKind::ReadWriteBind,
            source: source.into(),
            dest: dest.into(),
            options: String::new(),
        }
    }

    pub fn tmpfs(dest: impl Into<PathBuf>, options: impl Into<String>) -> MountSpec {
        MountSpec {
            kind: MountKind::Tmpfs,
            source: PathBuf::new(),
            dest: dest.into(),
            options: options.into(),
        }
    }
}

/// A symlink created inside the jail: `link` points at `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symlink {
    pub link: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Uts {
    pub hostname: String,
    pub domainname: String,
}

/// Where the per-run accounting groups are created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CgroupConfig {
    /// Mount point of the cgroup v1 hierarchies, e.g. `/sys/fs/cgroup`.
    pub root: PathBuf,
    /// Delegated group under each subsystem that per-run groups are created in.
    pub parent: String,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        CgroupConfig {
            root: PathBuf::from("/sys/fs/cgroup"),
            parent: "stockade".to_owned(),
        }
    }
}

/// Everything a sandbox run needs. Immutable once handed to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub limits: Limits,

    /// Identity the payload runs as.
    pub uid: IdMapping,
    pub gid: IdMapping,

    pub ro_binds: Vec<MountSpec>,
    pub rw_binds: Vec<MountSpec>,
    pub tmpfs: Vec<MountSpec>,
    pub symlinks: Vec<Symlink>,

    pub uts: Uts,
    pub env: Vec<String>,
    pub argv: Vec<String>,

    /// Host directory backing the jail's root. Created if missing and removed after the run.
    pub chroot: PathBuf,
    /// Working directory of the payload, inside the jail.
    pub working_dir: PathBuf,

    pub stdin_fd: Option<RawFd>,
    pub stdout_fd: Option<RawFd>,
    pub stderr_fd: Option<RawFd>,

    pub cgroup: CgroupConfig,
}

impl Default for Config {
    fn default() -> Self {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Config {
            limits: Limits::default(),
            uid: IdMapping::one(uid, 0),
            gid: IdMapping::one(gid, 0),
            ro_binds: ["/bin", "/lib", "/lib64", "/usr/bin", "/usr/lib", "/usr/lib64"]
                .into_iter()
                .map(|p| MountSpec::ro_bind(p, p))
                .collect(),
            rw_binds: ["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"]
                .into_iter()
                .map(|p| MountSpec::rw_bind(p, p))
                .collect(),
            tmpfs: vec![
                MountSpec::tmpfs("/run", "mode=755,size=16777216"),
                MountSpec::tmpfs("/tmp", "mode=777,size=16777216"),
            ],
            symlinks: [
                ("/dev/stdin", "/proc/self/fd/0"),
                ("/dev/stdout", "/proc/self/fd/1"),
                ("/dev/stderr", "/proc/self/fd/2"),
            ]
            .into_iter()
            .map(|(link, target)| Symlink {
                link: link.into(),
                target: target.into(),
            })
            .collect(),
            uts: Uts {
                hostname: "stockade".to_owned(),
                domainname: "stockade".to_owned(),
            },
            env: vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:.".to_owned(),
            ],
            argv: Vec::new(),
            chroot: std::env::temp_dir().join(format!("stockade{}", std::process::id())),
            working_dir: PathBuf::from("/"),
            stdin_fd: None,
            stdout_fd: None,
            stderr_fd: None,
            cgroup: CgroupConfig::default(),
        }
    }
}

impl Config {
    /// Check every value the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.argv.is_empty() || self.argv[0].is_empty() {
            return Err(ConfigError::EmptyCommand);
        }

        let limits = &self.limits;
        if limits.cpu_time.as_secs() == 0 {
            return Err(ConfigError::ZeroLimit("cpu time"));
        }
        if limits.real_time.is_zero() {
            return Err(ConfigError::ZeroLimit("real time"));
        }
        if limits.memory == 0 {
            return Err(ConfigError::ZeroLimit("memory"));
        }
        if limits.output == 0 {
            return Err(ConfigError::ZeroLimit("output"));
        }
        if limits.processes == 0 {
            return Err(ConfigError::ZeroLimit("process"));
        }
        if limits.open_files < 3 {
            return Err(ConfigError::TooFewOpenFiles(limits.open_files));
        }

        let mounts = self.ro_binds.iter().chain(&self.rw_binds).chain(&self.tmpfs);
        for dest in mounts
            .map(|m| &m.dest)
            .chain(self.symlinks.iter().map(|s| &s.link))
        {
            if !dest.is_absolute() {
                return Err(ConfigError::RelativeDestination(dest.clone()));
            }
        }

        if let Some(bad) = self.env.iter().find(|e| !e.contains('=')) {
            return Err(ConfigError::MalformedEnv(bad.clone()));
        }

        if self.chroot == Path::new("/") {
            return Err(ConfigError::HostRootChroot);
        }

        Ok(())
    }
}

/// Split a `a:b` option value at the first colon. Both halves must be non-empty.
pub fn parse_pair(option: &'static str, value: &str) -> Result<(String, String), ConfigError> {
    match value.split_once(':') {
        Some((a, b)) if !a.is_empty() && !b.is_empty() => Ok((a.to_owned(), b.to_owned())),
        _ => Err(ConfigError::MalformedPair {
            option,
            value: value.to_owned(),
        }),
    }
}

/// Resolve the host id the payload runs as. The caller's own id becomes 0 inside the jail, and any
/// other id becomes 1. Host id 0 is refused.
pub fn identity(what: &'static str, outside_id: u32, own_id: u32) -> Result<IdMapping, ConfigError> {
    if outside_id == 0 {
        return Err(ConfigError::RootIdentity(what));
    }
    let inside_id = if outside_id == own_id { 0 } else { 1 };
    Ok(IdMapping::one(outside_id, inside_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable() -> Config {
        Config {
            argv: vec!["/bin/echo".into(), "hi".into()],
            ..Config::default()
        }
    }

    #[test]
    fn defaults_match_the_documented_table() {
        let config = Config::default();
        assert_eq!(config.limits.cpu_time, Duration::from_secs(3));
        assert_eq!(config.limits.real_time, Duration::from_secs(10));
        assert_eq!(config.limits.memory, 32 * 1024 * 1024);
        assert_eq!(config.limits.output, 10 * 1024 * 1024);
        assert_eq!(config.limits.processes, 16);
        assert_eq!(config.limits.open_files, 16);
        assert_eq!(config.ro_binds.len(), 6);
        assert_eq!(config.rw_binds.len(), 4);
        assert_eq!(config.tmpfs[1].dest, PathBuf::from("/tmp"));
        assert_eq!(config.symlinks[0].target, PathBuf::from("/proc/self/fd/0"));
        assert_eq!(config.uid.inside_id, 0);
        assert_eq!(config.working_dir, PathBuf::from("/"));
    }

    #[test]
    fn default_config_with_command_is_valid() {
        assert_eq!(runnable().validate(), Ok(()));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert_eq!(Config::default().validate(), Err(ConfigError::EmptyCommand));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = runnable();
        config.limits.memory = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroLimit("memory")));

        let mut config = runnable();
        config.limits.cpu_time = Duration::from_millis(500);
        assert_eq!(config.validate(), Err(ConfigError::ZeroLimit("cpu time")));

        let mut config = runnable();
        config.limits.open_files = 2;
        assert_eq!(config.validate(), Err(ConfigError::TooFewOpenFiles(2)));
    }

    #[test]
    fn relative_destinations_are_rejected() {
        let mut config = runnable();
        config.rw_binds.push(MountSpec::rw_bind("/srv", "srv"));
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelativeDestination("srv".into()))
        );
    }

    #[test]
    fn env_without_equals_is_rejected() {
        let mut config = runnable();
        config.env.push("JUSTAKEY".into());
        assert_eq!(
            config.validate(),
            Err(ConfigError::MalformedEnv("JUSTAKEY".into()))
        );
    }

    #[test]
    fn host_root_chroot_is_rejected() {
        let mut config = runnable();
        config.chroot = "/".into();
        assert_eq!(config.validate(), Err(ConfigError::HostRootChroot));
    }

    #[test]
    fn parse_pair_splits_at_first_colon() {
        assert_eq!(
            parse_pair("ro", "/a:/b:c").unwrap(),
            ("/a".to_owned(), "/b:c".to_owned())
        );
        assert!(matches!(
            parse_pair("ro", "/a"),
            Err(ConfigError::MalformedPair { option: "ro", .. })
        ));
        assert!(parse_pair("tmpfs", ":/b").is_err());
        assert!(parse_pair("tmpfs", "/a:").is_err());
    }

    #[test]
    fn identity_maps_own_id_to_root_and_others_to_one() {
        assert_eq!(identity("uid", 1000, 1000).unwrap(), IdMapping::one(1000, 0));
        assert_eq!(identity("uid", 1001, 1000).unwrap(), IdMapping::one(1001, 1));
        assert_eq!(
            identity("gid", 0, 1000),
            Err(ConfigError::RootIdentity("gid"))
        );
    }
}
