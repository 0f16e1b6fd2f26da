use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{CgroupConfig, Config, ConfigError, Limits, MountSpec, Symlink};
use crate::error::Error;
use crate::id_map::IdMapping;
use crate::jail::Jail;
use crate::result::SandboxResult;

/// Why a [`Command`] could not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("sandbox failed: {0}")]
    Engine(#[from] Error),

    #[error("failed to create chroot directory {path:?}: {source}")]
    Chroot {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A command to be run inside the sandbox.
///
/// Starts from [`Config::default`], so a bare `Command::new("echo").arg("hi").run()` gets the
/// default limits, binds and environment.
#[derive(Debug)]
pub struct Command {
    config: Config,

    // Held open until the run finishes; the config only carries their numbers.
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

impl Command {
    /// Create a new command for the given program, which is resolved through `PATH` inside the
    /// jail.
    pub fn new(program: impl AsRef<str>) -> Command {
        Command::with_config(Config {
            argv: vec![program.as_ref().to_owned()],
            ..Config::default()
        })
    }

    /// Create a command from a complete configuration. `config.argv` holds the program and its
    /// arguments.
    pub fn with_config(config: Config) -> Command {
        Command {
            config,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Adds an argument to pass to the program.
    pub fn arg(&mut self, arg: impl AsRef<str>) -> &mut Command {
        self.config.argv.push(arg.as_ref().to_owned());
        self
    }

    /// Adds multiple arguments to pass to the program.
    pub fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<str>>) -> &mut Command {
        let args_iter = args.into_iter().map(|e| e.as_ref().to_owned());
        self.config.argv.extend(args_iter);
        self
    }

    /// Sets an environment variable, replacing any earlier value for the same key.
    pub fn env(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> &mut Command {
        let key = key.as_ref();
        self.env_remove(key);
        self.config.env.push(format!("{key}={}", value.as_ref()));
        self
    }

    /// Sets several environment variables.
    pub fn envs(
        &mut self,
        envs: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    ) -> &mut Command {
        for (k, v) in envs {
            self.env(k, v);
        }
        self
    }

    /// Removes an environment variable, including one from the default environment.
    pub fn env_remove(&mut self, key: impl AsRef<str>) -> &mut Command {
        let key = key.as_ref();
        self.config
            .env
            .retain(|e| e.split_once('=').map_or(true, |(k, _)| k != key));
        self
    }

    /// Clear the environment, including the default `PATH`.
    pub fn env_clear(&mut self) -> &mut Command {
        self.config.env.clear();
        self
    }

    /// Sets every resource ceiling at once.
    pub fn limits(&mut self, limits: Limits) -> &mut Command {
        self.config.limits = limits;
        self
    }

    /// Sets the user the payload runs as.
    pub fn uid(&mut self, mapping: IdMapping) -> &mut Command {
        self.config.uid = mapping;
        self
    }

    /// Sets the group the payload runs as.
    pub fn gid(&mut self, mapping: IdMapping) -> &mut Command {
        self.config.gid = mapping;
        self
    }

    /// Bind-mount a host path read-only into the jail.
    pub fn bind_ro(&mut self, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> &mut Command {
        self.config.ro_binds.push(MountSpec::ro_bind(source, dest));
        self
    }

    /// Bind-mount a host path read-write into the jail.
    pub fn bind_rw(&mut self, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> &mut Command {
        self.config.rw_binds.push(MountSpec::rw_bind(source, dest));
        self
    }

    /// Mount a fresh tmpfs inside the jail.
    pub fn tmpfs(&mut self, dest: impl Into<PathBuf>, options: impl Into<String>) -> &mut Command {
        self.config.tmpfs.push(MountSpec::tmpfs(dest, options));
        self
    }

    /// Create a symlink inside the jail.
    pub fn symlink(&mut self, link: impl Into<PathBuf>, target: impl Into<PathBuf>) -> &mut Command {
        self.config.symlinks.push(Symlink {
            link: link.into(),
            target: target.into(),
        });
        self
    }

    pub fn hostname(&mut self, hostname: impl AsRef<str>) -> &mut Command {
        self.config.uts.hostname = hostname.as_ref().to_owned();
        self
    }

    pub fn domainname(&mut self, domainname: impl AsRef<str>) -> &mut Command {
        self.config.uts.domainname = domainname.as_ref().to_owned();
        self
    }

    /// Sets the host directory the jail's root is built on.
    pub fn chroot(&mut self, path: impl Into<PathBuf>) -> &mut Command {
        self.config.chroot = path.into();
        self
    }

    /// Sets the working directory of the payload, inside the jail.
    pub fn current_dir(&mut self, path: impl Into<PathBuf>) -> &mut Command {
        self.config.working_dir = path.into();
        self
    }

    /// Configures the payload's stdin stream.
    pub fn stdin(&mut self, stream: impl Into<OwnedFd>) -> &mut Command {
        let fd = stream.into();
        self.config.stdin_fd = Some(fd.as_raw_fd());
        self.stdin = Some(fd);
        self
    }

    /// Configures the payload's stdout stream.
    pub fn stdout(&mut self, stream: impl Into<OwnedFd>) -> &mut Command {
        let fd = stream.into();
        self.config.stdout_fd = Some(fd.as_raw_fd());
        self.stdout = Some(fd);
        self
    }

    /// Configures the payload's stderr stream.
    pub fn stderr(&mut self, stream: impl Into<OwnedFd>) -> &mut Command {
        let fd = stream.into();
        self.config.stderr_fd = Some(fd.as_raw_fd());
        self.stderr = Some(fd);
        self
    }

    /// Sets where the per-run accounting groups are created.
    pub fn cgroup(&mut self, cgroup: CgroupConfig) -> &mut Command {
        self.config.cgroup = cgroup;
        self
    }

    /// Returns the configuration the sandbox will run with.
    pub fn get_config(&self) -> &Config {
        &self.config
    }

    /// Gets the program name.
    pub fn get_program(&self) -> Option<&str> {
        self.config.argv.first().map(|e| e.as_str())
    }

    /// Returns an iterator over the arguments passed to the program.
    pub fn get_args(&self) -> impl Iterator<Item = &str> {
        self.config.argv.iter().skip(1).map(|e| e.as_str())
    }

    /// Returns the environment variables being passed to the program.
    pub fn get_envs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.config.env.iter().filter_map(|e| e.split_once('='))
    }

    /// Run the command to completion in the sandbox, and collect what it used.
    ///
    /// The chroot directory is created if missing, and removed again after the run whatever its
    /// outcome.
    pub fn run(&self) -> Result<SandboxResult, RunError> {
        let jail = Jail::new(&self.config)?;

        let chroot = self.config.chroot.as_path();
        std::fs::create_dir_all(chroot).map_err(|source| RunError::Chroot {
            path: chroot.to_owned(),
            source,
        })?;

        let result = jail.run();
        remove_chroot(chroot);
        Ok(result?)
    }
}

fn remove_chroot(path: &Path) {
    match std::fs::remove_dir(path) {
        Ok(()) => debug!(?path, "removed chroot directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(?path, error = %e, "failed to remove chroot directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_starts_from_defaults() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello").args(["big", "world"]);
        assert_eq!(cmd.get_program(), Some("echo"));
        assert_eq!(cmd.get_args().collect::<Vec<_>>(), ["hello", "big", "world"]);
        assert_eq!(cmd.get_config().limits, Limits::default());
        assert_eq!(cmd.get_config().uts.hostname, "stockade");
    }

    #[test]
    fn env_replaces_existing_keys() {
        let mut cmd = Command::new("env");
        cmd.env("PATH", "/bin").env("LANG", "C").env("LANG", "C.UTF-8");
        let envs = cmd.get_envs().collect::<Vec<_>>();
        assert_eq!(envs, [("PATH", "/bin"), ("LANG", "C.UTF-8")]);

        cmd.env_remove("PATH");
        assert_eq!(cmd.get_envs().collect::<Vec<_>>(), [("LANG", "C.UTF-8")]);

        cmd.env_clear();
        assert_eq!(cmd.get_envs().count(), 0);
    }

    #[test]
    fn mount_setters_extend_the_defaults() {
        let defaults = Config::default();
        let mut cmd = Command::new("true");
        cmd.bind_ro("/etc", "/etc")
            .bind_rw("/srv/data", "/data")
            .tmpfs("/scratch", "size=1048576")
            .symlink("/bin/python", "/usr/bin/python3");

        let config = cmd.get_config();
        assert_eq!(config.ro_binds.len(), defaults.ro_binds.len() + 1);
        assert_eq!(config.rw_binds.last().unwrap().dest, Path::new("/data"));
        assert_eq!(config.tmpfs.last().unwrap().options, "size=1048576");
        assert_eq!(
            config.symlinks.last().unwrap().target,
            Path::new("/usr/bin/python3")
        );
    }

    #[test]
    fn stdio_fds_are_recorded_in_the_config() {
        let devnull = std::fs::File::open("/dev/null").unwrap();
        let raw = devnull.as_raw_fd();
        let mut cmd = Command::new("cat");
        cmd.stdin(devnull);
        assert_eq!(cmd.get_config().stdin_fd, Some(raw));
        assert_eq!(cmd.get_config().stdout_fd, None);
    }

    #[test]
    fn invalid_command_fails_before_touching_the_filesystem() {
        let chroot = std::env::temp_dir().join(format!("stockade-test-{}", std::process::id()));
        let mut cmd = Command::new("");
        cmd.chroot(&chroot);
        assert!(matches!(
            cmd.run(),
            Err(RunError::Config(ConfigError::EmptyCommand))
        ));
        assert!(!chroot.exists());
    }
}
