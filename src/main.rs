use clap::Parser;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use stockade::config::{identity, parse_pair};
use stockade::{Command, Config, ConfigError, MountSpec, Symlink};
use tracing::{debug, error, warn};

/// Run a command in a namespace- and cgroup-isolated jail, then print what it used as JSON.
#[derive(Parser, Debug)]
#[command(name = "stockade", version, about, long_about = None)]
#[command(after_help = "example: stockade -- echo 233\nuse `stockade --default` to see the defaults")]
struct Args {
    /// Working directory inside the jail.
    #[arg(long, value_name = "DIR", help_heading = "Spawn")]
    chdir: Option<PathBuf>,

    /// Redirect the payload's stdin from this fd.
    #[arg(long, value_name = "FD", help_heading = "Spawn")]
    stdin: Option<RawFd>,

    /// Redirect the payload's stdout to this fd.
    #[arg(long, value_name = "FD", help_heading = "Spawn")]
    stdout: Option<RawFd>,

    /// Redirect the payload's stderr to this fd.
    #[arg(long, value_name = "FD", help_heading = "Spawn")]
    stderr: Option<RawFd>,

    /// Host directory the jail's root is built on. Must not be `/`.
    #[arg(long, value_name = "DIR", help_heading = "Spawn")]
    chroot: Option<PathBuf>,

    /// Wall-clock limit, in seconds.
    #[arg(short, long, value_name = "SECONDS", help_heading = "Limits")]
    real: Option<u64>,

    /// CPU time limit, in seconds.
    #[arg(short = 't', long, value_name = "SECONDS", help_heading = "Limits")]
    cpu: Option<u64>,

    /// Memory plus swap limit, in bytes.
    #[arg(short, long, value_name = "BYTES", help_heading = "Limits")]
    mem: Option<u64>,

    /// Largest file the payload may write, in bytes.
    #[arg(long, value_name = "BYTES", help_heading = "Limits")]
    fsize: Option<u64>,

    /// Maximum number of processes.
    #[arg(long, value_name = "N", help_heading = "Limits")]
    pid: Option<u64>,

    /// Maximum number of open file descriptors.
    #[arg(long, value_name = "N", help_heading = "Limits")]
    nfd: Option<u64>,

    /// Environment variable in the jail. Can be given multiple times.
    #[arg(short, long, value_name = "KEY=VAL", help_heading = "Container")]
    env: Vec<String>,

    /// Hostname in the jail.
    #[arg(long, help_heading = "Container")]
    host: Option<String>,

    /// Domain name in the jail.
    #[arg(long, help_heading = "Container")]
    domain: Option<String>,

    /// Host uid the payload runs as.
    #[arg(short, long, help_heading = "Container")]
    uid: Option<u32>,

    /// Host gid the payload runs as.
    #[arg(short, long, help_heading = "Container")]
    gid: Option<u32>,

    /// Additional read-only bind mount. Can be given multiple times.
    #[arg(short = 'R', long, value_name = "SRC:DEST", help_heading = "Container")]
    ro: Vec<String>,

    /// Additional read-write bind mount. Can be given multiple times.
    #[arg(short = 'B', long, value_name = "SRC:DEST", help_heading = "Container")]
    rw: Vec<String>,

    /// Additional symlink LINK pointing at TARGET. Can be given multiple times.
    #[arg(short, long, value_name = "LINK:TARGET", help_heading = "Container")]
    symlink: Vec<String>,

    /// Additional tmpfs mounted at DEST with OPTIONS. Can be given multiple times.
    #[arg(long, value_name = "DEST:OPTIONS", help_heading = "Container")]
    tmpfs: Vec<String>,

    /// Print the default configuration and exit.
    #[arg(long)]
    default: bool,

    /// The program to run, and its arguments.
    #[arg(last = true, value_name = "PROGRAM")]
    command: Vec<String>,
}

impl Args {
    /// Layer the options over the default configuration.
    fn into_config(self) -> Result<Config, ConfigError> {
        let (real_uid, real_gid) = unsafe { (libc::getuid(), libc::getgid()) };
        let mut config = Config::default();

        if let Some(dir) = self.chdir {
            config.working_dir = dir;
        }
        if let Some(dir) = self.chroot {
            config.chroot = dir;
        }
        config.stdin_fd = self.stdin;
        config.stdout_fd = self.stdout;
        config.stderr_fd = self.stderr;

        let limits = &mut config.limits;
        if let Some(secs) = self.real {
            limits.real_time = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cpu {
            limits.cpu_time = Duration::from_secs(secs);
        }
        if let Some(bytes) = self.mem {
            limits.memory = bytes;
        }
        if let Some(bytes) = self.fsize {
            limits.output = bytes;
        }
        if let Some(n) = self.pid {
            limits.processes = n;
        }
        if let Some(n) = self.nfd {
            limits.open_files = n;
        }

        config.env.extend(self.env);
        if let Some(host) = self.host {
            config.uts.hostname = host;
        }
        if let Some(domain) = self.domain {
            config.uts.domainname = domain;
        }
        if let Some(uid) = self.uid {
            config.uid = identity("uid", uid, real_uid)?;
        }
        if let Some(gid) = self.gid {
            config.gid = identity("gid", gid, real_gid)?;
        }

        for value in &self.ro {
            let (src, dest) = parse_pair("ro", value)?;
            config.ro_binds.push(MountSpec::ro_bind(src, dest));
        }
        for value in &self.rw {
            let (src, dest) = parse_pair("rw", value)?;
            config.rw_binds.push(MountSpec::rw_bind(src, dest));
        }
        for value in &self.symlink {
            let (link, target) = parse_pair("symlink", value)?;
            config.symlinks.push(Symlink {
                link: link.into(),
                target: target.into(),
            });
        }
        for value in &self.tmpfs {
            let (dest, options) = parse_pair("tmpfs", value)?;
            config.tmpfs.push(MountSpec::tmpfs(dest, options));
        }

        config.argv = self.command;
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    stockade::logging::configure_logging();
    let args = Args::parse();

    if args.default {
        match serde_json::to_string_pretty(&Config::default()) {
            Ok(defaults) => println!("{defaults}"),
            Err(e) => error!("failed to serialize defaults: {e}"),
        }
        return;
    }

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return;
        }
    };
    debug!(?config, "resolved configuration");

    if let Err(e) = stockade::userns::enter_fake_root(config.uid, config.gid) {
        warn!("failed to become root in a user namespace: {e}");
    }

    let result = match Command::with_config(config).run() {
        Ok(result) => result,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    match serde_json::to_string(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("failed to serialize result: {e}"),
    }
}
