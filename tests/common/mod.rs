#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Show engine logs while testing. Safe to call from every test.
pub fn configure_logging() {
    let default_verbosity = tracing_subscriber::filter::LevelFilter::DEBUG;
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_verbosity.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_target(false)
        .try_init();
}

/// Full sandbox runs need root and writable cgroup v1 memory, cpuacct and pids hierarchies.
pub fn sandbox_supported() -> bool {
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("skipping: sandbox runs need root");
        return false;
    }
    let cgroups = Path::new("/sys/fs/cgroup");
    for subsystem in ["cpuacct", "memory", "pids"] {
        if !cgroups.join(subsystem).join("tasks").exists() {
            eprintln!("skipping: no cgroup v1 {subsystem} hierarchy");
            return false;
        }
    }
    true
}

/// A chroot path no other test in this process uses.
pub fn unique_chroot(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("stockade-{name}-{}-{n}", std::process::id()))
}
