use alloc_counter::no_alloc;
use rand::distributions::{Alphanumeric, DistString};
use std::ffi::{c_int, CStr, CString};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::CgroupConfig;
use crate::error::{bail, Error, ErrorKind, Result};
use crate::libc_util::{parse_u64, read_file, write_file, NumBuf};

/// The cgroup v1 subsystems every group is created under.
const SUBSYSTEMS: [&str; 3] = ["cpuacct", "memory", "pids"];

/// How many random names to try before giving up on creating a group.
const NAME_ATTEMPTS: usize = 8;

/// A uniquely named cgroup v1 group, with one directory per tracked subsystem.
///
/// The directories are removed when the group is dropped. Every control file path is resolved at
/// creation time, so the methods used from the jail process do not allocate.
#[derive(Debug)]
pub struct ResourceGroup {
    name: String,
    memory_dir: PathBuf,
    files: ControlFiles,
    dirs: GroupDirs,
}

#[derive(Debug)]
struct ControlFiles {
    procs: [CString; SUBSYSTEMS.len()],
    cpu_usage: CString,
    cpu_usage_user: CString,
    cpu_usage_sys: CString,
    swappiness: CString,
    limit: CString,
    memsw_limit: Option<CString>,
    max_usage: CString,
    memsw_max_usage: Option<CString>,
    pids_max: CString,
}

/// Directories created for a group. Removed, best-effort, on drop.
#[derive(Debug, Default)]
struct GroupDirs(Vec<PathBuf>);

impl Drop for GroupDirs {
    fn drop(&mut self) {
        for dir in self.0.iter().rev() {
            match std::fs::remove_dir(dir) {
                Ok(()) => debug!(?dir, "removed cgroup"),
                Err(err) => warn!(?dir, %err, "failed to remove cgroup"),
            }
        }
    }
}

impl ResourceGroup {
    /// Create a fresh group under `<root>/<subsystem>/<parent>/` for each tracked subsystem.
    pub fn create(config: &CgroupConfig) -> Result<ResourceGroup> {
        for _ in 0..NAME_ATTEMPTS {
            let name = format!(
                "sandbox-{}",
                Alphanumeric.sample_string(&mut rand::thread_rng(), 16)
            );
            let mut dirs = GroupDirs::default();

            match create_dirs(config, &name, &mut dirs) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(%name, "cgroup name collision, retrying");
                    continue;
                }
                Err(err) => {
                    return Err(Error::from(err)
                        .kind(ErrorKind::ResourceGroup)
                        .cause("failed to create cgroup directory"));
                }
            }

            let [cpuacct, memory, pids] = [0, 1, 2].map(|i| dirs.0[i].clone());
            let files = ControlFiles {
                procs: [
                    control_file(&cpuacct, "cgroup.procs")?,
                    control_file(&memory, "cgroup.procs")?,
                    control_file(&pids, "cgroup.procs")?,
                ],
                cpu_usage: control_file(&cpuacct, "cpuacct.usage")?,
                cpu_usage_user: control_file(&cpuacct, "cpuacct.usage_user")?,
                cpu_usage_sys: control_file(&cpuacct, "cpuacct.usage_sys")?,
                swappiness: control_file(&memory, "memory.swappiness")?,
                limit: control_file(&memory, "memory.limit_in_bytes")?,
                memsw_limit: optional_control_file(&memory, "memory.memsw.limit_in_bytes")?,
                max_usage: control_file(&memory, "memory.max_usage_in_bytes")?,
                memsw_max_usage: optional_control_file(
                    &memory,
                    "memory.memsw.max_usage_in_bytes",
                )?,
                pids_max: control_file(&pids, "pids.max")?,
            };
            if files.memsw_limit.is_none() {
                warn!("swap accounting is unavailable, memory limit excludes swap");
            }

            debug!(%name, "created cgroup");
            return Ok(ResourceGroup {
                name,
                memory_dir: memory,
                files,
                dirs,
            });
        }

        bail!(
            ErrorKind::ResourceGroup,
            "could not find an unused cgroup name"
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Move `pid` into the group, in every subsystem.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn attach(&self, pid: c_int) -> Result<()> {
        let pid = NumBuf::new(pid.into());
        for procs in &self.files.procs {
            write_control(procs, pid.as_bytes(), "failed to attach process to cgroup")?;
        }
        Ok(())
    }

    /// Zero the group's cumulative CPU time.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn reset_accounting(&self) -> Result<()> {
        write_control(&self.files.cpu_usage, b"0", "failed to reset cpu accounting")
    }

    /// Limit memory (plus swap, where the kernel accounts it) to `bytes`.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        let bytes = NumBuf::new(bytes.try_into().unwrap_or(i64::MAX));
        write_control(&self.files.swappiness, b"0", "failed to disable swapping")?;
        write_control(&self.files.limit, bytes.as_bytes(), "failed to set memory limit")?;
        if let Some(memsw_limit) = &self.files.memsw_limit {
            write_control(memsw_limit, bytes.as_bytes(), "failed to set memory+swap limit")?;
        }
        Ok(())
    }

    /// Limit the number of tasks in the group to `n`.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn set_process_limit(&self, n: u64) -> Result<()> {
        let n = NumBuf::new(n.try_into().unwrap_or(i64::MAX));
        write_control(&self.files.pids_max, n.as_bytes(), "failed to set process limit")
    }

    /// CPU time spent in user mode since the last reset, in nanoseconds.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn read_cpu_user_ns(&self) -> Result<u64> {
        read_counter(&self.files.cpu_usage_user)
    }

    /// CPU time spent in kernel mode since the last reset, in nanoseconds.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn read_cpu_sys_ns(&self) -> Result<u64> {
        read_counter(&self.files.cpu_usage_sys)
    }

    /// Peak memory (plus swap, where accounted) used by the group, in bytes.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn read_peak_memory_bytes(&self) -> Result<u64> {
        read_counter(
            self.files
                .memsw_max_usage
                .as_deref()
                .unwrap_or(self.files.max_usage.as_c_str()),
        )
    }

    /// Deliver the group's out-of-memory events to `event_fd`, and stop the kernel from killing
    /// tasks on OOM: they are paused instead, until someone else kills them.
    pub fn register_oom_notification(&self, event_fd: &impl AsRawFd) -> Result<()> {
        let to_error = |cause: &'static str| {
            move |err: io::Error| Error::from(err).kind(ErrorKind::ResourceGroup).cause(cause)
        };

        let mut oom_control = std::fs::OpenOptions::new()
            .write(true)
            .open(self.memory_dir.join("memory.oom_control"))
            .map_err(to_error("failed to open memory.oom_control"))?;
        oom_control
            .write_all(b"1")
            .map_err(to_error("failed to disable the OOM killer"))?;

        std::fs::write(
            self.memory_dir.join("cgroup.event_control"),
            format!("{} {}", event_fd.as_raw_fd(), oom_control.as_raw_fd()),
        )
        .map_err(to_error("failed to register OOM notification"))?;

        debug!(name = %self.name, "registered OOM notification");
        Ok(())
    }
}

fn create_dirs(config: &CgroupConfig, name: &str, dirs: &mut GroupDirs) -> io::Result<()> {
    for subsystem in SUBSYSTEMS {
        let parent = config.root.join(subsystem).join(&config.parent);
        std::fs::create_dir_all(&parent)?;
        let dir = parent.join(name);
        std::fs::create_dir(&dir)?;
        dirs.0.push(dir);
    }
    Ok(())
}

fn control_file(dir: &Path, file: &str) -> Result<CString> {
    CString::new(dir.join(file).as_os_str().as_bytes()).map_err(|_| {
        Error::new(ErrorKind::ResourceGroup).cause("cgroup path contains an interior NUL")
    })
}

fn optional_control_file(dir: &Path, file: &str) -> Result<Option<CString>> {
    if !dir.join(file).exists() {
        return Ok(None);
    }
    control_file(dir, file).map(Some)
}

#[cfg_attr(debug_assertions, no_alloc)]
fn write_control(path: &CStr, value: &[u8], cause: &'static str) -> Result<()> {
    write_file(path, value).map_err(|e| e.kind(ErrorKind::ResourceGroup).cause(cause))
}

#[cfg_attr(debug_assertions, no_alloc)]
fn read_counter(path: &CStr) -> Result<u64> {
    let mut buf = [0u8; 32];
    let contents = read_file(path, &mut buf).map_err(|e| {
        e.kind(ErrorKind::ResourceGroup)
            .cause("failed to read cgroup counter")
    })?;
    let Some(value) = parse_u64(contents) else {
        bail!(ErrorKind::ResourceGroup, "malformed cgroup counter");
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake cgroup root: plain directories, so control files are ordinary files.
    fn fake_root(tag: &str) -> CgroupConfig {
        let root = std::env::temp_dir().join(format!(
            "stockade-cgroup-{}-{}",
            tag,
            std::process::id()
        ));
        CgroupConfig {
            root,
            parent: "test".to_owned(),
        }
    }

    #[test]
    fn create_makes_one_dir_per_subsystem_and_drop_removes_them() {
        let config = fake_root("lifecycle");
        let group = ResourceGroup::create(&config).unwrap();
        let dirs: Vec<_> = SUBSYSTEMS
            .iter()
            .map(|s| config.root.join(s).join("test").join(group.name()))
            .collect();
        assert!(dirs.iter().all(|d| d.is_dir()));

        drop(group);
        assert!(dirs.iter().all(|d| !d.exists()));
        std::fs::remove_dir_all(&config.root).unwrap();
    }

    #[test]
    fn names_are_unique() {
        let config = fake_root("unique");
        let a = ResourceGroup::create(&config).unwrap();
        let b = ResourceGroup::create(&config).unwrap();
        assert_ne!(a.name(), b.name());
        drop((a, b));
        std::fs::remove_dir_all(&config.root).unwrap();
    }

    #[test]
    fn counters_are_parsed_from_control_files() {
        let config = fake_root("counters");
        let group = ResourceGroup::create(&config).unwrap();
        let cpuacct = config.root.join("cpuacct/test").join(group.name());
        let memory = config.root.join("memory/test").join(group.name());
        std::fs::write(cpuacct.join("cpuacct.usage_user"), "1500\n").unwrap();
        std::fs::write(cpuacct.join("cpuacct.usage_sys"), "250\n").unwrap();
        std::fs::write(memory.join("memory.max_usage_in_bytes"), "4096\n").unwrap();

        assert_eq!(group.read_cpu_user_ns().unwrap(), 1500);
        assert_eq!(group.read_cpu_sys_ns().unwrap(), 250);
        assert_eq!(group.read_peak_memory_bytes().unwrap(), 4096);

        std::fs::write(memory.join("memory.max_usage_in_bytes"), "lots\n").unwrap();
        let err = group.read_peak_memory_bytes().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceGroup);

        // Control files written by the test must go before the group can remove its dirs.
        std::fs::remove_dir_all(&config.root).unwrap();
        std::mem::forget(group);
    }

    #[test]
    fn missing_control_file_is_a_resource_group_error() {
        let config = fake_root("missing");
        let group = ResourceGroup::create(&config).unwrap();
        let err = group.set_process_limit(16).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceGroup);
        drop(group);
        std::fs::remove_dir_all(&config.root).unwrap();
    }
}
