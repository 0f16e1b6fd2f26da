use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::debug;

use crate::config::{Config, ConfigError, MountKind};

/// The mounts and symlinks that make up the jail's root filesystem, resolved ahead of time so the
/// jailed process can apply them without allocating.
///
/// Every target is already prefixed with the jail root.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub(crate) root: CString,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) symlinks: Vec<Link>,
    pub(crate) proc_target: CString,
    pub(crate) put_old: CString,
}

#[derive(Debug, Clone)]
pub(crate) struct Mount {
    pub(crate) kind: MountKind,
    pub(crate) source: CString,
    pub(crate) target: CString,
    pub(crate) data: CString,
    pub(crate) mountpoint: MountpointType,
}

#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub(crate) link: CString,
    pub(crate) target: CString,
}

/// The type of mountpoint to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountpointType {
    Dir,
    File,
}

impl MountPlan {
    /// Resolve the mount plan in `config`.
    ///
    /// Read-only binds come first, then read-write binds, then tmpfs mounts. Bind sources that do
    /// not exist on this host are skipped, and the type of each bind mountpoint (file or
    /// directory) is taken from its source.
    pub fn from_config(config: &Config) -> Result<MountPlan, ConfigError> {
        let root = path_to_cstring("chroot", &config.chroot)?;

        let mut mounts = Vec::new();
        for spec in config
            .ro_binds
            .iter()
            .chain(&config.rw_binds)
            .chain(&config.tmpfs)
        {
            let mountpoint = match spec.kind {
                MountKind::Tmpfs => MountpointType::Dir,
                MountKind::ReadOnlyBind | MountKind::ReadWriteBind => {
                    match std::fs::metadata(&spec.source) {
                        Ok(meta) if meta.is_dir() => MountpointType::Dir,
                        Ok(_) => MountpointType::File,
                        Err(err) => {
                            debug!(source = ?spec.source, %err, "skipping bind of missing source");
                            continue;
                        }
                    }
                }
            };
            mounts.push(Mount {
                kind: spec.kind,
                source: match spec.kind {
                    MountKind::Tmpfs => CString::from(c_str_macro::c_str!("tmpfs")),
                    _ => path_to_cstring("mount source", &spec.source)?,
                },
                target: prefixed(&config.chroot, &spec.dest)?,
                data: CString::new(spec.options.as_bytes()).map_err(|_| {
                    ConfigError::InteriorNul {
                        what: "mount options",
                        value: spec.options.clone(),
                    }
                })?,
                mountpoint,
            });
        }

        let symlinks = config
            .symlinks
            .iter()
            .map(|s| {
                Ok(Link {
                    link: prefixed(&config.chroot, &s.link)?,
                    target: path_to_cstring("symlink target", &s.target)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(MountPlan {
            proc_target: prefixed(&config.chroot, Path::new("/proc"))?,
            put_old: prefixed(&config.chroot, Path::new("/putold"))?,
            root,
            mounts,
            symlinks,
        })
    }

    /// The host path backing the jail's root.
    pub fn root(&self) -> &CStr {
        &self.root
    }
}

/// Join `dest` (absolute inside the jail) onto `root`.
fn prefixed(root: &Path, dest: &Path) -> Result<CString, ConfigError> {
    let mut target = root.as_os_str().as_bytes().to_vec();
    let dest = dest.as_os_str().as_bytes();
    let dest = &dest[dest.iter().take_while(|&&b| b == b'/').count()..];
    if target.last() != Some(&b'/') {
        target.push(b'/');
    }
    target.extend_from_slice(dest);
    CString::new(target).map_err(|e| ConfigError::InteriorNul {
        what: "mount destination",
        value: String::from_utf8_lossy(&e.into_vec()).into_owned(),
    })
}

fn path_to_cstring(what: &'static str, path: &Path) -> Result<CString, ConfigError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| ConfigError::InteriorNul {
        what,
        value: path.to_string_lossy().into_owned(),
    })
}
