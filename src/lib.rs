mod libc_util;

mod channel;
pub mod clone;
pub mod config;
mod error;
mod id_map;
mod jail;
pub mod logging;
mod mount_table;
mod resource_group;
mod result;
mod rootfs;
mod timer;
pub mod userns;
pub mod watchdog;

mod command;

pub use config::{CgroupConfig, Config, ConfigError, Limits, MountKind, MountSpec, Symlink, Uts};
pub use error::{Error, ErrorKind, Result};
pub use id_map::{IdMap, IdMapping};
pub use jail::Jail;
pub use libc_util::ExitStatus;
pub use mount_table::MountPlan;
pub use resource_group::ResourceGroup;
pub use result::{SandboxResult, TimeUsage};

pub use command::{Command, RunError};

/// In test builds, use alloc_counter to verify at runtime that the functions which must be
/// async-signal-safe do not allocate.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
