use alloc_counter::no_alloc;
use std::ffi::{c_int, c_void};

use crate::error::{bail_errno, ErrorKind, Result};

/// Size of the stack for the jail process.
pub const JAIL_STACK_SIZE: usize = 16 * 1024 * 1024; // 16 MB

/// Size of the stack for the jailed process, used until it execs the payload.
pub const JAILED_STACK_SIZE: usize = 1024 * 1024; // 1 MB

/// Size of the stack for the watchdog.
pub const WATCHDOG_STACK_SIZE: usize = 128 * 1024; // 128 KB

/// Exit code of a cloned child whose entrypoint panicked.
pub const PANIC_EXIT_CODE: c_int = 126;

/// A block of memory a cloned child runs on.
///
/// Stacks are allocated up-front by the controller, because the cloned children cannot allocate.
pub struct Stack {
    memory: Vec<u8>,
}

impl Stack {
    pub fn new(size: usize) -> Stack {
        Stack {
            memory: vec![0; size],
        }
    }

    /// Get the topmost valid stack pointer inside the stack memory.
    #[cfg_attr(debug_assertions, no_alloc)]
    fn top(&mut self) -> *mut c_void {
        let top_addr = unsafe { self.memory.as_mut_ptr().add(self.memory.len()) };

        // Align downwards, multiple of 16.
        let top_addr = top_addr as usize & !0xf;

        top_addr as *mut c_void
    }
}

/// Spawn `entry` as a new process via `clone(2)` with `flags`, running on `stack`.
///
/// `SIGCHLD` is always added to `flags`, so the child can be reaped with `waitpid(2)`. The child
/// exits with the value `entry` returns, or [`PANIC_EXIT_CODE`] if it panics.
///
/// # Safety
///
/// The child starts with a copy of the caller's address space, or shares it when `flags`
/// contains `CLONE_VM`. In the sharing case, `stack` and `entry` must stay alive and untouched
/// until the child has exited. Either way, `entry` must not allocate or take locks if the caller
/// is multi-threaded.
///
/// Unlike `fork(3)`, no `pthread_atfork` handlers run, so this is safe to call from a child that
/// was itself cloned out of a multi-threaded process.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn spawn<F>(stack: &mut Stack, flags: c_int, entry: &mut F) -> Result<c_int>
where
    F: FnMut() -> c_int,
{
    extern "C" fn trampoline<F>(arg: *mut c_void) -> c_int
    where
        F: FnMut() -> c_int,
    {
        // SAFETY: `arg` is the `&mut F` handed to `clone(2)` below.
        let entry: &mut F = unsafe { &mut *(arg as *mut F) };

        // Catch any panics.
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)).unwrap_or(PANIC_EXIT_CODE)
    }

    // NOTE: You MUST set `SIGCHLD` in order for `waitpid()` after `clone()` to work properly.
    let flags = flags | libc::SIGCHLD;

    let pid @ 0.. = libc::clone(
        trampoline::<F>,
        stack.top(),
        flags,
        entry as *mut F as *mut c_void,
    ) else {
        bail_errno!(ErrorKind::System, "clone(2) failed");
    };

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libc_util::{waitpid, ExitStatus};

    #[test]
    fn child_exit_code_is_entry_return_value() {
        let mut stack = Stack::new(256 * 1024);
        let mut entry = || 7;
        let pid = unsafe { spawn(&mut stack, 0, &mut entry) }.unwrap();
        assert_eq!(waitpid(pid, 0).unwrap(), ExitStatus::Code(7));
    }

    #[test]
    fn shared_memory_child_writes_are_visible() {
        let mut stack = Stack::new(256 * 1024);
        let mut slot: c_int = 0;
        let slot_ptr = &mut slot as *mut c_int;
        let mut entry = || {
            unsafe { slot_ptr.write_volatile(42) };
            0
        };
        let pid = unsafe { spawn(&mut stack, libc::CLONE_VM, &mut entry) }.unwrap();
        assert!(waitpid(pid, 0).unwrap().success());
        assert_eq!(unsafe { slot_ptr.read_volatile() }, 42);
    }

    #[test]
    fn stack_top_is_aligned() {
        let mut stack = Stack::new(4097);
        assert_eq!(stack.top() as usize % 16, 0);
    }
}
