use std::sync::atomic::{AtomicI32, Ordering};

use stockade::clone::{self, Stack};

fn wait_exit_code(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid);
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    libc::WEXITSTATUS(status)
}

#[test]
fn child_exit_code_is_closure_return_value() -> eyre::Result<()> {
    let mut stack = Stack::new(64 * 1024);
    let mut entry = || 42;
    let pid = unsafe { clone::spawn(&mut stack, 0, &mut entry) }?;
    assert_eq!(wait_exit_code(pid), 42);
    Ok(())
}

#[test]
fn shared_address_space_is_visible_to_parent() -> eyre::Result<()> {
    let cell = AtomicI32::new(0);
    let mut stack = Stack::new(clone::WATCHDOG_STACK_SIZE);
    let mut entry = || {
        cell.store(7, Ordering::SeqCst);
        0
    };
    let pid = unsafe { clone::spawn(&mut stack, libc::CLONE_VM | libc::CLONE_FILES, &mut entry) }?;
    assert_eq!(wait_exit_code(pid), 0);
    assert_eq!(cell.load(Ordering::SeqCst), 7);
    Ok(())
}

#[test]
fn copied_address_space_is_not_shared() -> eyre::Result<()> {
    let cell = AtomicI32::new(0);
    let mut stack = Stack::new(64 * 1024);
    let mut entry = || {
        cell.store(7, Ordering::SeqCst);
        0
    };
    let pid = unsafe { clone::spawn(&mut stack, 0, &mut entry) }?;
    assert_eq!(wait_exit_code(pid), 0);
    assert_eq!(cell.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn cloned_child_can_spawn_while_parent_threads_allocate() -> eyre::Result<()> {
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    let stop = AtomicBool::new(false);
    std::thread::scope(|s| -> eyre::Result<()> {
        for _ in 0..4 {
            s.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    let v: Vec<u8> = Vec::with_capacity(4096);
                    std::hint::black_box(v);
                }
            });
        }

        let mut outer = Stack::new(256 * 1024);
        let mut inner = Stack::new(64 * 1024);
        let result = (|| -> eyre::Result<()> {
            for round in 0..100 {
                let mut entry = || {
                    let mut grandchild = || 0;
                    let Ok(pid) = (unsafe { clone::spawn(&mut inner, 0, &mut grandchild) }) else {
                        return 2;
                    };
                    let mut status = 0;
                    if unsafe { libc::waitpid(pid, &mut status, 0) } != pid {
                        return 3;
                    }
                    0
                };
                let pid = unsafe { clone::spawn(&mut outer, 0, &mut entry) }?;

                let deadline = Instant::now() + Duration::from_secs(2);
                let mut status = 0;
                loop {
                    let waited = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                    if waited == pid {
                        break;
                    }
                    if Instant::now() > deadline {
                        unsafe { libc::kill(pid, libc::SIGKILL) };
                        unsafe { libc::waitpid(pid, &mut status, 0) };
                        eyre::bail!("cloned child hung spawning its own child in round {round}");
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                assert!(libc::WIFEXITED(status));
                assert_eq!(libc::WEXITSTATUS(status), 0);
            }
            Ok(())
        })();

        stop.store(true, Ordering::Relaxed);
        result
    })
}
