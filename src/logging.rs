use std::io::BufRead;
use std::os::fd::OwnedFd;
use std::thread::JoinHandle;

use tracing::debug;

/// Log a message (given in format_args! style) by writing it to a file descriptor.
///
/// This cannot allocate---buffer messages to a fixed-length, stack-allocated 2048-byte buffer.
///
/// ```ignore
/// log_fd!(fd, "msg {param}", param = 42)
/// ```
macro_rules! log_fd {
    ($fd:expr, $fmt:expr) => {
        {
            use std::io::Write as _;
            let mut buffer = [0u8; 2048];
            let mut cursor = std::io::Cursor::new(&mut buffer[..]);
            let _ = writeln!(cursor, $fmt);
            let _ = unsafe {libc::write($fd, cursor.get_ref().as_ptr() as *const libc::c_void, cursor.position() as usize)};
        }
    };
    ($fd:expr, $fmt:expr, $($arg:tt)*) => {
        {
            use std::io::Write as _;
            let mut buffer = [0u8; 2048];
            let mut cursor = std::io::Cursor::new(&mut buffer[..]);
            let _ = writeln!(cursor, $fmt, $($arg)*);
            let _ = unsafe {libc::write($fd, cursor.get_ref().as_ptr() as *const libc::c_void, cursor.position() as usize)};
        }
    };
}
pub(crate) use log_fd;

/// Start a thread to forward logs written to a socket to a particular span in the host's tracing
/// log. The thread exits once every write end of the socket is closed.
pub fn spawn_log_forwarder(span: tracing::Span, log_rx: OwnedFd) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let log_rx = std::os::unix::net::UnixStream::from(log_rx);

        // Loop over lines
        for line in std::io::BufReader::new(log_rx).lines().map_while(Result::ok) {
            debug!(parent: &span, "{}", line);
        }
    })
}

/// Install the `tracing` subscriber used by the binary. Logs go to stderr, so that stdout only
/// carries the result.
pub fn configure_logging() {
    let default_verbosity = tracing_subscriber::filter::LevelFilter::INFO;
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_verbosity.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libc_util::socket_pair;
    use std::io::Read;
    use std::os::fd::AsRawFd;

    #[test]
    fn log_fd_writes_one_line() {
        let (tx, rx) = socket_pair(libc::SOCK_STREAM).unwrap();
        log_fd!(tx.as_raw_fd(), "pid={pid} ok", pid = 42);
        drop(tx);

        let mut out = String::new();
        std::os::unix::net::UnixStream::from(rx)
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "pid=42 ok\n");
    }

    #[test]
    fn forwarder_exits_when_writer_closes() {
        let (tx, rx) = socket_pair(libc::SOCK_STREAM).unwrap();
        let handle = spawn_log_forwarder(tracing::Span::none(), rx);
        log_fd!(tx.as_raw_fd(), "hello");
        drop(tx);
        handle.join().unwrap();
    }
}
