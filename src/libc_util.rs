use alloc_counter::no_alloc;
use std::ffi::{c_int, c_void, CStr};
use std::io::Write;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::error::{bail, bail_errno, Error, ErrorKind, Result};

/// Create a Unix socket pair of the given type (`SOCK_SEQPACKET`, `SOCK_STREAM`, ...).
///
/// Both ends are close-on-exec, so they never leak into the payload.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn socket_pair(sock_type: c_int) -> Result<(OwnedFd, OwnedFd)> {
    let mut socket_fds = [0; 2];
    let 0.. = (unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            sock_type | libc::SOCK_CLOEXEC,
            0,
            socket_fds.as_mut_ptr(),
        )
    }) else {
        bail_errno!(ErrorKind::System, "failed to create socketpair");
    };
    let [a, b] = socket_fds;
    Ok(unsafe { (OwnedFd::from_raw_fd(a), OwnedFd::from_raw_fd(b)) })
}

/// Send a value, interpretable as bytes, to a socket's file descriptor.
///
/// The value must go out in one write: a short write is a channel failure.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn socket_send<T: Copy>(sock_fd: RawFd, value: T) -> Result<()> {
    let size = mem::size_of::<T>();

    let result = loop {
        let result = libc::write(sock_fd, (&value) as *const T as *const c_void, size);
        if result == -1 && *libc::__errno_location() == libc::EINTR {
            continue;
        }
        break result;
    };

    if result == -1 {
        return Err(Error::last_os_error(ErrorKind::Channel).cause("failed to send to socket"));
    }

    if (result as usize) != size {
        bail!(
            ErrorKind::Channel,
            "failed to send socket message in single write call"
        );
    }

    Ok(())
}

/// Receive a value, interpretable as bytes, from a socket's file descriptor.
///
/// `T` must be valid for any bit pattern (plain integers, or `repr(C)` structs of them).
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn socket_recv<T: Copy>(sock_fd: RawFd) -> Result<T> {
    let size = mem::size_of::<T>();

    let mut output_slot = mem::MaybeUninit::<T>::uninit();
    let result = loop {
        let result = libc::read(sock_fd, output_slot.as_mut_ptr().cast(), size);
        if result == -1 && *libc::__errno_location() == libc::EINTR {
            continue;
        }
        break result;
    };

    if result == -1 {
        return Err(Error::last_os_error(ErrorKind::Channel).cause("failed to receive from socket"));
    };

    if result == 0 {
        bail!(
            ErrorKind::Channel,
            "reached EOF while receiving from socket"
        );
    }

    if (result as usize) != size {
        bail!(
            ErrorKind::Channel,
            "failed to receive socket message in single read call"
        );
    }

    Ok(output_slot.assume_init())
}

/// Create a close-on-exec, non-blocking eventfd with a zero counter.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn eventfd() -> Result<OwnedFd> {
    let fd @ 0.. = (unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) }) else {
        bail_errno!(ErrorKind::System, "failed to create eventfd");
    };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Add `value` to an eventfd's counter, making it readable.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn eventfd_signal(fd: RawFd, value: u64) -> Result<()> {
    write_all(fd, &value.to_ne_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(c_int),
    Signal(c_int),
}

impl ExitStatus {
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn from_wait_status(wait_status: c_int) -> Result<ExitStatus> {
        if libc::WIFEXITED(wait_status) {
            return Ok(ExitStatus::Code(libc::WEXITSTATUS(wait_status)));
        }
        if libc::WIFSIGNALED(wait_status) {
            return Ok(ExitStatus::Signal(libc::WTERMSIG(wait_status)));
        }

        bail!(ErrorKind::System, "invalid wait status")
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

/// Wait for `pid` to change state, restarting if interrupted by a signal.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn waitpid(pid: c_int, flags: c_int) -> Result<ExitStatus> {
    let mut status: c_int = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status as *mut c_int, flags) } != -1 {
            break;
        }
        let err = Error::last_os_error(ErrorKind::System);
        if err.errno != libc::EINTR {
            return Err(err.cause("waitpid failed"));
        }
    }
    ExitStatus::from_wait_status(status)
}

/// Write the whole buffer to `fd`, restarting on `EINTR`.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn write_all(fd: RawFd, contents: &[u8]) -> Result<()> {
    let mut bytes_written = 0;
    while bytes_written < contents.len() {
        let bytes = unsafe {
            libc::write(
                fd,
                contents[bytes_written..].as_ptr().cast(),
                contents.len() - bytes_written,
            )
        };
        if bytes < 0 {
            if unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            bail_errno!(ErrorKind::System, "failed to write to file");
        }
        bytes_written += bytes as usize;
    }
    Ok(())
}

/// Open `path` write-only and write `contents` to it.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn write_file(path: &CStr, contents: &[u8]) -> Result<()> {
    let fd @ 0.. = (unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) }) else {
        bail_errno!(ErrorKind::System, "failed to open file for writing");
    };
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    write_all(std::os::fd::AsRawFd::as_raw_fd(&fd), contents)
}

/// Read up to `buf.len()` bytes of `path` into `buf`, returning the filled prefix.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn read_file<'a>(path: &CStr, buf: &'a mut [u8]) -> Result<&'a [u8]> {
    let fd @ 0.. = (unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) }) else {
        bail_errno!(ErrorKind::System, "failed to open file for reading");
    };
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let raw = std::os::fd::AsRawFd::as_raw_fd(&fd);

    let mut filled = 0;
    while filled < buf.len() {
        let bytes = unsafe { libc::read(raw, buf[filled..].as_mut_ptr().cast(), buf.len() - filled) };
        if bytes < 0 {
            if unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            bail_errno!(ErrorKind::System, "failed to read file");
        }
        if bytes == 0 {
            break;
        }
        filled += bytes as usize;
    }
    Ok(&buf[..filled])
}

/// Parse a decimal integer surrounded by optional ASCII whitespace, as found in kernel control
/// files.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn parse_u64(bytes: &[u8]) -> Option<u64> {
    let digits = bytes.trim_ascii();
    if digits.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(value)
}

/// A stack buffer holding the decimal rendering of a number.
pub struct NumBuf {
    buf: [u8; 24],
    len: usize,
}

impl NumBuf {
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new(value: i64) -> NumBuf {
        let mut buf = [0u8; 24];
        let mut cursor = std::io::Cursor::new(&mut buf[..]);
        // 24 bytes always fit an i64.
        let _ = write!(cursor, "{}", value);
        let len = cursor.position() as usize;
        NumBuf { buf, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

#[cfg_attr(debug_assertions, no_alloc)]
pub fn stat(path: &CStr) -> Result<libc::stat> {
    let mut stat_buf = mem::MaybeUninit::<libc::stat>::uninit();
    let 0.. = (unsafe { libc::stat(path.as_ptr(), stat_buf.as_mut_ptr()) }) else {
        bail_errno!(ErrorKind::System, "failed to stat file");
    };
    Ok(unsafe { stat_buf.assume_init() })
}

/// Create an empty regular file at `path` if nothing exists there yet.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn touch(path: &CStr) -> Result<()> {
    let fd @ 0.. = (unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    }) else {
        bail_errno!(ErrorKind::System, "failed to create file");
    };
    drop(unsafe { OwnedFd::from_raw_fd(fd) });
    Ok(())
}

/// Create a directory for all non-existent path components of `path`.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn mkdirp(path: &CStr) -> Result<()> {
    let mkdir_ignoring_eexist = |path: *const libc::c_char| -> Result<()> {
        let mkdir_result = unsafe { libc::mkdir(path, 0o755) };
        if mkdir_result == -1 {
            let err = Error::last_os_error(ErrorKind::System);
            if err.errno != libc::EEXIST {
                return Err(err.cause("failed to create directory"));
            }
        };
        Ok(())
    };

    // Error if the path is longer than PATH_MAX.
    let path = path.to_bytes_with_nul();
    if path.len() > libc::PATH_MAX as usize {
        bail!(ErrorKind::System, "mkdirp() path is longer than PATH_MAX");
    }
    // Copy the path to a local buffer.
    let mut buf = [b'\0'; libc::PATH_MAX as usize + 1];
    buf[..path.len()].copy_from_slice(path);

    // Loop through indices of `/` characters in the buffer to create ancestors.
    for i in 1..buf.len() {
        if buf[i] == b'\0' {
            break;
        }
        if buf[i] != b'/' {
            continue;
        }

        // Replace the `/` with a null byte.
        buf[i] = b'\0';

        // Create the directory, ignoring EEXIST.
        mkdir_ignoring_eexist(buf.as_ptr().cast())?;

        // Put the `/` back.
        buf[i] = b'/';
    }

    // Create the final directory.
    mkdir_ignoring_eexist(buf.as_ptr().cast())?;

    Ok(())
}

/// Create every ancestor directory of `path`, but not `path` itself.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn mkdirp_parent(path: &CStr) -> Result<()> {
    let bytes = path.to_bytes();
    let Some(slash) = bytes.iter().rposition(|&b| b == b'/') else {
        return Ok(());
    };
    if slash == 0 {
        return Ok(());
    }
    if slash > libc::PATH_MAX as usize {
        bail!(ErrorKind::System, "mkdirp() path is longer than PATH_MAX");
    }
    let mut buf = [b'\0'; libc::PATH_MAX as usize + 1];
    buf[..slash].copy_from_slice(&bytes[..slash]);
    let parent = CStr::from_bytes_until_nul(&buf[..])
        .map_err(|_| Error::new(ErrorKind::System).cause("path contains interior NUL"))?;
    mkdirp(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::AsRawFd;

    #[test]
    fn parse_u64_accepts_kernel_style_values() {
        assert_eq!(parse_u64(b"123\n"), Some(123));
        assert_eq!(parse_u64(b"  0 "), Some(0));
        assert_eq!(parse_u64(b"18446744073709551615\n"), Some(u64::MAX));
    }

    #[test]
    fn parse_u64_rejects_garbage() {
        assert_eq!(parse_u64(b""), None);
        assert_eq!(parse_u64(b"\n"), None);
        assert_eq!(parse_u64(b"-1"), None);
        assert_eq!(parse_u64(b"12ab"), None);
        assert_eq!(parse_u64(b"18446744073709551616"), None);
    }

    #[test]
    fn numbuf_renders_decimal() {
        assert_eq!(NumBuf::new(0).as_bytes(), b"0");
        assert_eq!(NumBuf::new(4242).as_bytes(), b"4242");
        assert_eq!(NumBuf::new(-17).as_bytes(), b"-17");
        assert_eq!(NumBuf::new(i64::MIN).as_bytes(), b"-9223372036854775808");
    }

    #[test]
    fn seqpacket_messages_round_trip() {
        let (a, b) = socket_pair(libc::SOCK_SEQPACKET).unwrap();
        unsafe { socket_send::<u32>(a.as_raw_fd(), 7) }.unwrap();
        assert_eq!(unsafe { socket_recv::<u32>(b.as_raw_fd()) }.unwrap(), 7);
    }

    #[test]
    fn recv_reports_eof_as_channel_error() {
        let (a, b) = socket_pair(libc::SOCK_SEQPACKET).unwrap();
        drop(a);
        let err = unsafe { socket_recv::<u32>(b.as_raw_fd()) }.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Channel);
    }

    #[test]
    fn short_message_is_channel_error() {
        let (a, b) = socket_pair(libc::SOCK_SEQPACKET).unwrap();
        unsafe { socket_send::<u8>(a.as_raw_fd(), 1) }.unwrap();
        let err = unsafe { socket_recv::<u64>(b.as_raw_fd()) }.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Channel);
    }

    #[test]
    fn mkdirp_and_file_helpers() {
        let dir = std::env::temp_dir().join(format!("stockade-libc-util-{}", std::process::id()));
        let nested = dir.join("a/b/c");
        let nested_c = CString::new(nested.to_str().unwrap()).unwrap();
        mkdirp(&nested_c).unwrap();
        assert!(nested.is_dir());

        let file = dir.join("x/y/value");
        let file_c = CString::new(file.to_str().unwrap()).unwrap();
        mkdirp_parent(&file_c).unwrap();
        touch(&file_c).unwrap();
        write_file(&file_c, b"31337\n").unwrap();

        let mut buf = [0u8; 64];
        let contents = read_file(&file_c, &mut buf).unwrap();
        assert_eq!(parse_u64(contents), Some(31337));
        assert_eq!(stat(&file_c).unwrap().st_mode & libc::S_IFMT, libc::S_IFREG);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn eventfd_becomes_readable_after_signal() {
        let fd = eventfd().unwrap();
        eventfd_signal(fd.as_raw_fd(), 1).unwrap();
        let mut value = [0u8; 8];
        let n = unsafe { libc::read(fd.as_raw_fd(), value.as_mut_ptr().cast(), 8) };
        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(value), 1);
    }
}
