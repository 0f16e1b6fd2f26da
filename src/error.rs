use alloc_counter::no_alloc;
use std::ffi::c_int;

/// Result type for our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The broad category of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Creating, attaching to, limiting, or reading the accounting group failed.
    #[error("resource group error")]
    ResourceGroup,

    /// Isolating the jailed process (namespaces, mounts, credentials, rlimits) failed.
    #[error("mount error")]
    Mount,

    /// A handshake or report message was cut short.
    #[error("channel error")]
    Channel,

    /// The watchdog could not kill the jailed process after a limit was exceeded.
    #[error("supervision error")]
    Supervision,

    /// The jail process died from a signal instead of exiting.
    #[error("unexpected termination")]
    UnexpectedTermination,

    /// A syscall failed outside of the categories above.
    #[error("system error")]
    System,
}

/// An error type which can track kind, cause (reason the error happened) and context (what we
/// were doing when the error happened) without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub errno: c_int,
    pub cause: Option<&'static str>,
    pub context: Option<&'static str>,
}

impl Error {
    /// Create an empty error of the given kind.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new(kind: ErrorKind) -> Error {
        Error {
            kind,
            errno: 0,
            cause: None,
            context: None,
        }
    }

    /// Create an error from the last OS error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn last_os_error(kind: ErrorKind) -> Error {
        Error {
            kind,
            errno: unsafe { *libc::__errno_location() },
            cause: None,
            context: None,
        }
    }

    /// Replace the kind of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn kind(self, kind: ErrorKind) -> Error {
        Error { kind, ..self }
    }

    /// Replace the cause of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn cause(self, msg: &'static str) -> Error {
        Error {
            cause: Some(msg),
            ..self
        }
    }

    /// Replace the context of an error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn context(self, msg: &'static str) -> Error {
        Error {
            context: Some(msg),
            ..self
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            kind: ErrorKind::System,
            errno: e.raw_os_error().unwrap_or(0),
            cause: None,
            context: None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(context) = self.context {
            write!(f, ": {}", context)?;
        }
        if let Some(cause) = self.cause {
            write!(f, ": {}", cause)?;
        }
        if self.errno == 0 {
            return Ok(());
        }

        // Get the error message from errno.
        let error_msg = unsafe { libc::strerror(self.errno) };
        let error_msg_len = unsafe { libc::strlen(error_msg) };
        let error_msg_str: &str = unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                error_msg as *const u8,
                error_msg_len,
            ))
        };
        write!(f, ": {} (errno {})", error_msg_str, self.errno)
    }
}

impl std::error::Error for Error {}

// Define a macro, bail!, which returns an error of some kind with no errno and a custom message.
macro_rules! bail {
    ($kind:expr, $msg:expr) => {
        return Err($crate::error::Error::new($kind).cause($msg))
    };
}
pub(crate) use bail;

// Define a macro, bail_errno!, which returns an error with the last OS error:
//
// - `bail_errno!(kind)` returns an error with the last OS error.
// - `bail_errno!(kind, msg)` returns an error with the last OS error and a cause message.
macro_rules! bail_errno {
    ($kind:expr) => {
        return Err($crate::error::Error::last_os_error($kind))
    };
    ($kind:expr, $msg:expr) => {
        return Err($crate::error::Error::last_os_error($kind).cause($msg))
    };
}
pub(crate) use bail_errno;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_context_cause_and_errno() {
        let err = Error {
            kind: ErrorKind::ResourceGroup,
            errno: libc::ENOENT,
            cause: Some("failed to open control file"),
            context: Some("arming oom notification"),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("resource group error: arming oom notification: failed to open"));
        assert!(msg.ends_with(&format!("(errno {})", libc::ENOENT)));
    }

    #[test]
    fn display_omits_errno_when_unset() {
        let err = Error::new(ErrorKind::Channel).cause("short read");
        assert_eq!(err.to_string(), "channel error: short read");
    }

    #[test]
    fn builders_only_replace_their_field() {
        let err = Error::new(ErrorKind::System)
            .cause("a")
            .context("b")
            .kind(ErrorKind::Mount);
        assert_eq!(err.kind, ErrorKind::Mount);
        assert_eq!(err.cause, Some("a"));
        assert_eq!(err.context, Some("b"));
    }
}
