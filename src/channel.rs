use alloc_counter::no_alloc;
use std::ffi::c_int;
use std::os::fd::{AsRawFd, OwnedFd};

use crate::error::{bail, Error, ErrorKind, Result};
use crate::libc_util::{socket_pair, socket_recv, socket_send};
use crate::result::SandboxResult;

/// Handshake messages exchanged between the jail process and the jailed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Message {
    /// The jailed process is isolated and waiting for `Run`.
    Ready = 1,
    /// Limits are armed; replace the process image with the payload.
    Run = 2,
    /// Isolation failed; the jailed process is exiting.
    Error = 3,
}

impl Message {
    #[cfg_attr(debug_assertions, no_alloc)]
    fn from_wire(value: u32) -> Option<Message> {
        match value {
            1 => Some(Message::Ready),
            2 => Some(Message::Run),
            3 => Some(Message::Error),
            _ => None,
        }
    }
}

/// One end of a connected `SOCK_SEQPACKET` pair: every message is a single, complete datagram.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

/// Create a connected pair of channel endpoints.
pub fn channel() -> Result<(Channel, Channel)> {
    let (a, b) = socket_pair(libc::SOCK_SEQPACKET)
        .map_err(|e| e.kind(ErrorKind::Channel).context("creating handshake channel"))?;
    Ok((Channel { fd: a }, Channel { fd: b }))
}

impl Channel {
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn send(&self, message: Message) -> Result<()> {
        unsafe { socket_send(self.fd.as_raw_fd(), message as u32) }
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn recv(&self) -> Result<Message> {
        let value = unsafe { socket_recv::<u32>(self.fd.as_raw_fd()) }?;
        let Some(message) = Message::from_wire(value) else {
            bail!(ErrorKind::Channel, "unknown handshake message");
        };
        Ok(message)
    }
}

const REPORT_COMPLETED: u32 = 1;
const REPORT_FAILED: u32 = 2;

/// What the jail process hands back to the controller: either a result, or the error that ended
/// the run.
///
/// `cause` and `context` point into static data. They stay valid on the receiving side because
/// the jail process is a clone of the controller, with the same binary image at the same address.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct Report {
    tag: u32,
    error_kind: u32,
    errno: c_int,
    _padding: u32,
    cause: Option<&'static str>,
    context: Option<&'static str>,
    result: SandboxResult,
}

impl Report {
    #[cfg_attr(debug_assertions, no_alloc)]
    pub(crate) fn completed(result: SandboxResult) -> Report {
        Report {
            tag: REPORT_COMPLETED,
            error_kind: 0,
            errno: 0,
            _padding: 0,
            cause: None,
            context: None,
            result,
        }
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    pub(crate) fn failed(error: Error) -> Report {
        Report {
            tag: REPORT_FAILED,
            error_kind: kind_to_wire(error.kind),
            errno: error.errno,
            _padding: 0,
            cause: error.cause,
            context: error.context,
            result: SandboxResult::default(),
        }
    }

    /// Turn the report back into the outcome it describes.
    pub(crate) fn into_result(self) -> Result<SandboxResult> {
        match self.tag {
            REPORT_COMPLETED => Ok(self.result),
            REPORT_FAILED => {
                let kind = kind_from_wire(self.error_kind).unwrap_or(ErrorKind::System);
                Err(Error {
                    kind,
                    errno: self.errno,
                    cause: self.cause.or(Some("reported by the jail process")),
                    context: self.context,
                })
            }
            _ => Err(Error::new(ErrorKind::Channel).cause("malformed report from the jail process")),
        }
    }
}

/// The endpoints a report travels over: the jail process sends, the controller receives.
#[derive(Debug)]
pub(crate) struct ReportSender(OwnedFd);

#[derive(Debug)]
pub(crate) struct ReportReceiver(OwnedFd);

pub(crate) fn report_channel() -> Result<(ReportSender, ReportReceiver)> {
    let (tx, rx) = socket_pair(libc::SOCK_SEQPACKET)
        .map_err(|e| e.kind(ErrorKind::Channel).context("creating report channel"))?;
    Ok((ReportSender(tx), ReportReceiver(rx)))
}

impl ReportSender {
    #[cfg_attr(debug_assertions, no_alloc)]
    pub(crate) fn send(&self, report: Report) -> Result<()> {
        unsafe { socket_send(self.0.as_raw_fd(), report) }
    }
}

impl ReportReceiver {
    pub(crate) fn recv(&self) -> Result<Report> {
        unsafe { socket_recv::<Report>(self.0.as_raw_fd()) }
    }
}

#[cfg_attr(debug_assertions, no_alloc)]
fn kind_to_wire(kind: ErrorKind) -> u32 {
    match kind {
        ErrorKind::ResourceGroup => 1,
        ErrorKind::Mount => 2,
        ErrorKind::Channel => 3,
        ErrorKind::Supervision => 4,
        ErrorKind::UnexpectedTermination => 5,
        ErrorKind::System => 6,
    }
}

fn kind_from_wire(value: u32) -> Option<ErrorKind> {
    Some(match value {
        1 => ErrorKind::ResourceGroup,
        2 => ErrorKind::Mount,
        3 => ErrorKind::Channel,
        4 => ErrorKind::Supervision,
        5 => ErrorKind::UnexpectedTermination,
        6 => ErrorKind::System,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::TimeUsage;

    #[test]
    fn handshake_messages_cross_the_channel() {
        let (inside, outside) = channel().unwrap();
        inside.send(Message::Ready).unwrap();
        assert_eq!(outside.recv().unwrap(), Message::Ready);
        outside.send(Message::Run).unwrap();
        assert_eq!(inside.recv().unwrap(), Message::Run);
        inside.send(Message::Error).unwrap();
        assert_eq!(outside.recv().unwrap(), Message::Error);
    }

    #[test]
    fn unknown_message_is_a_channel_error() {
        let (inside, outside) = channel().unwrap();
        unsafe { socket_send::<u32>(inside.fd.as_raw_fd(), 99) }.unwrap();
        assert_eq!(outside.recv().unwrap_err().kind, ErrorKind::Channel);
    }

    #[test]
    fn closed_peer_is_a_channel_error() {
        let (inside, outside) = channel().unwrap();
        drop(inside);
        assert_eq!(outside.recv().unwrap_err().kind, ErrorKind::Channel);
    }

    #[test]
    fn completed_report_carries_the_result() {
        let (tx, rx) = report_channel().unwrap();
        let result = SandboxResult {
            time: TimeUsage {
                sys: 1,
                usr: 2,
                real: 3,
            },
            memory: 4096,
            return_code: 7,
            signal: 0,
        };
        tx.send(Report::completed(result)).unwrap();
        assert_eq!(rx.recv().unwrap().into_result().unwrap(), result);
    }

    #[test]
    fn failed_report_keeps_kind_and_errno() {
        let (tx, rx) = report_channel().unwrap();
        let error = Error {
            kind: ErrorKind::Mount,
            errno: libc::EPERM,
            cause: Some("pivot_root failed"),
            context: Some("building root filesystem"),
        };
        tx.send(Report::failed(error)).unwrap();
        let err = rx.recv().unwrap().into_result().unwrap_err();
        assert_eq!(err, error);
    }

    #[test]
    fn report_from_cloned_child_keeps_messages() {
        use crate::clone::{self, Stack};
        use crate::libc_util::waitpid;

        let (tx, rx) = report_channel().unwrap();
        let mut stack = Stack::new(256 * 1024);
        let mut entry = || {
            let error = Error::new(ErrorKind::Channel)
                .cause("peer hung up")
                .context("awaiting ready");
            match tx.send(Report::failed(error)) {
                Ok(()) => 0,
                Err(_) => 1,
            }
        };
        let pid = unsafe { clone::spawn(&mut stack, 0, &mut entry) }.unwrap();
        assert!(waitpid(pid, 0).unwrap().success());

        let err = rx.recv().unwrap().into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Channel);
        assert_eq!(err.cause, Some("peer hung up"));
        assert_eq!(err.context, Some("awaiting ready"));
    }

    #[test]
    fn every_kind_survives_the_wire() {
        for kind in [
            ErrorKind::ResourceGroup,
            ErrorKind::Mount,
            ErrorKind::Channel,
            ErrorKind::Supervision,
            ErrorKind::UnexpectedTermination,
            ErrorKind::System,
        ] {
            assert_eq!(kind_from_wire(kind_to_wire(kind)), Some(kind));
        }
        assert_eq!(kind_from_wire(0), None);
    }
}
