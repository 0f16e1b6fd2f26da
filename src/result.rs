use serde::Serialize;

/// CPU and wall-clock time used by the payload, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[repr(C)]
pub struct TimeUsage {
    /// Time spent in the kernel on the payload's behalf.
    pub sys: u64,
    /// Time spent in user mode.
    pub usr: u64,
    /// Wall-clock time between `Run` and the payload's exit.
    pub real: u64,
}

/// The outcome of one sandbox run.
///
/// Exactly one of `return_code` and `signal` is meaningful: `signal` is zero unless the payload
/// was killed by a signal, in which case `return_code` is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[repr(C)]
pub struct SandboxResult {
    pub time: TimeUsage,
    /// Peak memory use, in bytes.
    pub memory: u64,
    pub return_code: i32,
    pub signal: i32,
}

impl SandboxResult {
    /// Did the payload exit normally with status zero?
    pub fn success(&self) -> bool {
        self.signal == 0 && self.return_code == 0
    }
}
