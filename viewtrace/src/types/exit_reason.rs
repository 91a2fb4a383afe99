use nix::sys::signal::Signal;

use crate::{error::Error, tracer::TerminationStatus};

pub type ExitCode = i32;

/// How the root process of a session ended, or why the session gave up on
/// it.
#[derive(Debug)]
pub enum ExitReason {
    NormalExit(ExitCode),
    Signalled(Signal),

    /// The tracer ran out of processes before the root terminated.
    UnexpectedlyDies,
    Crashed(Error),
}

impl From<TerminationStatus> for ExitReason {
    fn from(status: TerminationStatus) -> Self {
        match status {
            TerminationStatus::Exited(code) => ExitReason::NormalExit(code),
            TerminationStatus::Signalled(sig) => ExitReason::Signalled(sig),
        }
    }
}

impl ExitReason {
    /// Exit status of the runner, following the shell convention for
    /// signals.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitReason::NormalExit(c) => *c,
            ExitReason::Signalled(sig) => 128 + (*sig as i32),
            ExitReason::UnexpectedlyDies => 254,
            ExitReason::Crashed(_) => 255,
        }
    }

    pub fn expect(self) {
        self.expect_exit_code(0);
    }

    pub fn expect_exit_code(self, code: ExitCode) {
        assert!(
            matches!(self, ExitReason::NormalExit(c) if c == code),
            "session ended with {self:?} instead of exit code {code}"
        );
    }

    pub fn expect_signal(self, signal: Signal) {
        assert!(
            matches!(self, ExitReason::Signalled(s) if s == signal),
            "session ended with {self:?} instead of {signal}"
        );
    }

    pub fn expect_crash(self) {
        assert!(matches!(self, ExitReason::Crashed(_)));
    }
}
