//! The tracing substrate the dispatch core is driven by.
//!
//! The engine only depends on the [`Tracer`] trait: a stream of process and
//! syscall-stop events, register and memory access, and resume primitives.
//! Entry and exit stops of one syscall invocation are always delivered as a
//! matched pair per handle.

pub mod memory;
pub mod ptrace;

use std::fmt::Display;

use nix::{
    sched::CloneFlags,
    sys::signal::Signal,
    unistd::Pid,
};
use syscalls::SyscallArgs;

use crate::error::Result;

/// Opaque identity the tracer assigns to one traced task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStatus {
    Exited(i32),
    Signalled(Signal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracerEvent {
    /// A task became traced. `parent` is the task that created it, `None`
    /// for the root of the session.
    NewProcess {
        handle: Handle,
        pid: Pid,
        parent: Option<Handle>,
        clone_flags: CloneFlags,
    },
    Terminated {
        handle: Handle,
        status: TerminationStatus,
    },
    SyscallEntry {
        handle: Handle,
        sysno: usize,
    },
    SyscallExit {
        handle: Handle,
    },
}

impl TracerEvent {
    pub fn handle(&self) -> Handle {
        match self {
            TracerEvent::NewProcess { handle, .. }
            | TracerEvent::Terminated { handle, .. }
            | TracerEvent::SyscallEntry { handle, .. }
            | TracerEvent::SyscallExit { handle } => *handle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Block,
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPoll {
    Event(TracerEvent),

    /// Nothing happened yet. Only returned in [`WaitMode::Poll`].
    Idle,

    /// No traced task is left.
    Exhausted,
}

/// How a task stopped at a syscall stop is let go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// Run the (possibly rewritten) syscall, or return to user space.
    Continue,

    /// Entry stop only. The kernel must not execute the syscall.
    SkipSyscall,

    /// Exit stop only. Overwrites the return value seen by the task.
    SetReturn(i64),
}

/// Architecture-neutral view of the syscall registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRegisters {
    pub sysno: usize,
    pub args: SyscallArgs,
    pub ret: i64,
    pub sp: u64,
}

pub trait Tracer {
    /// Waits for the next event. Tracer-internal stops (signal delivery,
    /// exec notification, clone notification of the parent) are handled
    /// without being reported.
    fn next_event(&mut self, mode: WaitMode) -> Result<EventPoll>;

    fn read_registers(&mut self, handle: Handle) -> Result<SyscallRegisters>;

    fn write_registers(&mut self, handle: Handle, regs: &SyscallRegisters) -> Result<()>;

    fn read_memory(&mut self, handle: Handle, addr: usize, buf: &mut [u8]) -> Result<usize>;

    fn write_memory(&mut self, handle: Handle, addr: usize, data: &[u8]) -> Result<usize>;

    fn resume(&mut self, handle: Handle, action: ResumeAction) -> Result<()>;

    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<()>;
}

pub trait SyscallArgsExt {
    fn get(&self, index: usize) -> usize;

    fn set(&mut self, index: usize, value: usize);
}

impl SyscallArgsExt for SyscallArgs {
    fn get(&self, index: usize) -> usize {
        match index {
            0 => self.arg0,
            1 => self.arg1,
            2 => self.arg2,
            3 => self.arg3,
            4 => self.arg4,
            5 => self.arg5,
            _ => 0,
        }
    }

    fn set(&mut self, index: usize, value: usize) {
        match index {
            0 => self.arg0 = value,
            1 => self.arg1 = value,
            2 => self.arg2 = value,
            3 => self.arg3 = value,
            4 => self.arg4 = value,
            5 => self.arg5 = value,
            _ => (),
        }
    }
}
