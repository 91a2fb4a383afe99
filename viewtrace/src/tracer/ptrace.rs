use std::{
    collections::{HashMap, VecDeque},
    io::{IoSlice, IoSliceMut},
};

use log::{debug, trace, warn};
use nix::{
    errno::Errno,
    libc,
    sched::CloneFlags,
    sys::{
        ptrace,
        signal::{self, Signal},
        uio::{process_vm_readv, process_vm_writev, RemoteIoVec},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use syscalls::{SyscallArgs, Sysno};

use crate::error::{Error, Result};

use super::{
    EventPoll, Handle, ResumeAction, SyscallRegisters, TerminationStatus, Tracer, TracerEvent,
    WaitMode,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        fn regs_to_syscall(regs: &libc::user_regs_struct) -> SyscallRegisters {
            SyscallRegisters {
                sysno: regs.orig_rax as _,
                args: SyscallArgs::new(
                    regs.rdi as _,
                    regs.rsi as _,
                    regs.rdx as _,
                    regs.r10 as _,
                    regs.r8 as _,
                    regs.r9 as _,
                ),
                ret: regs.rax as _,
                sp: regs.rsp,
            }
        }

        fn syscall_to_regs(sc: &SyscallRegisters, regs: &mut libc::user_regs_struct) {
            regs.orig_rax = sc.sysno as _;
            regs.rdi = sc.args.arg0 as _;
            regs.rsi = sc.args.arg1 as _;
            regs.rdx = sc.args.arg2 as _;
            regs.r10 = sc.args.arg3 as _;
            regs.r8 = sc.args.arg4 as _;
            regs.r9 = sc.args.arg5 as _;
            regs.rax = sc.ret as _;
        }

        fn skip_syscall(regs: &mut libc::user_regs_struct) {
            regs.orig_rax = u64::MAX;
        }

        fn set_return(regs: &mut libc::user_regs_struct, ret: i64) {
            regs.rax = ret as _;
        }
    } else {
        compile_error!("viewtrace only supports x86_64");
    }
}

const PTRACE_EVENT_STOP: i32 = libc::PTRACE_EVENT_STOP;

#[derive(Debug)]
struct Task {
    handle: Handle,
    in_syscall: bool,
}

/// [`Tracer`] backed by `ptrace(2)`.
///
/// A task created by a traced task may report its initial stop before its
/// creator reports the clone event. Both orders are accepted: the new process
/// is announced once both sides have been seen.
pub struct PtraceTracer {
    tasks: HashMap<Pid, Task>,
    pids: HashMap<Handle, Pid>,
    next_handle: u64,

    /// Children whose initial stop arrived before their creator's event.
    early_stops: Vec<Pid>,

    /// Children announced by their creator, initial stop not seen yet.
    expected: HashMap<Pid, (Handle, CloneFlags)>,

    pending: VecDeque<TracerEvent>,
}

impl PtraceTracer {
    pub fn options() -> ptrace::Options {
        ptrace::Options::PTRACE_O_TRACESYSGOOD
            | ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK
            | ptrace::Options::PTRACE_O_TRACEEXEC
            | ptrace::Options::PTRACE_O_EXITKILL
    }

    /// Seizes `pid`, which must be in a stopped state, and resumes it to its
    /// next syscall stop once the engine has seen the root process event.
    pub fn seize(pid: Pid) -> Result<Self> {
        ptrace::seize(pid, Self::options())?;

        let mut tracer = Self {
            tasks: HashMap::new(),
            pids: HashMap::new(),
            next_handle: 1,
            early_stops: Vec::new(),
            expected: HashMap::new(),
            pending: VecDeque::new(),
        };

        let handle = tracer.add_task(pid);
        tracer.pending.push_back(TracerEvent::NewProcess {
            handle,
            pid,
            parent: None,
            clone_flags: CloneFlags::empty(),
        });

        Ok(tracer)
    }

    fn add_task(&mut self, pid: Pid) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;

        self.tasks.insert(
            pid,
            Task {
                handle,
                in_syscall: false,
            },
        );
        self.pids.insert(handle, pid);

        handle
    }

    fn remove_task(&mut self, pid: Pid) -> Option<Handle> {
        let task = self.tasks.remove(&pid)?;
        self.pids.remove(&task.handle);
        Some(task.handle)
    }

    fn pid_of(&self, handle: Handle) -> Result<Pid> {
        self.pids.get(&handle).copied().ok_or(Error::UnknownHandle)
    }

    fn cont(pid: Pid, sig: Option<Signal>) -> Result<()> {
        match ptrace::syscall(pid, sig) {
            Ok(()) => Ok(()),
            // died in between, the exit status is reported by waitpid
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Clone flags of the call `parent` is stopped in.
    fn clone_flags_of(&self, parent: Pid, event: i32) -> CloneFlags {
        let flags = match event {
            libc::PTRACE_EVENT_FORK => 0,
            libc::PTRACE_EVENT_VFORK => (libc::CLONE_VM | libc::CLONE_VFORK) as u64,
            _ => {
                let Ok(regs) = ptrace::getregs(parent) else {
                    return CloneFlags::empty();
                };
                let sc = regs_to_syscall(&regs);

                match Sysno::new(sc.sysno) {
                    Some(Sysno::clone3) => {
                        let mut buf = [0u8; 8];
                        match self.read_raw(parent, sc.args.arg0, &mut buf) {
                            Ok(8) => u64::from_ne_bytes(buf),
                            _ => 0,
                        }
                    }
                    Some(Sysno::clone) => sc.args.arg0 as u64,
                    _ => 0,
                }
            }
        };

        // low byte is the exit signal
        CloneFlags::from_bits_truncate((flags & !0xff) as _)
    }

    fn read_raw(&self, pid: Pid, addr: usize, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len();
        Ok(process_vm_readv(
            pid,
            &mut [IoSliceMut::new(buf)],
            &[RemoteIoVec { base: addr, len }],
        )?)
    }

    fn handle_new_child_stop(&mut self, child: Pid) -> Result<()> {
        match self.expected.remove(&child) {
            Some((parent, clone_flags)) => {
                let handle = self.add_task(child);
                self.pending.push_back(TracerEvent::NewProcess {
                    handle,
                    pid: child,
                    parent: Some(parent),
                    clone_flags,
                });
            }
            None => {
                trace!("[{child}] initial stop before its creator's event");
                self.early_stops.push(child);
            }
        }

        Ok(())
    }

    fn handle_clone_event(&mut self, parent: Pid, event: i32) -> Result<()> {
        let child = Pid::from_raw(ptrace::getevent(parent)? as _);
        let clone_flags = self.clone_flags_of(parent, event);
        let parent_handle = self
            .tasks
            .get(&parent)
            .map(|t| t.handle)
            .ok_or(Error::UnknownHandle)?;

        debug!("[{parent}] created [{child}] with {clone_flags:?}");

        if let Some(pos) = self.early_stops.iter().position(|p| *p == child) {
            self.early_stops.swap_remove(pos);
            let handle = self.add_task(child);
            self.pending.push_back(TracerEvent::NewProcess {
                handle,
                pid: child,
                parent: Some(parent_handle),
                clone_flags,
            });
        } else {
            self.expected.insert(child, (parent_handle, clone_flags));
        }

        Self::cont(parent, None)
    }

    fn handle_exec_event(&mut self, pid: Pid) -> Result<()> {
        let former = Pid::from_raw(ptrace::getevent(pid)? as _);

        if former != pid {
            // a non-leader thread exec'd and took over the leader's pid
            if let Some(leader) = self.remove_task(pid) {
                self.pending.push_back(TracerEvent::Terminated {
                    handle: leader,
                    status: TerminationStatus::Exited(0),
                });
            }
            if let Some(task) = self.tasks.remove(&former) {
                self.pids.insert(task.handle, pid);
                self.tasks.insert(pid, task);
            }
            warn!("[{former}] exec'd from a non-leader thread, now known as [{pid}]");
        }

        Self::cont(pid, None)
    }

    fn handle_status(&mut self, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::Exited(pid, code) => {
                if let Some(handle) = self.remove_task(pid) {
                    self.pending.push_back(TracerEvent::Terminated {
                        handle,
                        status: TerminationStatus::Exited(code),
                    });
                }
            }
            WaitStatus::Signaled(pid, sig, _) => {
                if let Some(handle) = self.remove_task(pid) {
                    self.pending.push_back(TracerEvent::Terminated {
                        handle,
                        status: TerminationStatus::Signalled(sig),
                    });
                }
            }
            WaitStatus::PtraceSyscall(pid) => {
                let Some(task) = self.tasks.get_mut(&pid) else {
                    warn!("[{pid}] syscall stop of an unknown task");
                    return Self::cont(pid, None);
                };

                task.in_syscall = !task.in_syscall;
                let handle = task.handle;

                if task.in_syscall {
                    let regs = ptrace::getregs(pid)?;
                    self.pending.push_back(TracerEvent::SyscallEntry {
                        handle,
                        sysno: regs.orig_rax as _,
                    });
                } else {
                    self.pending.push_back(TracerEvent::SyscallExit { handle });
                }
            }
            WaitStatus::PtraceEvent(pid, _, event) => match event {
                libc::PTRACE_EVENT_CLONE | libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                    self.handle_clone_event(pid, event)?;
                }
                libc::PTRACE_EVENT_EXEC => self.handle_exec_event(pid)?,
                PTRACE_EVENT_STOP if !self.tasks.contains_key(&pid) => {
                    self.handle_new_child_stop(pid)?;
                }
                _ => Self::cont(pid, None)?,
            },
            WaitStatus::Stopped(pid, sig) => {
                if !self.tasks.contains_key(&pid) && sig == Signal::SIGSTOP {
                    self.handle_new_child_stop(pid)?;
                } else {
                    trace!("[{pid}] delivering {sig}");
                    Self::cont(pid, Some(sig))?;
                }
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => (),
        }

        Ok(())
    }
}

impl Tracer for PtraceTracer {
    fn next_event(&mut self, mode: WaitMode) -> Result<EventPoll> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(EventPoll::Event(event));
            }

            let mut flags = WaitPidFlag::__WALL;
            if mode == WaitMode::Poll {
                flags |= WaitPidFlag::WNOHANG;
            }

            match waitpid(None, Some(flags)) {
                Ok(WaitStatus::StillAlive) => return Ok(EventPoll::Idle),
                Ok(status) => self.handle_status(status)?,
                Err(Errno::ECHILD) => return Ok(EventPoll::Exhausted),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_registers(&mut self, handle: Handle) -> Result<SyscallRegisters> {
        let pid = self.pid_of(handle)?;
        Ok(regs_to_syscall(&ptrace::getregs(pid)?))
    }

    fn write_registers(&mut self, handle: Handle, regs: &SyscallRegisters) -> Result<()> {
        let pid = self.pid_of(handle)?;
        let mut raw = ptrace::getregs(pid)?;
        syscall_to_regs(regs, &mut raw);
        ptrace::setregs(pid, raw)?;
        Ok(())
    }

    fn read_memory(&mut self, handle: Handle, addr: usize, buf: &mut [u8]) -> Result<usize> {
        let pid = self.pid_of(handle)?;
        self.read_raw(pid, addr, buf)
    }

    fn write_memory(&mut self, handle: Handle, addr: usize, data: &[u8]) -> Result<usize> {
        let pid = self.pid_of(handle)?;
        Ok(process_vm_writev(
            pid,
            &[IoSlice::new(data)],
            &[RemoteIoVec {
                base: addr,
                len: data.len(),
            }],
        )?)
    }

    fn resume(&mut self, handle: Handle, action: ResumeAction) -> Result<()> {
        let pid = self.pid_of(handle)?;

        match action {
            ResumeAction::Continue => (),
            ResumeAction::SkipSyscall => {
                let mut regs = ptrace::getregs(pid)?;
                skip_syscall(&mut regs);
                ptrace::setregs(pid, regs)?;
            }
            ResumeAction::SetReturn(ret) => {
                let mut regs = ptrace::getregs(pid)?;
                set_return(&mut regs, ret);
                ptrace::setregs(pid, regs)?;
            }
        }

        Self::cont(pid, None)
    }

    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        Ok(signal::kill(pid, signal)?)
    }
}
