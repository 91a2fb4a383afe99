use std::collections::{HashMap, HashSet, VecDeque};

use nix::{errno::Errno, sched::CloneFlags, sys::signal::Signal, unistd::Pid};
use syscalls::{SyscallArgs, Sysno};

use crate::{
    error::{Error, Result},
    tracer::{
        EventPoll, Handle, ResumeAction, SyscallRegisters, TerminationStatus, Tracer, TracerEvent,
        WaitMode,
    },
};

pub fn init_logging() {
    let _ = pretty_env_logger::formatted_builder()
        .parse_default_env()
        .is_test(true)
        .try_init();
}

/// Base of the address range readable through [`ScriptedTracer`].
pub const MEMORY_BASE: usize = 0x10000;
pub const MEMORY_SIZE: usize = 0x10000;

/// Pids above the kernel's `pid_max`, so that no `/proc` entry exists.
pub fn fake_pid(n: i32) -> Pid {
    Pid::from_raw(0x7000_0000 + n)
}

enum Step {
    Event(TracerEvent),
    Entry {
        handle: Handle,
        sysno: usize,
        args: SyscallArgs,
    },
    Exit {
        handle: Handle,
        ret: i64,
    },

    /// Delivered even while the task sits in a stop.
    Killed {
        handle: Handle,
        signal: Signal,
    },
}

impl Step {
    fn handle(&self) -> Handle {
        match self {
            Step::Event(e) => e.handle(),
            Step::Entry { handle, .. } | Step::Exit { handle, .. } | Step::Killed { handle, .. } => {
                *handle
            }
        }
    }
}

/// A tracer replaying a scripted sequence of stops. A stop is only
/// delivered once the previous stop of the same task was resumed.
pub struct ScriptedTracer {
    script: VecDeque<Step>,
    next_handle: u64,
    stopped: HashSet<Handle>,
    in_flight: HashMap<Handle, usize>,
    at_exit: HashMap<Handle, usize>,
    last_action: HashMap<Handle, ResumeAction>,
    regs: HashMap<Handle, SyscallRegisters>,
    memory: Vec<u8>,
    brk: usize,

    /// Every resume, in order.
    pub resumes: Vec<(Handle, ResumeAction)>,

    /// Syscall number and return value seen by the task, per completed
    /// syscall.
    pub completed: Vec<(Handle, usize, i64)>,
    pub kills: Vec<(Pid, Signal)>,
}

impl ScriptedTracer {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            next_handle: 1,
            stopped: HashSet::new(),
            in_flight: HashMap::new(),
            at_exit: HashMap::new(),
            last_action: HashMap::new(),
            regs: HashMap::new(),
            memory: vec![0; MEMORY_SIZE],
            brk: MEMORY_BASE,
            resumes: Vec::new(),
            completed: Vec::new(),
            kills: Vec::new(),
        }
    }

    fn new_handle(&mut self) -> Handle {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Scripts the appearance of the session root.
    pub fn spawn(&mut self, pid: Pid) -> Handle {
        self.fork(None, pid, CloneFlags::empty())
    }

    pub fn fork(&mut self, parent: Option<Handle>, pid: Pid, clone_flags: CloneFlags) -> Handle {
        let handle = self.new_handle();
        self.script.push_back(Step::Event(TracerEvent::NewProcess {
            handle,
            pid,
            parent,
            clone_flags,
        }));
        handle
    }

    /// Scripts a syscall whose kernel execution returns `ret`.
    pub fn syscall(&mut self, handle: Handle, sysno: Sysno, args: SyscallArgs, ret: i64) {
        self.raw_syscall(handle, sysno.id() as _, args, ret)
    }

    pub fn raw_syscall(&mut self, handle: Handle, sysno: usize, args: SyscallArgs, ret: i64) {
        self.syscall_entry(handle, sysno, args);
        self.syscall_exit(handle, ret);
    }

    /// Scripts only the entry stop, so that other stops can be scripted
    /// before the matching [`ScriptedTracer::syscall_exit`].
    pub fn syscall_entry(&mut self, handle: Handle, sysno: usize, args: SyscallArgs) {
        self.script.push_back(Step::Entry {
            handle,
            sysno,
            args,
        });
    }

    pub fn syscall_exit(&mut self, handle: Handle, ret: i64) {
        self.script.push_back(Step::Exit { handle, ret });
    }

    pub fn exit(&mut self, handle: Handle, code: i32) {
        self.script.push_back(Step::Event(TracerEvent::Terminated {
            handle,
            status: TerminationStatus::Exited(code),
        }));
    }

    /// Scripts the death of a task by `signal`. Unlike other stops it is
    /// delivered while the task is still stopped, and it drops whatever was
    /// scripted for the task after it.
    pub fn kill_stopped(&mut self, handle: Handle, signal: Signal) {
        self.script.push_back(Step::Killed { handle, signal });
    }

    /// Copies `data` into the task memory and returns its address.
    pub fn alloc(&mut self, data: &[u8]) -> usize {
        let addr = self.brk;
        self.poke(addr, data);
        self.brk = (addr + data.len() + 0xf) & !0xf;
        addr
    }

    /// Reserves `len` zeroed bytes of task memory.
    pub fn alloc_zeroed(&mut self, len: usize) -> usize {
        self.alloc(&vec![0; len])
    }

    pub fn poke(&mut self, addr: usize, data: &[u8]) {
        let offset = addr - MEMORY_BASE;
        self.memory[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn peek(&self, addr: usize, len: usize) -> &[u8] {
        let offset = addr - MEMORY_BASE;
        &self.memory[offset..offset + len]
    }

    pub fn returns_of(&self, handle: Handle) -> Vec<(usize, i64)> {
        self.completed
            .iter()
            .filter(|(h, ..)| *h == handle)
            .map(|(_, sysno, ret)| (*sysno, *ret))
            .collect()
    }

    pub fn is_stopped(&self, handle: Handle) -> bool {
        self.stopped.contains(&handle)
    }

    fn deliver(&mut self, step: Step) -> TracerEvent {
        match step {
            Step::Event(event) => {
                match &event {
                    TracerEvent::NewProcess { handle, .. } => {
                        self.stopped.insert(*handle);
                        self.regs.insert(
                            *handle,
                            SyscallRegisters {
                                sysno: 0,
                                args: SyscallArgs::new(0, 0, 0, 0, 0, 0),
                                ret: 0,
                                sp: (MEMORY_BASE + MEMORY_SIZE) as _,
                            },
                        );
                    }
                    TracerEvent::Terminated { handle, .. } => {
                        self.regs.remove(handle);
                    }
                    _ => (),
                }
                event
            }
            Step::Entry {
                handle,
                sysno,
                args,
            } => {
                self.stopped.insert(handle);
                self.in_flight.insert(handle, sysno);
                if let Some(regs) = self.regs.get_mut(&handle) {
                    regs.sysno = sysno;
                    regs.args = args;
                    regs.ret = -(Errno::ENOSYS as i64);
                }
                TracerEvent::SyscallEntry { handle, sysno }
            }
            Step::Exit { handle, ret } => {
                self.stopped.insert(handle);
                let skipped = self.last_action.get(&handle) == Some(&ResumeAction::SkipSyscall);
                if let Some(sysno) = self.in_flight.remove(&handle) {
                    self.at_exit.insert(handle, sysno);
                }
                if let Some(regs) = self.regs.get_mut(&handle) {
                    regs.ret = if skipped {
                        -(Errno::ENOSYS as i64)
                    } else {
                        ret
                    };
                }
                TracerEvent::SyscallExit { handle }
            }
            Step::Killed { handle, signal } => {
                self.stopped.remove(&handle);
                self.in_flight.remove(&handle);
                self.at_exit.remove(&handle);
                self.regs.remove(&handle);
                self.script.retain(|s| s.handle() != handle);
                TracerEvent::Terminated {
                    handle,
                    status: TerminationStatus::Signalled(signal),
                }
            }
        }
    }

    fn regs_mut(&mut self, handle: Handle) -> Result<&mut SyscallRegisters> {
        self.regs.get_mut(&handle).ok_or(Error::UnknownHandle)
    }

    fn range(&self, addr: usize, len: usize) -> Result<std::ops::Range<usize>> {
        let end = MEMORY_BASE + MEMORY_SIZE;
        if addr < MEMORY_BASE || addr >= end {
            return Err(Error::Nix(Errno::EFAULT));
        }
        let start = addr - MEMORY_BASE;
        Ok(start..start + len.min(end - addr))
    }
}

impl Tracer for ScriptedTracer {
    fn next_event(&mut self, mode: WaitMode) -> Result<EventPoll> {
        if self.script.is_empty() {
            return Ok(EventPoll::Exhausted);
        }

        let next = self
            .script
            .iter()
            .position(|s| matches!(s, Step::Killed { .. }) || !self.stopped.contains(&s.handle()));

        match next.and_then(|i| self.script.remove(i)) {
            Some(step) => Ok(EventPoll::Event(self.deliver(step))),
            None if mode == WaitMode::Poll => Ok(EventPoll::Idle),
            None => Err(Error::InvalidState),
        }
    }

    fn read_registers(&mut self, handle: Handle) -> Result<SyscallRegisters> {
        self.regs_mut(handle).map(|r| *r)
    }

    fn write_registers(&mut self, handle: Handle, regs: &SyscallRegisters) -> Result<()> {
        *self.regs_mut(handle)? = *regs;
        Ok(())
    }

    fn read_memory(&mut self, _handle: Handle, addr: usize, buf: &mut [u8]) -> Result<usize> {
        let range = self.range(addr, buf.len())?;
        let n = range.len();
        buf[..n].copy_from_slice(&self.memory[range]);
        Ok(n)
    }

    fn write_memory(&mut self, _handle: Handle, addr: usize, data: &[u8]) -> Result<usize> {
        let range = self.range(addr, data.len())?;
        let n = range.len();
        self.memory[range].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn resume(&mut self, handle: Handle, action: ResumeAction) -> Result<()> {
        if !self.stopped.remove(&handle) {
            return Err(Error::InvalidState);
        }

        if let ResumeAction::SetReturn(ret) = action {
            self.regs_mut(handle)?.ret = ret;
        }

        if let Some(sysno) = self.at_exit.remove(&handle) {
            let ret = self.regs_mut(handle)?.ret;
            self.completed.push((handle, sysno, ret));
        }

        self.last_action.insert(handle, action);
        self.resumes.push((handle, action));
        Ok(())
    }

    fn kill(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        self.kills.push((pid, signal));
        Ok(())
    }
}
