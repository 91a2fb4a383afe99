//! Wrappers: per-syscall argument marshalling between the traced process and
//! the service handling the call.
//!
//! A wrap-in function runs at the entry stop once a service (or the
//! `ALWAYS` flag) has taken the call, and tells the dispatch core how to
//! proceed. A wrap-out function runs at the exit stop of calls that asked for
//! it, and immediately after wrap-in for faked calls.

pub mod exec;
pub mod fd;
pub mod fs;
pub mod net;

use std::{os::unix::ffi::OsStringExt, path::PathBuf};

use log::trace;
use nix::{errno::Errno, fcntl::AtFlags};
use pretty_hex::PrettyHex;
use syscalls::{SyscallArgs, Sysno};

use crate::{
    epoch::EpochTracker,
    error::{Error, Result, SysResult},
    pcb::{fd_table::VirtualFile, Pcb},
    scheduler::Scheduler,
    services::{Reply, ServiceCall, ServiceRegistry, SysHandler},
    tracer::{
        memory::{CallerMemoryExt, TracedMemory, MAX_RW_COUNT},
        SyscallArgsExt, SyscallRegisters, Tracer,
    },
    types::{behavior::Behavior, pcb_id::PcbId, service_code::ServiceCode},
};

use super::{
    sctab::{ChoiceKind, HandlerRef, ScEntry},
    EngineConfig,
};

/// Red zone below the stack pointer that scratch data must not overwrite.
const RED_ZONE: u64 = 128;

/// Everything a wrapper may touch while one process is stopped.
pub struct WrapContext<'a> {
    pub id: PcbId,
    pub pcb: &'a mut Pcb,
    pub entry: ScEntry,
    pub tracer: &'a mut dyn Tracer,
    pub epochs: &'a mut EpochTracker,
    pub registry: &'a ServiceRegistry,
    pub scheduler: &'a mut Scheduler,
    pub config: &'a EngineConfig,
}

impl<'a> WrapContext<'a> {
    pub fn arg(&self, index: usize) -> usize {
        self.pcb.syscall.args.get(index)
    }

    pub fn service(&self) -> Option<ServiceCode> {
        self.pcb.syscall.service
    }

    /// The descriptor the call operates on, if any.
    pub fn fd(&self) -> Option<i32> {
        self.pcb.syscall.fd
    }

    pub fn virtual_file(&self) -> Option<std::sync::Arc<VirtualFile>> {
        let fd = self.fd()?;
        self.pcb.fds.read().virtual_file(fd).cloned()
    }

    pub fn memory(&mut self) -> TracedMemory<'_, dyn Tracer + 'a> {
        TracedMemory::new(&mut *self.tracer, self.pcb.handle)
    }

    pub fn registers(&mut self) -> Result<SyscallRegisters> {
        self.tracer.read_registers(self.pcb.handle)
    }

    /// Replaces the syscall about to be executed by the kernel.
    pub fn rewrite(&mut self, sysno: Sysno, args: SyscallArgs) -> Result<()> {
        let mut regs = self.registers()?;
        regs.sysno = sysno.id() as _;
        regs.args = args;
        self.tracer.write_registers(self.pcb.handle, &regs)
    }

    /// Rewrites one argument of the current syscall.
    pub fn rewrite_arg(&mut self, index: usize, value: usize) -> Result<()> {
        let mut regs = self.registers()?;
        regs.args.set(index, value);
        self.tracer.write_registers(self.pcb.handle, &regs)
    }

    /// Copies `data` below the caller's stack red zone and returns its
    /// address. Valid until the process resumes user code.
    pub fn stack_scratch(&mut self, data: &[u8]) -> Result<usize> {
        let sp = self.registers()?.sp;
        let addr = (sp - RED_ZONE - data.len() as u64) & !0xf;
        self.memory().write_bytes(addr as _, data)?;
        Ok(addr as _)
    }

    pub fn set_result(&mut self, result: SysResult) {
        self.pcb.syscall.result = result;
    }

    /// Records `result` as the whole outcome of the call.
    pub fn fake(&mut self, result: SysResult) -> Result<Behavior> {
        self.set_result(result);
        Ok(Behavior::Fake)
    }

    /// Canonical arguments: those of the `*at`-less form of the call.
    pub fn canonical_args(&self) -> SyscallArgs {
        let args = self.pcb.syscall.args;

        match self.entry.choice {
            ChoiceKind::Path { path, .. } => match path.dirfd {
                Some(dirfd) => {
                    let mut out = SyscallArgs::new(0, 0, 0, 0, 0, 0);
                    (0..6)
                        .filter(|i| *i != dirfd)
                        .enumerate()
                        .for_each(|(to, from)| out.set(to, args.get(from)));
                    out
                }
                None => args,
            },
            _ => args,
        }
    }

    /// The handler of the current service for the canonical syscall
    /// `sysno`.
    pub fn handler_for(&self, sysno: Sysno) -> Option<SysHandler> {
        self.registry.syscall_handler(self.service()?, sysno)
    }

    /// The handler the table entry routes the call to.
    pub fn handler(&self) -> Option<SysHandler> {
        let code = self.service()?;
        match self.entry.handler {
            HandlerRef::Syscall(sysno) => self.registry.syscall_handler(code, sysno),
            HandlerRef::Socket(call) => self.registry.socket_handler(code, call),
            HandlerRef::None => None,
        }
    }

    fn handler_sysno(&self) -> Sysno {
        self.entry.handler_sysno().unwrap_or(self.entry.sysno)
    }

    /// Runs `handler` for the current call. `prepare` may adjust the call
    /// before it is made.
    pub fn call_with(
        &mut self,
        handler: &SysHandler,
        sysno: Sysno,
        prepare: impl FnOnce(&mut ServiceCall),
    ) -> (SysResult, Reply) {
        let args = self.canonical_args();
        let at = self.pcb.lookup_timestamp();
        let (id, pid, handle) = (self.id, self.pcb.pid, self.pcb.handle);

        let path = self.pcb.syscall.path.path().map(|p| p.to_path_buf());
        let path2 = self.pcb.syscall.path2.path().map(|p| p.to_path_buf());
        let stat = self.pcb.syscall.stat;
        let strings = self.pcb.syscall.strings.clone();
        let sfd = self.virtual_file().map(|f| f.sfd);

        let mut memory = TracedMemory::new(&mut *self.tracer, handle);
        let mut call = ServiceCall::new(id, pid, sysno, args, &mut memory, self.epochs, at);
        call.path = path;
        call.path2 = path2;
        call.stat = stat;
        call.sfd = sfd;
        call.strings = strings;
        prepare(&mut call);

        let result = handler(&mut call);
        let reply = std::mem::take(&mut call.reply);

        (result, reply)
    }

    /// Runs the routed handler of the current call.
    pub fn call(&mut self, prepare: impl FnOnce(&mut ServiceCall)) -> (SysResult, Reply) {
        match self.handler() {
            Some(handler) => {
                let sysno = self.handler_sysno();
                self.call_with(&handler, sysno, prepare)
            }
            None => (Err(Errno::ENOSYS), Reply::None),
        }
    }

    /// Copies reply bytes into a caller buffer of `capacity` bytes at `addr`.
    /// Returns the number of bytes written.
    pub fn copy_out(&mut self, addr: usize, capacity: usize, bytes: &[u8]) -> Result<usize> {
        let n = bytes.len().min(capacity);
        trace!("{} reply to {addr:#x}:\n{:?}", self.pcb, bytes[..n].hex_dump());
        self.memory().write_bytes(addr, &bytes[..n])?;
        Ok(n)
    }
}

/// Errors of caller memory access are reported to the caller.
pub(crate) fn caller_errno(e: Error) -> Result<Errno> {
    match e {
        Error::Nix(errno) => Ok(errno),
        e if e.is_fatal() => Err(e),
        e => Ok(e.errno()),
    }
}

macro_rules! try_caller {
    ($ctx:expr, $e:expr) => {{
        let result = $e;
        match result {
            Ok(v) => v,
            Err(e) => {
                let errno = $crate::engine::wrap::caller_errno(e)?;
                return $ctx.fake(Err(errno));
            }
        }
    }};
}

pub(crate) use try_caller;

/// Calls the handler and fakes its result.
pub fn std_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (result, _) = ctx.call(|_| ());
    ctx.fake(result)
}

pub fn std_out(_ctx: &mut WrapContext) -> Result<Behavior> {
    Ok(Behavior::Std)
}

/// `stat` family: the handler replies with a [`FileStat`], falling back to
/// the metadata found while resolving the path.
///
/// [`FileStat`]: crate::types::file_stat::FileStat
pub fn stat_in(ctx: &mut WrapContext) -> Result<Behavior> {
    // AT_EMPTY_PATH lookups and fstat are descriptor calls
    let (result, reply) = match ctx.fd() {
        Some(_) => match ctx.handler_for(Sysno::fstat) {
            Some(h) => ctx.call_with(&h, Sysno::fstat, |_| ()),
            None => (Err(Errno::ENOSYS), Reply::None),
        },
        None => ctx.call(|_| ()),
    };

    if let Err(e) = result {
        return ctx.fake(Err(e));
    }

    let stat = match (reply, ctx.pcb.syscall.stat) {
        (Reply::Stat(st), _) => st,
        (_, Some(st)) => st,
        _ => return ctx.fake(Err(Errno::ENOENT)),
    };

    let (buf, bytes) = match ctx.entry.sysno {
        Sysno::statx => (ctx.arg(4), stat.to_statx_bytes()),
        Sysno::fstat => (ctx.arg(1), stat.to_stat_bytes()),
        _ => (ctx.canonical_args().get(1), stat.to_stat_bytes()),
    };

    try_caller!(ctx, ctx.memory().write_bytes(buf, &bytes));
    ctx.fake(Ok(0))
}

/// `readlink(path, buf, bufsiz)`: the handler replies with the target.
pub fn readlink_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (result, reply) = ctx.call(|_| ());
    if let Err(e) = result {
        return ctx.fake(Err(e));
    }

    let target: Vec<u8> = match reply {
        Reply::Path(p) => p.into_os_string().into_vec(),
        Reply::Bytes(b) => b,
        _ => return ctx.fake(Err(Errno::EINVAL)),
    };

    let args = ctx.canonical_args();
    let (buf, size) = (args.get(1), args.get(2));
    if (size as isize) <= 0 {
        return ctx.fake(Err(Errno::EINVAL));
    }

    let n = try_caller!(ctx, ctx.copy_out(buf, size, &target));
    ctx.fake(Ok(n as _))
}

/// Calls returning data in a caller buffer: `read(fd, buf, count)`,
/// `pread64`, `getdents64`.
pub fn read_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (buf, count) = (ctx.arg(1), ctx.arg(2));
    let (result, reply) = ctx.call(|_| ());

    match (result, reply) {
        (Err(e), _) => ctx.fake(Err(e)),
        (Ok(_), Reply::Bytes(bytes)) => {
            let n = try_caller!(ctx, ctx.copy_out(buf, count, &bytes));
            ctx.fake(Ok(n as _))
        }
        (Ok(n), _) => ctx.fake(Ok(n)),
    }
}

/// Calls consuming a caller buffer: `write(fd, buf, count)`, `pwrite64`.
pub fn write_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let (buf, count) = (ctx.arg(1), ctx.arg(2).min(MAX_RW_COUNT));
    let input = try_caller!(ctx, ctx.memory().read_bytes(buf, count));

    let (result, _) = ctx.call(|call| call.input = input);
    ctx.fake(result)
}

/// `statfs(path, buf)` and `fstatfs(fd, buf)`.
pub fn statfs_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let buf = ctx.arg(1);
    let (result, reply) = ctx.call(|_| ());

    match (result, reply) {
        (Err(e), _) => ctx.fake(Err(e)),
        (Ok(_), Reply::Bytes(bytes)) => {
            let size = std::mem::size_of::<nix::libc::statfs>();
            try_caller!(ctx, ctx.copy_out(buf, size, &bytes));
            ctx.fake(Ok(0))
        }
        (Ok(_), _) => ctx.fake(Err(Errno::ENOSYS)),
    }
}

/// `unlinkat` with `AT_REMOVEDIR` is an `rmdir`.
pub fn unlinkat_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let flags = AtFlags::from_bits_truncate(ctx.arg(2) as _);

    let (result, _) = if flags.contains(AtFlags::AT_REMOVEDIR) {
        match ctx.handler_for(Sysno::rmdir) {
            Some(h) => ctx.call_with(&h, Sysno::rmdir, |_| ()),
            None => (Err(Errno::ENOSYS), Reply::None),
        }
    } else {
        ctx.call(|_| ())
    };

    ctx.fake(result)
}

/// `rename` and `link` only work within one service.
pub fn two_paths_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let Some(second) = ctx.pcb.syscall.path2.path().map(PathBuf::from) else {
        return ctx.fake(Err(Errno::ENOENT));
    };

    let at = ctx.pcb.lookup_timestamp();
    let query = crate::services::ChoiceQuery::Path(&second);
    if ctx.registry.select(&query, at, ctx.epochs).service() != ctx.service() {
        return ctx.fake(Err(Errno::EXDEV));
    }

    let (result, _) = ctx.call(|_| ());
    ctx.fake(result)
}

/// `symlink(target, linkpath)`: the target is an uninterpreted string.
pub fn symlink_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let addr = ctx.arg(0);
    let target = try_caller!(ctx, ctx.memory().read_path(addr));

    let (result, _) = ctx.call(|call| call.path2 = Some(target));
    ctx.fake(result)
}
