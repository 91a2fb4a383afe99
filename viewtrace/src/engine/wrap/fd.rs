//! Descriptor bookkeeping: virtual descriptors are backed by a kernel
//! placeholder (an eventfd) so that the process-side descriptor number is
//! allocated, inherited and closed by the kernel as usual.

use std::path::PathBuf;

use log::{debug, warn};
use nix::{errno::Errno, fcntl::OFlag, libc, unistd::Pid};
use syscalls::{SyscallArgs, Sysno};

use crate::{
    epoch::{EpochTracker, Timestamp},
    error::{Error, Result},
    pcb::{
        fd_table::{FdEntry, VirtualFile},
        Pending,
    },
    services::{Reply, ServiceCall, ServiceRegistry},
    tracer::{
        memory::{CallerMemoryExt, NoMemory},
        SyscallArgsExt,
    },
    types::{behavior::Behavior, pcb_id::PcbId},
};

use super::{try_caller, WrapContext};

/// Drops one reference to a descriptor entry. The service-side descriptor
/// is closed once no process refers to it anymore.
pub(crate) fn release_entry(
    registry: &ServiceRegistry,
    epochs: &mut EpochTracker,
    at: Timestamp,
    id: PcbId,
    pid: Pid,
    entry: FdEntry,
) {
    let FdEntry::Virtual { file, .. } = entry else {
        return;
    };

    if let Ok(file) = std::sync::Arc::try_unwrap(file) {
        close_service_fd(registry, epochs, at, id, pid, &file);
    }
}

pub(crate) fn close_service_fd(
    registry: &ServiceRegistry,
    epochs: &mut EpochTracker,
    at: Timestamp,
    id: PcbId,
    pid: Pid,
    file: &VirtualFile,
) {
    let Some(close) = registry.syscall_handler(file.service, Sysno::close) else {
        debug!("Service {} gone, sfd {} dropped", file.service, file.sfd);
        return;
    };

    let mut memory = NoMemory;
    let mut call = ServiceCall::new(
        id,
        pid,
        Sysno::close,
        SyscallArgs::new(file.sfd as _, 0, 0, 0, 0, 0),
        &mut memory,
        epochs,
        at,
    );
    call.sfd = Some(file.sfd);
    call.path = Some(file.path.clone());

    if let Err(e) = close(&mut call) {
        debug!(
            "Service {} failed to close sfd {}: {e}",
            file.service, file.sfd
        );
    }
}

impl WrapContext<'_> {
    pub fn release(&mut self, entry: FdEntry) {
        let at = self.pcb.lookup_timestamp();
        release_entry(self.registry, self.epochs, at, self.id, self.pcb.pid, entry);
    }

    /// Lets the kernel allocate the process-side descriptor for the
    /// service-side descriptor `sfd`. The mapping is recorded by
    /// [`open_out`].
    pub fn install_placeholder(
        &mut self,
        sfd: i64,
        path: PathBuf,
        cloexec: bool,
        nonblock: bool,
    ) -> Result<Behavior> {
        let service = self.service().ok_or(Error::InvalidState)?;

        let mut flags = 0;
        if cloexec {
            flags |= libc::EFD_CLOEXEC;
        }
        if nonblock {
            flags |= libc::EFD_NONBLOCK;
        }

        self.rewrite(Sysno::eventfd2, SyscallArgs::new(0, flags as _, 0, 0, 0, 0))?;
        self.pcb.syscall.pending = Pending::Open {
            service,
            sfd,
            path,
            cloexec,
        };

        Ok(Behavior::CallOnExit)
    }
}

/// `open(path, flags, mode)`, `openat`, `creat`.
pub fn open_in(ctx: &mut WrapContext) -> Result<Behavior> {
    if ctx.service().is_none() {
        return Ok(Behavior::Std);
    }

    let args = ctx.canonical_args();
    let (flags, mode) = match ctx.entry.sysno {
        Sysno::creat => (
            (OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC).bits() as usize,
            args.get(1),
        ),
        _ => (args.get(1), args.get(2)),
    };

    let oflags = OFlag::from_bits_truncate(flags as _);
    let mode = if oflags.intersects(OFlag::O_CREAT | OFlag::O_TMPFILE) {
        mode & !(ctx.pcb.fs.read().umask as usize)
    } else {
        mode
    };

    let (result, _) = ctx.call(|call| {
        call.args.arg1 = flags;
        call.args.arg2 = mode;
    });

    let sfd = match result {
        Ok(sfd) => sfd,
        Err(e) => return ctx.fake(Err(e)),
    };

    let path = ctx
        .pcb
        .syscall
        .path
        .path()
        .map(PathBuf::from)
        .unwrap_or_default();

    ctx.install_placeholder(
        sfd,
        path,
        oflags.contains(OFlag::O_CLOEXEC),
        oflags.contains(OFlag::O_NONBLOCK),
    )
}

/// Records the kernel placeholder descriptor, or undoes the service-side
/// open if the kernel failed to allocate one.
pub fn open_out(ctx: &mut WrapContext) -> Result<Behavior> {
    let Pending::Open {
        service,
        sfd,
        path,
        cloexec,
    } = std::mem::take(&mut ctx.pcb.syscall.pending)
    else {
        return Ok(Behavior::Std);
    };

    let file = VirtualFile { service, sfd, path };
    let ret = ctx.pcb.syscall.kernel_ret;

    if ret < 0 {
        warn!("{} placeholder for sfd {sfd} failed: {ret}", ctx.pcb);
        let at = ctx.pcb.lookup_timestamp();
        close_service_fd(ctx.registry, ctx.epochs, at, ctx.id, ctx.pcb.pid, &file);
        return Ok(Behavior::Std);
    }

    debug!("{} fd {ret} -> service {service} sfd {sfd}", ctx.pcb);

    let replaced = ctx
        .pcb
        .fds
        .write()
        .insert(ret as _, FdEntry::new_virtual(file, cloexec));

    if let Some(old) = replaced {
        ctx.release(old);
    }

    Ok(Behavior::Std)
}

/// `close(fd)`. Runs for every descriptor; only virtual ones need work.
pub fn close_in(ctx: &mut WrapContext) -> Result<Behavior> {
    match (ctx.service(), ctx.fd()) {
        (Some(_), Some(fd)) => {
            ctx.pcb.syscall.pending = Pending::Close { fd };
            Ok(Behavior::CallOnExit)
        }
        _ => Ok(Behavior::Std),
    }
}

pub fn close_out(ctx: &mut WrapContext) -> Result<Behavior> {
    if let Pending::Close { fd } = std::mem::take(&mut ctx.pcb.syscall.pending) {
        // the descriptor is gone whatever close returned, unless it was not
        // open at all
        if ctx.pcb.syscall.kernel_ret != -(Errno::EBADF as i64) {
            let entry = ctx.pcb.fds.write().remove(fd);
            if let Some(entry) = entry {
                ctx.release(entry);
            }
        }
    }

    Ok(Behavior::Std)
}

/// `dup(old)`, `dup2(old, new)`, `dup3(old, new, flags)`.
pub fn dup_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let old = ctx.arg(0) as i32;
    let cloexec = ctx.entry.sysno == Sysno::dup3
        && OFlag::from_bits_truncate(ctx.arg(2) as _).contains(OFlag::O_CLOEXEC);

    let replaces_virtual = match ctx.entry.sysno {
        Sysno::dup2 | Sysno::dup3 => ctx.pcb.fd_entry(ctx.arg(1) as _).is_some(),
        _ => false,
    };

    if ctx.service().is_none() && !replaces_virtual {
        return Ok(Behavior::Std);
    }

    ctx.pcb.syscall.pending = Pending::Dup { old, cloexec };
    Ok(Behavior::CallOnExit)
}

/// Mirrors a successful kernel dup into the descriptor table.
pub fn dup_out(ctx: &mut WrapContext) -> Result<Behavior> {
    let Pending::Dup { old, cloexec } = std::mem::take(&mut ctx.pcb.syscall.pending) else {
        return Ok(Behavior::Std);
    };

    let new = ctx.pcb.syscall.kernel_ret;
    if new < 0 || new == old as i64 {
        return Ok(Behavior::Std);
    }

    let replaced = ctx.pcb.fds.write().duplicate(old, new as _, cloexec);
    if let Some(replaced) = replaced {
        ctx.release(replaced);
    }

    Ok(Behavior::Std)
}

/// `fcntl(fd, cmd, arg)` on a virtual descriptor. Status and descriptor
/// flags live on the placeholder, the rest goes to the service.
pub fn fcntl_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let Some(fd) = ctx.fd() else {
        return Ok(Behavior::Std);
    };
    let cmd = ctx.arg(1) as i32;

    match cmd {
        libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => {
            ctx.pcb.syscall.pending = Pending::Dup {
                old: fd,
                cloexec: cmd == libc::F_DUPFD_CLOEXEC,
            };
            Ok(Behavior::CallOnExit)
        }
        libc::F_SETFD => {
            let cloexec = ctx.arg(2) as i32 & libc::FD_CLOEXEC != 0;
            ctx.pcb.fds.write().set_cloexec(fd, cloexec);
            Ok(Behavior::Std)
        }
        libc::F_GETFD | libc::F_GETFL | libc::F_SETFL => Ok(Behavior::Std),
        _ => super::std_in(ctx),
    }
}

/// `ioctl(fd, request, argp)`. The service tells how much of `argp` it
/// reads and writes back for each request.
pub fn ioctl_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let Some(code) = ctx.service() else {
        return Ok(Behavior::Std);
    };

    let (request, argp) = (ctx.arg(1) as u64, ctx.arg(2));
    let shape = ctx.registry.ioctl_shape(code, request).unwrap_or_default();

    let input = try_caller!(ctx, ctx.memory().read_bytes(argp, shape.input_len));
    let (result, reply) = ctx.call(|call| call.input = input);

    if let (Ok(_), Reply::Bytes(bytes)) = (&result, reply) {
        try_caller!(ctx, ctx.copy_out(argp, shape.output_len, &bytes));
    }

    ctx.fake(result)
}
