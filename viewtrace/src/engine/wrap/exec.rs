//! `execve` and `execveat`.
//!
//! The kernel can only execute files it can open. An executable served by a
//! service is either executed by the service itself, handed back to the
//! kernel (`ERESTART`), or copied into a host temporary file which is
//! deleted at the next syscall of the new image.

use std::{
    fs::OpenOptions,
    io::Write,
    os::unix::{ffi::OsStrExt, fs::OpenOptionsExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};
use nix::{errno::Errno, fcntl::AtFlags, fcntl::OFlag, libc};
use scopeguard::guard;
use syscalls::{SyscallArgs, Sysno};

use crate::{
    error::Result,
    pcb::Pending,
    services::{ChoiceQuery, Reply},
    types::behavior::Behavior,
};

use super::WrapContext;

/// Chunk size of the copy of a service-owned executable.
const COPY_CHUNK: usize = 64 * 1024;

impl WrapContext<'_> {
    /// Index of the path argument of the raw call.
    fn exec_path_arg(&self) -> usize {
        match self.entry.sysno {
            Sysno::execveat => 1,
            _ => 0,
        }
    }

    /// Points the kernel at `path` instead of the caller's path.
    fn redirect_exec(&mut self, path: &Path) -> Result<()> {
        let mut bytes = path.as_os_str().as_bytes().to_vec();
        bytes.push(0);
        let addr = self.stack_scratch(&bytes)?;

        self.rewrite_arg(self.exec_path_arg(), addr)?;
        if self.entry.sysno == Sysno::execveat {
            self.rewrite_arg(0, libc::AT_FDCWD as _)?;
            let flags = AtFlags::from_bits_truncate(self.arg(4) as _) - AtFlags::AT_EMPTY_PATH;
            self.rewrite_arg(4, flags.bits() as _)?;
        }

        Ok(())
    }

    fn exec_target(&self) -> Option<PathBuf> {
        match self.pcb.syscall.path.path() {
            Some(p) => Some(p.to_path_buf()),
            None => self.virtual_file().map(|f| f.path.clone()),
        }
    }

    /// Asks the services registered after the call started (one epoch
    /// ahead, so a mount made right before the exec counts) for an
    /// interpreter of `path`.
    fn binfmt_interpreter(&mut self, path: &Path) -> Option<PathBuf> {
        let next = self.pcb.nest_epoch.next();
        let old = self.pcb.set_nest_epoch(next);

        let mut ctx = guard(&mut *self, move |ctx| {
            ctx.pcb.nest_epoch = old;
        });

        let at = ctx.pcb.lookup_timestamp();
        let code = ctx
            .registry
            .select(&ChoiceQuery::BinFmt(path), at, ctx.epochs)
            .service()?;
        let handler = ctx.registry.syscall_handler(code, Sysno::execve)?;

        let (result, reply) = ctx.call_with(&handler, Sysno::execve, |call| {
            call.path = Some(path.to_path_buf());
        });

        match (result, reply) {
            (Ok(_), Reply::Path(interp)) => {
                debug!("{} binfmt {path:?} -> {interp:?}", ctx.pcb);
                Some(interp)
            }
            _ => None,
        }
    }

    /// Copies a service-owned executable into a host file the kernel can
    /// execute.
    fn copy_executable(&mut self, path: &Path) -> std::result::Result<PathBuf, Errno> {
        let (Some(open), Some(read), Some(close)) = (
            self.handler_for(Sysno::open),
            self.handler_for(Sysno::read),
            self.handler_for(Sysno::close),
        ) else {
            return Err(Errno::ENOEXEC);
        };

        let (result, _) = self.call_with(&open, Sysno::open, |call| {
            call.path = Some(path.to_path_buf());
            call.args = SyscallArgs::new(0, OFlag::O_RDONLY.bits() as _, 0, 0, 0, 0);
        });
        let sfd = result?;

        let tmp = self.config.tmp_dir.join(format!(
            "viewtrace-exec-{}-{}",
            self.pcb.pid,
            self.epochs.now().0
        ));

        let copied = (|| {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o700)
                .open(&tmp)
                .map_err(|_| Errno::EACCES)?;

            loop {
                let (result, reply) = self.call_with(&read, Sysno::read, |call| {
                    call.sfd = Some(sfd);
                    call.args = SyscallArgs::new(sfd as _, 0, COPY_CHUNK, 0, 0, 0);
                });
                result?;

                match reply {
                    Reply::Bytes(bytes) if !bytes.is_empty() => {
                        file.write_all(&bytes).map_err(|_| Errno::EIO)?
                    }
                    _ => break Ok::<_, Errno>(()),
                }
            }
        })();

        let _ = self.call_with(&close, Sysno::close, |call| {
            call.sfd = Some(sfd);
            call.args = SyscallArgs::new(sfd as _, 0, 0, 0, 0, 0);
        });

        match copied {
            Ok(()) => Ok(tmp),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        }
    }
}

pub fn execve_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let Some(target) = ctx.exec_target() else {
        ctx.pcb.syscall.pending = Pending::Exec;
        return Ok(Behavior::CallOnExit);
    };

    if let Some(interp) = ctx.binfmt_interpreter(&target) {
        ctx.redirect_exec(&interp)?;
        ctx.pcb.syscall.pending = Pending::Exec;
        return Ok(Behavior::CallOnExit);
    }

    if ctx.service().is_some() {
        let (result, _) = ctx.call(|call| call.path = Some(target.clone()));

        match result {
            Err(Errno::ERESTART) => (),
            Err(Errno::ENOSYS) => match ctx.copy_executable(&target) {
                Ok(copy) => {
                    info!("{} executing {target:?} from {copy:?}", ctx.pcb);
                    ctx.redirect_exec(&copy)?;
                    ctx.pcb.tmpfile_to_unlink = Some(copy);
                }
                Err(e) => return ctx.fake(Err(e)),
            },
            result => return ctx.fake(result),
        }
    }

    ctx.pcb.syscall.pending = Pending::Exec;
    Ok(Behavior::CallOnExit)
}

/// A successful exec closes the close-on-exec descriptors and unshares the
/// descriptor table.
pub fn execve_out(ctx: &mut WrapContext) -> Result<Behavior> {
    if !matches!(
        std::mem::take(&mut ctx.pcb.syscall.pending),
        Pending::Exec
    ) || ctx.pcb.syscall.kernel_ret != 0
    {
        return Ok(Behavior::Std);
    }

    if Arc::strong_count(&ctx.pcb.fds) > 1 {
        let copy = ctx.pcb.fds.read().clone();
        ctx.pcb.fds = Arc::new(parking_lot::RwLock::new(copy));
    }

    let closed = ctx.pcb.fds.write().take_cloexec();
    if !closed.is_empty() {
        debug!("{} exec closes {} virtual fds", ctx.pcb, closed.len());
    }
    for entry in closed {
        ctx.release(entry);
    }

    Ok(Behavior::Std)
}
