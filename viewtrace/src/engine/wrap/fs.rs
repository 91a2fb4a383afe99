//! Per-process filesystem state: cwd, root and umask.

use std::path::PathBuf;

use log::{debug, info};
use nix::{errno::Errno, libc};
use syscalls::Sysno;

use crate::{
    error::Result,
    pcb::Pending,
    services::{CtlEvent, Reply},
    tracer::memory::CallerMemoryExt,
    types::{behavior::Behavior, file_stat::FileStat},
};

use super::{try_caller, WrapContext};

impl WrapContext<'_> {
    fn resolved_path(&self) -> Option<PathBuf> {
        self.pcb.syscall.path.path().map(PathBuf::from)
    }

    /// Metadata of the resolved target as the owning service reports it.
    fn service_stat(&mut self) -> std::result::Result<FileStat, Errno> {
        if let Some(stat) = self.pcb.syscall.stat {
            return Ok(stat);
        }

        let Some(handler) = self.handler_for(Sysno::lstat) else {
            return Err(Errno::ENOSYS);
        };

        match self.call_with(&handler, Sysno::lstat, |_| ()) {
            (Ok(_), Reply::Stat(st)) => Ok(st),
            (Ok(_), _) => Err(Errno::EIO),
            (Err(e), _) => Err(e),
        }
    }

    /// Checks that a directory served by a service can become the cwd or
    /// the root.
    fn virtual_dir(&mut self) -> std::result::Result<PathBuf, Errno> {
        let path = self.resolved_path().ok_or(Errno::ENOENT)?;
        if !self.service_stat()?.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        Ok(path)
    }
}

/// `chdir(path)`. A directory served by a service only changes the
/// recorded cwd; the kernel cwd stays where it was.
pub fn chdir_in(ctx: &mut WrapContext) -> Result<Behavior> {
    if ctx.service().is_some() {
        return match ctx.virtual_dir() {
            Ok(path) => {
                debug!("{} virtual cwd {path:?}", ctx.pcb);
                ctx.pcb.fs.write().cwd = path;
                ctx.fake(Ok(0))
            }
            Err(e) => ctx.fake(Err(e)),
        };
    }

    match ctx.resolved_path() {
        Some(path) => {
            ctx.pcb.syscall.pending = Pending::Chdir(path);
            Ok(Behavior::CallOnExit)
        }
        None => Ok(Behavior::Std),
    }
}

/// `fchdir(fd)`.
pub fn fchdir_in(ctx: &mut WrapContext) -> Result<Behavior> {
    if let Some(file) = ctx.virtual_file() {
        ctx.pcb.fs.write().cwd = file.path.clone();
        return ctx.fake(Ok(0));
    }

    ctx.pcb.syscall.pending = Pending::Fchdir;
    Ok(Behavior::CallOnExit)
}

/// `chroot(path)`.
pub fn chroot_in(ctx: &mut WrapContext) -> Result<Behavior> {
    if ctx.service().is_some() {
        return match ctx.virtual_dir() {
            Ok(path) => {
                info!("{} virtual root {path:?}", ctx.pcb);
                ctx.pcb.fs.write().root = path;
                ctx.fake(Ok(0))
            }
            Err(e) => ctx.fake(Err(e)),
        };
    }

    match ctx.resolved_path() {
        Some(path) => {
            ctx.pcb.syscall.pending = Pending::Chroot(path);
            Ok(Behavior::CallOnExit)
        }
        None => Ok(Behavior::Std),
    }
}

/// Commits a directory change the kernel carried out.
pub fn commit_out(ctx: &mut WrapContext) -> Result<Behavior> {
    let pending = std::mem::take(&mut ctx.pcb.syscall.pending);
    if ctx.pcb.syscall.kernel_ret != 0 {
        return Ok(Behavior::Std);
    }

    match pending {
        Pending::Chdir(path) => ctx.pcb.fs.write().cwd = path,
        Pending::Chroot(path) => ctx.pcb.fs.write().root = path,
        Pending::Fchdir => {
            let cwd = procfs::process::Process::new(ctx.pcb.pid.as_raw())
                .and_then(|p| p.cwd());
            match cwd {
                Ok(cwd) => ctx.pcb.fs.write().cwd = cwd,
                Err(e) => debug!("{} cannot read cwd after fchdir: {e}", ctx.pcb),
            }
        }
        _ => (),
    }

    Ok(Behavior::Std)
}

/// `getcwd(buf, size)` reports the recorded cwd as seen inside the root.
pub fn getcwd_in(ctx: &mut WrapContext) -> Result<Behavior> {
    use std::os::unix::ffi::OsStrExt;

    let (buf, size) = (ctx.arg(0), ctx.arg(1));

    let mut bytes = ctx
        .pcb
        .fs
        .read()
        .visible_cwd()
        .as_os_str()
        .as_bytes()
        .to_vec();
    bytes.push(0);

    if size < bytes.len() {
        return ctx.fake(Err(Errno::ERANGE));
    }

    try_caller!(ctx, ctx.memory().write_bytes(buf, &bytes));
    ctx.fake(Ok(bytes.len() as _))
}

/// `umask(mask)`: the kernel keeps its own copy, ours is used for files
/// created by services.
pub fn umask_in(ctx: &mut WrapContext) -> Result<Behavior> {
    ctx.pcb.fs.write().umask = ctx.arg(0) as u32 & 0o777;
    Ok(Behavior::Std)
}

/// `mount(source, target, fstype, flags, data)`. The service records the
/// mount; the others learn about it through a control event.
pub fn mount_in(ctx: &mut WrapContext) -> Result<Behavior> {
    let Some(service) = ctx.service() else {
        return Ok(Behavior::Std);
    };
    let target = ctx.resolved_path().unwrap_or_default();

    let flags = ctx.arg(3) & !(libc::MS_MGC_MSK as usize);
    let (result, _) = ctx.call(|call| call.args.arg3 = flags);

    if result.is_ok() {
        info!(
            "{} mounted {:?} ({}) on {target:?}",
            ctx.pcb,
            ctx.pcb.syscall.strings.first(),
            ctx.registry.name(service).unwrap_or("?"),
        );
        ctx.registry
            .broadcast(&CtlEvent::MountAdded { service, target }, Some(service));
    }

    ctx.fake(result)
}
