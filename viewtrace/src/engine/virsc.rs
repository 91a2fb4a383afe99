//! Virtual calls: syscall numbers no kernel implements, through which
//! processes of a view manage the service table, query the view they run in
//! and talk to services directly.
//!
//! `VIRSC_MGMT` takes a [`VirscOp`] in its first argument followed by the
//! operation arguments. `VIRSC_SERVICE` takes a service code and a virtual
//! call number, and hands the remaining four arguments to the handler.

use std::os::unix::ffi::OsStringExt;

use log::{debug, info};
use nix::{errno::Errno, sys::signal::Signal};
use strum::FromRepr;
use syscalls::{SyscallArgs, Sysno};

use crate::{
    error::{Error, Result, SysResult},
    tracer::{
        memory::{CallerMemoryExt, TracedMemory},
        Tracer,
    },
    types::{pcb_id::PcbId, service_code::ServiceCode},
};

use super::{wrap::caller_errno, Engine};

pub const VIRSC_BASE: usize = 0xbe00;
pub const VIRSC_MGMT: usize = VIRSC_BASE;
pub const VIRSC_SERVICE: usize = VIRSC_BASE + 1;
const VIRSC_END: usize = VIRSC_BASE + 2;

/// Longest view or module name accepted from a process.
pub const NAME_MAX: usize = 255;

/// The syscall number handlers of virtual calls see. `vserver` is never
/// implemented by the kernel.
pub const VIRTUAL_SYSNO: Sysno = Sysno::vserver;

pub fn is_virtual(sysno: usize) -> bool {
    (VIRSC_BASE..VIRSC_END).contains(&sysno)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(usize)]
pub enum VirscOp {
    /// `(name, position)`: loads a module of the catalog. A negative
    /// position appends. Returns the service code.
    Add = 0,
    /// `(code)`
    Del,
    /// `(code, position)`
    Mov,
    /// `(buf, len)`: writes one code per byte in priority order. Returns
    /// the number of services.
    List,
    /// `(code, buf, len)`: writes the NUL-terminated service name.
    Name,
    Lock,
    /// Starts a nested view for the caller. Returns its view id.
    Recursive,
    /// `(info)`: fills a [`ViewInfo`].
    GetViewInfo,
    /// `(name)`
    SetViewName,
    /// `(signal)`: signals every other process of the caller's view and of
    /// the views nested in it.
    KillAll,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ViewInfo {
    pub server_pid: i32,
    pub view_id: u32,
    pub view_name: [u8; NAME_MAX + 1],
}

fn position(arg: usize) -> Option<usize> {
    match arg as isize {
        p if p < 0 => None,
        p => Some(p as usize),
    }
}

fn service_code(arg: usize) -> std::result::Result<ServiceCode, Errno> {
    u8::try_from(arg)
        .ok()
        .map(ServiceCode)
        .filter(|c| c.is_assignable())
        .ok_or(Errno::EINVAL)
}

impl<T: Tracer> Engine<'_, '_, T> {
    /// Performs the virtual call `sysno` of `id`. The outcome is always
    /// faked.
    pub(super) fn virtual_call(&mut self, id: PcbId, sysno: usize) -> Result<SysResult> {
        let args = self.pcbs.get(id).ok_or(Error::InvalidState)?.syscall.args;

        let outcome = match sysno {
            VIRSC_MGMT => match VirscOp::from_repr(args.arg0) {
                Some(op) => self.management_call(id, op, &args).map(Ok),
                None => Ok(Err(Errno::ENOSYS)),
            },
            VIRSC_SERVICE => self.service_virtual_call(id, &args),
            _ => Ok(Err(Errno::ENOSYS)),
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(e) => Ok(Err(caller_errno(e)?)),
        }
    }

    fn management_call(&mut self, id: PcbId, op: VirscOp, args: &SyscallArgs) -> Result<i64> {
        let pcb = self.pcbs.get(id).ok_or(Error::InvalidState)?;
        let (handle, pid, treepoch) = (pcb.handle, pcb.pid, pcb.treepoch());

        debug!("{pcb} virtual call {op:?}");

        match op {
            VirscOp::Add => {
                let name = TracedMemory::new(&mut self.tracer, handle)
                    .read_cstring(args.arg1, NAME_MAX)?;
                let name = String::from_utf8(name).map_err(|_| Errno::EINVAL)?;

                let factory = self
                    .config
                    .catalog
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| Error::UnknownModule(name.clone()))?;

                let code = self.register_service(factory()?, position(args.arg2), Some(treepoch))?;
                info!("{pid} loaded module {name} as {code}");

                Ok(code.0 as _)
            }
            VirscOp::Del => {
                self.deregister_service(service_code(args.arg1)?)?;
                Ok(0)
            }
            VirscOp::Mov => {
                let position = position(args.arg2).unwrap_or(usize::MAX);
                self.registry.move_to(service_code(args.arg1)?, position)?;
                Ok(0)
            }
            VirscOp::List => {
                let codes: Vec<u8> = self.registry.list().into_iter().map(|c| c.0).collect();
                let n = codes.len().min(args.arg2);
                TracedMemory::new(&mut self.tracer, handle).write_bytes(args.arg1, &codes[..n])?;
                Ok(codes.len() as _)
            }
            VirscOp::Name => {
                let mut name = self
                    .registry
                    .name(service_code(args.arg1)?)
                    .ok_or(Error::NoSuchService)?
                    .as_bytes()
                    .to_vec();
                if name.len() + 1 > args.arg3 {
                    return Err(Errno::ERANGE.into());
                }
                name.push(0);
                TracedMemory::new(&mut self.tracer, handle).write_bytes(args.arg2, &name)?;
                Ok(0)
            }
            VirscOp::Lock => {
                self.registry.lock();
                Ok(0)
            }
            VirscOp::Recursive => {
                let nested = self.epochs.new_fork(Some(treepoch));
                self.epochs.new_proc(nested);
                self.epochs.del_proc(treepoch);

                let pcb = self.pcbs.get_mut(id).ok_or(Error::InvalidState)?;
                pcb.timestamp.treepoch = nested;

                let view = self.epochs.view_id(nested).unwrap_or_default();
                info!("{pid} started nested view {view}");

                Ok(view as _)
            }
            VirscOp::GetViewInfo => {
                let mut info = ViewInfo {
                    server_pid: self.config.server_pid.as_raw(),
                    view_id: self.epochs.view_id(treepoch).unwrap_or_default(),
                    view_name: [0; NAME_MAX + 1],
                };
                if let Some(name) = self.epochs.view_name(treepoch) {
                    let n = name.len().min(NAME_MAX);
                    info.view_name[..n].copy_from_slice(&name.as_bytes()[..n]);
                }

                TracedMemory::new(&mut self.tracer, handle).write_value(args.arg1, &info)?;
                Ok(0)
            }
            VirscOp::SetViewName => {
                let name = TracedMemory::new(&mut self.tracer, handle)
                    .read_cstring(args.arg1, NAME_MAX)?;
                let name = std::ffi::OsString::from_vec(name).to_string_lossy().into_owned();

                self.epochs.set_view_name(treepoch, name);
                Ok(0)
            }
            VirscOp::KillAll => {
                let signal = Signal::try_from(args.arg1 as i32)?;
                let victims: Vec<_> = self
                    .pcbs
                    .iter()
                    .filter(|(other, p)| {
                        *other != id && self.epochs.same_view_or_nested(treepoch, p.treepoch())
                    })
                    .map(|(_, p)| p.pid)
                    .collect();

                info!("{pid} sends {signal} to {} processes", victims.len());

                for victim in victims {
                    // the process may be exiting already
                    let _ = self.tracer.kill(victim, signal);
                }
                Ok(0)
            }
        }
    }

    fn service_virtual_call(&mut self, id: PcbId, args: &SyscallArgs) -> Result<SysResult> {
        let code = match service_code(args.arg0) {
            Ok(code) => code,
            Err(e) => return Ok(Err(e)),
        };
        let Some(handler) = self.registry.virtual_handler(code, args.arg1) else {
            return Ok(Err(Errno::ENOSYS));
        };

        let pcb = self.pcbs.get(id).ok_or(Error::InvalidState)?;
        let (handle, pid, at) = (pcb.handle, pcb.pid, pcb.lookup_timestamp());

        let mut memory = TracedMemory::new(&mut self.tracer, handle);
        let shifted = SyscallArgs::new(args.arg2, args.arg3, args.arg4, args.arg5, 0, 0);
        let mut call = crate::services::ServiceCall::new(
            id,
            pid,
            VIRTUAL_SYSNO,
            shifted,
            &mut memory,
            &mut self.epochs,
            at,
        );

        Ok(handler(&mut call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_range() {
        assert!(is_virtual(VIRSC_MGMT));
        assert!(is_virtual(VIRSC_SERVICE));
        assert!(!is_virtual(VIRSC_END));
        assert!(!is_virtual(Sysno::open.id() as _));
    }

    #[test]
    fn test_decode_arguments() {
        assert_eq!(VirscOp::from_repr(3), Some(VirscOp::List));
        assert_eq!(VirscOp::from_repr(42), None);
        assert_eq!(position(-1isize as usize), None);
        assert_eq!(position(2), Some(2));
        assert_eq!(service_code(0x10), Ok(ServiceCode(0x10)));
        assert_eq!(service_code(0xff), Err(Errno::EINVAL));
        assert_eq!(service_code(0x1ff), Err(Errno::EINVAL));
    }
}
