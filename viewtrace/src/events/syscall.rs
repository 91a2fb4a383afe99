use nix::errno::Errno;

use crate::{
    engine::sctab::ScClass,
    error::Result,
    types::{behavior::Behavior, pcb_id::PcbId, service_code::ServiceCode},
};

/// Outcome of the entry phase of one intercepted syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallDecision {
    pub id: PcbId,
    pub sysno: usize,

    /// `None` for virtual calls.
    pub class: Option<ScClass>,
    pub service: Option<ServiceCode>,
    pub behavior: Behavior,
    pub path_error: Option<Errno>,
}

#[allow(unused_variables)]
pub trait SyscallEventHook {
    fn handle_syscall_entry(&self, decision: &SyscallDecision) -> Result<()> {
        Ok(())
    }

    /// `ret` is the value the process sees.
    fn handle_syscall_exit(&self, id: PcbId, sysno: usize, ret: i64) -> Result<()> {
        Ok(())
    }

    /// A parked process was resumed by a wakeup.
    fn handle_syscall_resumed(&self, id: PcbId, sysno: usize) -> Result<()> {
        Ok(())
    }
}
