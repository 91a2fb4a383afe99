use nix::unistd::Pid;

use crate::{
    epoch::TreepochId,
    error::Result,
    types::{exit_reason::ExitReason, pcb_id::PcbId},
};

/// Identity of a traced process as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: PcbId,
    pub pid: Pid,
    pub parent: Option<PcbId>,
    pub treepoch: TreepochId,
}

#[allow(unused_variables)]
pub trait ProcessLifetimeHook {
    /// Called after a process got its control block
    fn handle_process_added(&self, process: &ProcessInfo) -> Result<()> {
        Ok(())
    }

    /// Called before the control block of a process is released. `exit` is
    /// `None` if the process did not terminate (the session is torn down).
    fn handle_process_removed(
        &self,
        process: &ProcessInfo,
        exit: Option<&ExitReason>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once the last traced process is gone
    fn handle_all_fini(&self) -> Result<()> {
        Ok(())
    }
}
