//! The two-phase dispatch state machine of one syscall invocation.

use log::{debug, trace, warn};
use nix::errno::Errno;

use crate::{
    error::{Error, Result, SysResultExt},
    services::Choice,
    tracer::ResumeAction,
    types::behavior::{Behavior, Phase},
};

use super::{sctab::ScFlags, wrap::WrapContext};

impl WrapContext<'_> {
    /// Selects the service and runs wrap-in. Arguments must already be
    /// resolved; a resumed call keeps the ones resolved at its first entry.
    fn run_entry(&mut self) -> Result<Behavior> {
        if let Some(errno) = self.pcb.syscall.path.error() {
            return self.fake(Err(errno));
        }

        let choice = self.choose();
        self.pcb.syscall.service = choice.service();

        match choice {
            Choice::Reserved => self.fake(Err(Errno::EBADF)),
            Choice::None if !self.entry.flags.contains(ScFlags::ALWAYS) => Ok(Behavior::Std),
            _ => {
                if self.service().is_some() && self.entry.flags.intersects(ScFlags::BLOCKING) {
                    if let Some(suspended) = self.check_ready(Phase::Entry)? {
                        return Ok(suspended);
                    }
                }

                (self.entry.wrap_in)(self)
            }
        }
    }

    /// Entry phase. Returns how to let the process go, `None` if it stays
    /// stopped until a wakeup.
    pub(crate) fn enter(&mut self) -> Result<Option<ResumeAction>> {
        let behavior = self.run_entry()?;
        self.pcb.syscall.behavior = behavior;

        debug!(
            "{} {} -> {} (service {:?})",
            self.pcb,
            self.entry.sysno,
            behavior.name(),
            self.pcb.syscall.service
        );

        Ok(match behavior {
            Behavior::Std | Behavior::ModifiedArgs | Behavior::CallOnExit => {
                Some(ResumeAction::Continue)
            }
            Behavior::Fake => {
                let out = (self.entry.wrap_out)(self)?;
                if out.is_suspended() {
                    warn!("{} faked {} cannot suspend at exit", self.pcb, self.entry.sysno);
                }
                Some(ResumeAction::SkipSyscall)
            }
            Behavior::Suspended(_) => None,
        })
    }

    /// Exit phase. `kernel_ret` is the value the kernel returned, `None`
    /// when resuming a call suspended at exit.
    pub(crate) fn exit(&mut self, kernel_ret: Option<i64>) -> Result<Option<ResumeAction>> {
        let syscall = &mut self.pcb.syscall;

        let action = match syscall.behavior {
            Behavior::Std | Behavior::ModifiedArgs => Some(ResumeAction::Continue),
            Behavior::Fake => Some(ResumeAction::SetReturn(syscall.result.into_raw())),
            Behavior::CallOnExit | Behavior::Suspended(Phase::Exit) => {
                if let Some(ret) = kernel_ret {
                    syscall.kernel_ret = ret;
                    syscall.result = if ret < 0 {
                        Err(Errno::from_raw(-ret as _))
                    } else {
                        Ok(ret)
                    };
                }
                syscall.behavior = Behavior::CallOnExit;

                match (self.entry.wrap_out)(self)? {
                    Behavior::Suspended(_) => {
                        self.pcb.syscall.behavior = Behavior::Suspended(Phase::Exit);
                        None
                    }
                    Behavior::ModifiedArgs | Behavior::Fake => Some(ResumeAction::SetReturn(
                        self.pcb.syscall.result.into_raw(),
                    )),
                    Behavior::Std | Behavior::CallOnExit => Some(ResumeAction::Continue),
                }
            }
            Behavior::Suspended(Phase::Entry) => return Err(Error::InvalidState),
        };

        trace!(
            "{} {} exit: {:?}",
            self.pcb,
            self.entry.sysno,
            action
        );

        Ok(action)
    }

    /// Wrap-out helper: parks the process until the descriptor is ready.
    pub fn suspend_until_ready(&mut self) -> Result<Option<Behavior>> {
        self.check_ready(Phase::Exit)
    }
}
