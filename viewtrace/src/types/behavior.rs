use strum::{EnumIter, IntoStaticStr};

/// Which half of a syscall invocation the dispatch core is processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Entry,
    Exit,
}

/// Outcome of dispatching one phase of an intercepted syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Behavior {
    /// The real syscall runs untouched and no exit processing is needed.
    Std,

    /// Fully virtualized. The kernel never executes the call; the recorded
    /// result is returned to the process at the exit stop.
    Fake,

    /// Arguments may have been rewritten. The real syscall runs and the exit
    /// phase has to post-process its result.
    CallOnExit,

    /// Arguments (at entry) or the return value (at exit) were rewritten.
    /// Nothing else is left to do for this phase.
    ModifiedArgs,

    /// Parked until a readiness wakeup re-enters dispatch at this phase.
    Suspended(Phase),
}

impl Behavior {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Behavior::Suspended(_))
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}
