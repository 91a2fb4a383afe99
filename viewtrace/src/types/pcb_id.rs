use std::fmt::Display;

/// Stable handle to a process control block. A released slot bumps its
/// generation, so a stale id never resolves to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PcbId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl PcbId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as _
    }

    /// The 1-based process number used in log output, as stable as the slot.
    pub fn umpid(&self) -> usize {
        self.index as usize + 1
    }
}

impl Display for PcbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.umpid(), self.generation)
    }
}
