pub mod fd_table;
pub mod store;

use std::{
    fmt::{Debug, Display},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::warn;
use nix::{errno::Errno, unistd::Pid};
use parking_lot::RwLock;
use syscalls::SyscallArgs;

use crate::{
    epoch::{Epoch, Timestamp, TreepochId},
    error::{Result, SysResult},
    scheduler::WakeupId,
    tracer::Handle,
    types::{
        behavior::{Behavior, Phase},
        file_stat::FileStat,
        pcb_id::PcbId,
        service_code::ServiceCode,
    },
};

use self::fd_table::{FdEntry, FdTable};

pub use self::store::PcbStore;

/// Per-process filesystem state. Shared between processes created with
/// `CLONE_FS`, copied otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsState {
    /// Absolute host path, including the root prefix.
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub umask: u32,
}

impl FsState {
    pub fn new(cwd: impl Into<PathBuf>, root: impl Into<PathBuf>, umask: u32) -> Self {
        Self {
            cwd: cwd.into(),
            root: root.into(),
            umask,
        }
    }

    /// Reads the state of a process that was not created under tracing.
    pub fn of_process(pid: Pid) -> Result<Self> {
        let process = procfs::process::Process::new(pid.as_raw())?;
        let cwd = process.cwd()?;
        let umask = process.status()?.umask.unwrap_or(0o022);

        Ok(Self::new(cwd, "/", umask))
    }

    /// State of a process that was not created under tracing, falling back to
    /// the tracer's own cwd if it cannot be read.
    pub fn of_process_or_current(pid: Pid) -> Self {
        Self::of_process(pid).unwrap_or_else(|e| {
            warn!("Cannot read fs state of {pid}: {e}, using the tracer's");
            Self::new(
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
                "/",
                0o022,
            )
        })
    }

    /// The cwd as seen from inside the root, which is what `getcwd` reports.
    pub fn visible_cwd(&self) -> PathBuf {
        match self.cwd.strip_prefix(&self.root) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => self.cwd.clone(),
        }
    }
}

pub type SharedFs = Arc<RwLock<FsState>>;
pub type SharedFds = Arc<RwLock<FdTable>>;

/// Resolved path slot of the in-flight syscall.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PathSlot {
    #[default]
    None,
    Resolved(PathBuf),

    /// Resolution failed; the syscall is short-circuited with this error.
    Error(Errno),
}

impl PathSlot {
    pub fn path(&self) -> Option<&Path> {
        match self {
            PathSlot::Resolved(p) => Some(p),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<Errno> {
        match self {
            PathSlot::Error(e) => Some(*e),
            _ => None,
        }
    }
}

/// State a wrapper carries from the entry to the exit of the same syscall.
#[derive(Debug, Clone, Default)]
pub enum Pending {
    #[default]
    None,

    /// A service-side descriptor waiting for the kernel placeholder fd.
    Open {
        service: ServiceCode,
        sfd: i64,
        path: PathBuf,
        cloexec: bool,
    },

    /// A kernel-side dup of `old` whose result has to be mirrored.
    Dup { old: i32, cloexec: bool },

    /// A virtual descriptor whose kernel placeholder is being closed.
    Close { fd: i32 },

    /// Directory change to be committed if the kernel succeeds.
    Chdir(PathBuf),

    /// Root change to be committed if the kernel succeeds.
    Chroot(PathBuf),

    /// A real `fchdir` whose target is read back at exit.
    Fchdir,

    /// An exec whose success drops close-on-exec descriptors.
    Exec,
}

#[derive(Debug, Clone)]
pub struct SyscallState {
    pub sysno: usize,
    pub args: SyscallArgs,
    pub path: PathSlot,

    /// Second path of `rename`/`link`.
    pub path2: PathSlot,
    pub stat: Option<FileStat>,

    /// Descriptor of a descriptor call or an `AT_EMPTY_PATH` lookup.
    pub fd: Option<i32>,
    pub strings: Vec<String>,
    pub service: Option<ServiceCode>,
    pub behavior: Behavior,
    pub result: SysResult,
    pub kernel_ret: i64,
    pub pending: Pending,
}

impl Default for SyscallState {
    fn default() -> Self {
        Self {
            sysno: 0,
            args: SyscallArgs::new(0, 0, 0, 0, 0, 0),
            path: PathSlot::None,
            path2: PathSlot::None,
            stat: None,
            fd: None,
            strings: Vec::new(),
            service: None,
            behavior: Behavior::Std,
            result: Ok(0),
            kernel_ret: 0,
            pending: Pending::None,
        }
    }
}

/// Continuation of a syscall waiting for a readiness wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parked {
    pub phase: Phase,
    pub wakeup: WakeupId,
    pub service: ServiceCode,
    pub sfd: i64,
}

pub struct Pcb {
    pub handle: Handle,
    pub pid: Pid,

    /// Relation only. Set to `None` when the parent goes away.
    pub parent: Option<PcbId>,
    pub children: Vec<PcbId>,

    /// Slot lies outside the initial table.
    pub dynamic: bool,

    pub timestamp: Timestamp,
    pub nest_epoch: Epoch,

    pub fs: SharedFs,
    pub fds: SharedFds,

    /// Stop the process is currently held at, if inside a syscall.
    pub in_syscall: Option<Phase>,
    pub syscall: SyscallState,
    pub parked: Option<Parked>,

    pub tmpfile_to_unlink: Option<PathBuf>,
}

impl Pcb {
    pub fn treepoch(&self) -> TreepochId {
        self.timestamp.treepoch
    }

    /// The timestamp service lookups for the in-flight syscall are made at.
    pub fn lookup_timestamp(&self) -> Timestamp {
        self.timestamp.with_epoch(self.nest_epoch)
    }

    /// Sets the nesting epoch if `epoch` is not [`Epoch::NONE`] and returns
    /// the previous value.
    pub fn set_nest_epoch(&mut self, epoch: Epoch) -> Epoch {
        let old = self.nest_epoch;
        if !epoch.is_none() {
            self.nest_epoch = epoch;
        }
        old
    }

    pub fn fd_entry(&self, fd: i32) -> Option<FdEntry> {
        self.fds.read().get(fd).cloned()
    }

    pub fn is_parked(&self) -> bool {
        self.parked.is_some()
    }
}

impl Debug for Pcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pcb")
            .field("handle", &self.handle)
            .field("pid", &self.pid.as_raw())
            .field("parent", &self.parent)
            .field("timestamp", &self.timestamp)
            .field("in_syscall", &self.in_syscall)
            .field("parked", &self.parked)
            .finish()
    }
}

impl Display for Pcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_cwd_strips_root() {
        let fs = FsState::new("/jail/home/u", "/jail", 0o022);
        assert_eq!(fs.visible_cwd(), PathBuf::from("/home/u"));

        let fs = FsState::new("/jail", "/jail", 0o022);
        assert_eq!(fs.visible_cwd(), PathBuf::from("/"));

        let fs = FsState::new("/tmp", "/", 0o022);
        assert_eq!(fs.visible_cwd(), PathBuf::from("/tmp"));
    }

    #[test]
    fn test_path_slot_accessors() {
        assert_eq!(PathSlot::Error(Errno::ENOENT).error(), Some(Errno::ENOENT));
        assert_eq!(PathSlot::Error(Errno::ENOENT).path(), None);
        assert_eq!(
            PathSlot::Resolved("/a".into()).path(),
            Some(Path::new("/a"))
        );
    }
}
