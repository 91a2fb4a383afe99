//! Service modules: pluggable handler sets that take over the syscalls of
//! the paths, descriptors, sockets and filesystem types they claim.

pub mod call;
pub mod descriptor;
pub mod memfs;
pub mod mount_table;
pub mod registry;

use std::{path::Path, sync::Arc};

use bitflags::bitflags;
use nix::unistd::Pid;
use strum::{EnumCount, EnumIter, FromRepr, IntoStaticStr};

use crate::{
    epoch::{Epoch, EpochTracker, Timestamp},
    error::SysResult,
    scheduler::{Interest, Waker, WakeupId},
    types::{pcb_id::PcbId, service_code::ServiceCode},
};

pub use self::{
    call::{Reply, ServiceCall},
    descriptor::{ServiceDescriptor, ServiceDescriptorBuilder},
    mount_table::{Mount, MountTable},
    registry::{Choice, HandlerIndex, ServiceRegistry},
};

pub type SysHandler = Arc<dyn Fn(&mut ServiceCall) -> SysResult + Send + Sync>;

pub type ChoiceFn = Arc<dyn Fn(&ChoiceQuery, &ChoiceContext) -> Claim + Send + Sync>;

pub type CtlFn = Arc<dyn Fn(&CtlEvent) + Send + Sync>;

pub type IoctlShapeFn = Arc<dyn Fn(u64) -> Option<IoctlShape> + Send + Sync>;

/// What a service is asked to claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceQuery<'a> {
    /// An absolute, canonical path.
    Path(&'a Path),
    Socket { domain: i32 },

    /// Filesystem type of a mount request.
    FsType(&'a str),
    Syscall(usize),
    IoctlParams { request: u64 },

    /// An executable about to be exec'd, checked for an interpreter.
    BinFmt(&'a Path),
}

/// Answer of a choice predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Decline,

    /// Owned by this service as of the given (non-zero) epoch.
    Own(Epoch),

    /// Held by another virtualization layer; the caller gets `EBADF`.
    Foreign,
}

/// Temporal context a predicate is evaluated in.
pub struct ChoiceContext<'a> {
    epochs: &'a EpochTracker,
    at: Timestamp,
    registered: Timestamp,
}

impl<'a> ChoiceContext<'a> {
    pub fn new(epochs: &'a EpochTracker, at: Timestamp, registered: Timestamp) -> Self {
        Self {
            epochs,
            at,
            registered,
        }
    }

    /// Timestamp of the lookup.
    pub fn at(&self) -> Timestamp {
        self.at
    }

    /// Epoch of `stamp` if it is visible from the lookup, [`Epoch::NONE`]
    /// otherwise.
    pub fn matching_epoch(&self, stamp: Timestamp) -> Epoch {
        self.epochs.matching_epoch(stamp, self.at)
    }

    /// Claim made as of the service's own registration.
    pub fn own(&self) -> Claim {
        match self.matching_epoch(self.registered) {
            e if e.is_none() => Claim::Decline,
            e => Claim::Own(e),
        }
    }

    /// Claim made as of `stamp`, declining if it is not visible.
    pub fn own_at(&self, stamp: Timestamp) -> Claim {
        match self.matching_epoch(stamp) {
            e if e.is_none() => Claim::Decline,
            e => Claim::Own(e),
        }
    }
}

pub fn decline_all() -> ChoiceFn {
    Arc::new(|_, _| Claim::Decline)
}

bitflags! {
    /// Lifecycle classes a service can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CtlClasses: u32 {
        const PROC = 1;
        const MODULE = 2;
        const MOUNT = 4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlEvent {
    ProcessAdded {
        id: PcbId,
        pid: Pid,
        parent: Option<PcbId>,
    },
    ProcessRemoved {
        id: PcbId,
        pid: Pid,
    },
    ModuleAdded(ServiceCode),
    ModuleRemoved(ServiceCode),
    MountAdded {
        service: ServiceCode,
        target: std::path::PathBuf,
    },
}

impl CtlEvent {
    pub fn class(&self) -> CtlClasses {
        match self {
            CtlEvent::ProcessAdded { .. } | CtlEvent::ProcessRemoved { .. } => CtlClasses::PROC,
            CtlEvent::ModuleAdded(_) | CtlEvent::ModuleRemoved(_) => CtlClasses::MODULE,
            CtlEvent::MountAdded { .. } => CtlClasses::MOUNT,
        }
    }
}

/// Readiness interface of a service owning blocking-capable descriptors.
pub trait EventSource: Send + Sync {
    /// Non-blocking readiness check. Returns the subset of `interest` that
    /// is ready now.
    fn poll(&self, sfd: i64, interest: Interest) -> Interest;

    /// Registers a one-shot wakeup to be fired once `interest` is ready.
    fn subscribe(&self, sfd: i64, interest: Interest, waker: Waker);

    /// Drops a subscription that is no longer wanted.
    fn unsubscribe(&self, sfd: i64, id: WakeupId);
}

/// Sizes of the argument an ioctl request reads from and writes back to the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoctlShape {
    pub input_len: usize,
    pub output_len: usize,
}

/// `socketcall(2)` call numbers. Socket handlers are indexed by these.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumCount, EnumIter, IntoStaticStr,
)]
#[repr(usize)]
#[strum(serialize_all = "snake_case")]
pub enum SocketCall {
    Socket = 1,
    Bind,
    Connect,
    Listen,
    Accept,
    Getsockname,
    Getpeername,
    Socketpair,
    Send,
    Recv,
    Sendto,
    Recvfrom,
    Shutdown,
    Setsockopt,
    Getsockopt,
    Sendmsg,
    Recvmsg,
    Accept4,
    Recvmmsg,
    Sendmmsg,
}

impl SocketCall {
    pub fn index(&self) -> usize {
        *self as usize - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_call_numbers() {
        assert_eq!(SocketCall::from_repr(1), Some(SocketCall::Socket));
        assert_eq!(SocketCall::from_repr(18), Some(SocketCall::Accept4));
        assert_eq!(SocketCall::Sendmmsg.index(), SocketCall::COUNT - 1);
        assert_eq!(SocketCall::from_repr(0), None);
    }

    #[test]
    fn test_own_follows_visibility() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let before = epochs.now_at(root);
        let registered = epochs.stamp(root);

        let ctx = ChoiceContext::new(&epochs, before, registered);
        assert_eq!(ctx.own(), Claim::Decline);

        let ctx = ChoiceContext::new(&epochs, epochs.now_at(root), registered);
        assert_eq!(ctx.own(), Claim::Own(registered.epoch));
    }
}
