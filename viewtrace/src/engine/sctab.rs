//! The dispatch table: which syscalls are intercepted, how their target
//! service is chosen and which wrappers marshal them.

use std::collections::HashMap;

use bitflags::bitflags;
use strum::IntoStaticStr;
use syscalls::Sysno;

use crate::{
    error::Result,
    services::{HandlerIndex, SocketCall},
    types::behavior::Behavior,
};

use super::wrap::{self, WrapContext};

pub type WrapFn = fn(&mut WrapContext) -> Result<Behavior>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScFlags: u32 {
        /// Wrappers run even when no service claims the call.
        const ALWAYS = 1;

        /// The call may block until its descriptor is readable.
        const CB_R = 2;
        const CB_W = 4;
        const CB_X = 8;
    }
}

impl ScFlags {
    pub const BLOCKING: ScFlags = ScFlags::CB_R.union(ScFlags::CB_W).union(ScFlags::CB_X);
}

/// How the flags argument of a path call modifies resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagArg {
    None,

    /// `open` flags: `O_NOFOLLOW`.
    Open(usize),

    /// `*at` flags: `AT_SYMLINK_NOFOLLOW`, `AT_SYMLINK_FOLLOW`, `AT_EMPTY_PATH`.
    At(usize),
}

/// Where a path argument lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathArg {
    pub dirfd: Option<usize>,
    pub arg: usize,
}

impl PathArg {
    pub const fn plain(arg: usize) -> Self {
        Self { dirfd: None, arg }
    }

    pub const fn at(dirfd: usize, arg: usize) -> Self {
        Self {
            dirfd: Some(dirfd),
            arg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceKind {
    None,
    Path {
        path: PathArg,
        follow: bool,
        flags: FlagArg,

        /// Second path of `rename`/`link`, resolved without following.
        second: Option<PathArg>,
    },
    Fd {
        arg: usize,
    },
    Socket {
        domain: usize,
    },

    /// `mount(source, target, fstype, flags, data)`.
    Mount,
    Syscall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRef {
    None,
    Syscall(Sysno),
    Socket(SocketCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ScClass {
    File,
    Fd,
    Net,
    Proc,
    Other,
}

#[derive(Clone, Copy)]
pub struct ScEntry {
    pub sysno: Sysno,
    pub handler: HandlerRef,
    pub choice: ChoiceKind,
    pub flags: ScFlags,
    pub nargs: u8,
    pub class: ScClass,
    pub wrap_in: WrapFn,
    pub wrap_out: WrapFn,
}

impl std::fmt::Debug for ScEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScEntry")
            .field("sysno", &self.sysno)
            .field("handler", &self.handler)
            .field("choice", &self.choice)
            .field("flags", &self.flags)
            .finish()
    }
}

impl ScEntry {
    pub fn new(sysno: Sysno, nargs: u8, class: ScClass, choice: ChoiceKind) -> Self {
        Self {
            sysno,
            handler: HandlerRef::Syscall(sysno),
            choice,
            flags: ScFlags::empty(),
            nargs,
            class,
            wrap_in: wrap::std_in,
            wrap_out: wrap::std_out,
        }
    }

    pub fn handler(mut self, handler: Sysno) -> Self {
        self.handler = HandlerRef::Syscall(handler);
        self
    }

    pub fn no_handler(mut self) -> Self {
        self.handler = HandlerRef::None;
        self
    }

    pub fn socket(mut self, call: SocketCall) -> Self {
        self.handler = HandlerRef::Socket(call);
        self
    }

    pub fn flags(mut self, flags: ScFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn wrap(mut self, wrap_in: WrapFn, wrap_out: WrapFn) -> Self {
        self.wrap_in = wrap_in;
        self.wrap_out = wrap_out;
        self
    }

    /// The handler sysno, for entries dispatched through the syscall table.
    pub fn handler_sysno(&self) -> Option<Sysno> {
        match self.handler {
            HandlerRef::Syscall(s) => Some(s),
            _ => None,
        }
    }
}

pub struct SyscallTable {
    entries: HashMap<usize, ScEntry>,
}

impl SyscallTable {
    pub fn new(entries: impl IntoIterator<Item = ScEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.sysno.id() as usize, e))
                .collect(),
        }
    }

    pub fn get(&self, sysno: usize) -> Option<&ScEntry> {
        self.entries.get(&sysno)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dense indices of every canonical handler the table dispatches to.
    /// Handlers that are reached indirectly (`rmdir` through `unlinkat`,
    /// `fstat` for `AT_EMPTY_PATH` lookups) are included.
    pub fn handler_index(&self) -> HandlerIndex {
        let mut handlers: Vec<Sysno> = self
            .entries
            .values()
            .filter_map(|e| e.handler_sysno())
            .collect();
        handlers.extend(INDIRECT_HANDLERS);
        handlers.sort_by_key(|s| s.id());

        HandlerIndex::new(handlers)
    }

    /// x86-64 Linux.
    pub fn linux_default() -> Self {
        Self::new(default_entries())
    }
}

const INDIRECT_HANDLERS: [Sysno; 6] = [
    Sysno::fstat,
    Sysno::rmdir,
    Sysno::close,
    Sysno::fcntl,
    Sysno::execve,
    Sysno::read,
];

fn path(arg: usize, follow: bool) -> ChoiceKind {
    ChoiceKind::Path {
        path: PathArg::plain(arg),
        follow,
        flags: FlagArg::None,
        second: None,
    }
}

fn path_at(dirfd: usize, arg: usize, follow: bool, flags: FlagArg) -> ChoiceKind {
    ChoiceKind::Path {
        path: PathArg::at(dirfd, arg),
        follow,
        flags,
        second: None,
    }
}

fn two_paths(first: PathArg, second: PathArg, flags: FlagArg) -> ChoiceKind {
    ChoiceKind::Path {
        path: first,
        follow: false,
        flags,
        second: Some(second),
    }
}

fn fd(arg: usize) -> ChoiceKind {
    ChoiceKind::Fd { arg }
}

fn default_entries() -> Vec<ScEntry> {
    use ScClass::*;
    use Sysno as S;

    vec![
        // open family
        ScEntry::new(
            S::open,
            3,
            File,
            ChoiceKind::Path {
                path: PathArg::plain(0),
                follow: true,
                flags: FlagArg::Open(1),
                second: None,
            },
        )
        .wrap(wrap::fd::open_in, wrap::fd::open_out),
        ScEntry::new(S::openat, 4, File, path_at(0, 1, true, FlagArg::Open(2)))
            .handler(S::open)
            .wrap(wrap::fd::open_in, wrap::fd::open_out),
        ScEntry::new(S::creat, 2, File, path(0, true))
            .handler(S::open)
            .wrap(wrap::fd::open_in, wrap::fd::open_out),
        // metadata
        ScEntry::new(S::stat, 2, File, path(0, true))
            .handler(S::lstat)
            .wrap(wrap::stat_in, wrap::std_out),
        ScEntry::new(S::lstat, 2, File, path(0, false)).wrap(wrap::stat_in, wrap::std_out),
        ScEntry::new(S::newfstatat, 4, File, path_at(0, 1, true, FlagArg::At(3)))
            .handler(S::lstat)
            .wrap(wrap::stat_in, wrap::std_out),
        ScEntry::new(S::statx, 5, File, path_at(0, 1, true, FlagArg::At(2)))
            .handler(S::lstat)
            .wrap(wrap::stat_in, wrap::std_out),
        ScEntry::new(S::fstat, 2, Fd, fd(0)).wrap(wrap::stat_in, wrap::std_out),
        ScEntry::new(S::readlink, 3, File, path(0, false))
            .wrap(wrap::readlink_in, wrap::std_out),
        ScEntry::new(S::readlinkat, 4, File, path_at(0, 1, false, FlagArg::None))
            .handler(S::readlink)
            .wrap(wrap::readlink_in, wrap::std_out),
        ScEntry::new(S::access, 2, File, path(0, true)),
        ScEntry::new(S::faccessat, 3, File, path_at(0, 1, true, FlagArg::None))
            .handler(S::access),
        ScEntry::new(S::faccessat2, 4, File, path_at(0, 1, true, FlagArg::At(3)))
            .handler(S::access),
        ScEntry::new(S::statfs, 2, File, path(0, true)).wrap(wrap::statfs_in, wrap::std_out),
        ScEntry::new(S::fstatfs, 2, Fd, fd(0)).wrap(wrap::statfs_in, wrap::std_out),
        // namespace changes
        ScEntry::new(S::mkdir, 2, File, path(0, false)),
        ScEntry::new(S::mkdirat, 3, File, path_at(0, 1, false, FlagArg::None))
            .handler(S::mkdir),
        ScEntry::new(S::rmdir, 1, File, path(0, false)),
        ScEntry::new(S::unlink, 1, File, path(0, false)),
        ScEntry::new(S::unlinkat, 3, File, path_at(0, 1, false, FlagArg::None))
            .handler(S::unlink)
            .wrap(wrap::unlinkat_in, wrap::std_out),
        ScEntry::new(
            S::rename,
            2,
            File,
            two_paths(PathArg::plain(0), PathArg::plain(1), FlagArg::None),
        )
        .wrap(wrap::two_paths_in, wrap::std_out),
        ScEntry::new(
            S::renameat,
            4,
            File,
            two_paths(PathArg::at(0, 1), PathArg::at(2, 3), FlagArg::None),
        )
        .handler(S::rename)
        .wrap(wrap::two_paths_in, wrap::std_out),
        ScEntry::new(
            S::renameat2,
            5,
            File,
            two_paths(PathArg::at(0, 1), PathArg::at(2, 3), FlagArg::None),
        )
        .handler(S::rename)
        .wrap(wrap::two_paths_in, wrap::std_out),
        ScEntry::new(
            S::link,
            2,
            File,
            two_paths(PathArg::plain(0), PathArg::plain(1), FlagArg::None),
        )
        .wrap(wrap::two_paths_in, wrap::std_out),
        ScEntry::new(
            S::linkat,
            5,
            File,
            two_paths(PathArg::at(0, 1), PathArg::at(2, 3), FlagArg::At(4)),
        )
        .handler(S::link)
        .wrap(wrap::two_paths_in, wrap::std_out),
        ScEntry::new(S::symlink, 2, File, path(1, false)).wrap(wrap::symlink_in, wrap::std_out),
        ScEntry::new(S::symlinkat, 3, File, path_at(1, 2, false, FlagArg::None))
            .handler(S::symlink)
            .wrap(wrap::symlink_in, wrap::std_out),
        ScEntry::new(S::chmod, 2, File, path(0, true)),
        ScEntry::new(S::fchmodat, 3, File, path_at(0, 1, true, FlagArg::None)).handler(S::chmod),
        ScEntry::new(S::fchmod, 2, Fd, fd(0)),
        ScEntry::new(S::chown, 3, File, path(0, true)),
        ScEntry::new(S::lchown, 3, File, path(0, false)).handler(S::chown),
        ScEntry::new(S::fchownat, 5, File, path_at(0, 1, true, FlagArg::At(4))).handler(S::chown),
        ScEntry::new(S::fchown, 3, Fd, fd(0)),
        ScEntry::new(S::truncate, 2, File, path(0, true)),
        ScEntry::new(S::ftruncate, 2, Fd, fd(0)),
        // descriptor I/O
        ScEntry::new(S::read, 3, Fd, fd(0))
            .flags(ScFlags::CB_R)
            .wrap(wrap::read_in, wrap::std_out),
        ScEntry::new(S::pread64, 4, Fd, fd(0))
            .flags(ScFlags::CB_R)
            .wrap(wrap::read_in, wrap::std_out),
        ScEntry::new(S::getdents64, 3, Fd, fd(0)).wrap(wrap::read_in, wrap::std_out),
        ScEntry::new(S::write, 3, Fd, fd(0))
            .flags(ScFlags::CB_W)
            .wrap(wrap::write_in, wrap::std_out),
        ScEntry::new(S::pwrite64, 4, Fd, fd(0))
            .flags(ScFlags::CB_W)
            .wrap(wrap::write_in, wrap::std_out),
        ScEntry::new(S::lseek, 3, Fd, fd(0)),
        ScEntry::new(S::fsync, 1, Fd, fd(0)),
        ScEntry::new(S::fdatasync, 1, Fd, fd(0)).handler(S::fsync),
        ScEntry::new(S::ioctl, 3, Fd, fd(0)).wrap(wrap::fd::ioctl_in, wrap::std_out),
        ScEntry::new(S::fcntl, 3, Fd, fd(0))
            .wrap(wrap::fd::fcntl_in, wrap::fd::dup_out),
        ScEntry::new(S::close, 1, Fd, fd(0))
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::fd::close_in, wrap::fd::close_out),
        ScEntry::new(S::dup, 1, Fd, fd(0))
            .no_handler()
            .wrap(wrap::fd::dup_in, wrap::fd::dup_out),
        ScEntry::new(S::dup2, 2, Fd, fd(0))
            .no_handler()
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::fd::dup_in, wrap::fd::dup_out),
        ScEntry::new(S::dup3, 3, Fd, fd(0))
            .no_handler()
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::fd::dup_in, wrap::fd::dup_out),
        // process filesystem state
        ScEntry::new(S::chdir, 1, Proc, path(0, true))
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::fs::chdir_in, wrap::fs::commit_out),
        ScEntry::new(S::fchdir, 1, Proc, fd(0))
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::fs::fchdir_in, wrap::fs::commit_out),
        ScEntry::new(S::getcwd, 2, Proc, ChoiceKind::None)
            .no_handler()
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::fs::getcwd_in, wrap::std_out),
        ScEntry::new(S::umask, 1, Proc, ChoiceKind::None)
            .no_handler()
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::fs::umask_in, wrap::std_out),
        ScEntry::new(S::chroot, 1, Proc, path(0, true))
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::fs::chroot_in, wrap::fs::commit_out),
        ScEntry::new(S::mount, 5, File, ChoiceKind::Mount).wrap(wrap::fs::mount_in, wrap::std_out),
        ScEntry::new(S::umount2, 2, File, path(0, true)),
        ScEntry::new(S::execve, 3, Proc, path(0, true))
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::exec::execve_in, wrap::exec::execve_out),
        ScEntry::new(S::execveat, 5, Proc, path_at(0, 1, true, FlagArg::At(4)))
            .handler(S::execve)
            .flags(ScFlags::ALWAYS)
            .wrap(wrap::exec::execve_in, wrap::exec::execve_out),
        // sockets
        ScEntry::new(S::socket, 3, Net, ChoiceKind::Socket { domain: 0 })
            .socket(SocketCall::Socket)
            .wrap(wrap::net::socket_in, wrap::fd::open_out),
        ScEntry::new(S::bind, 3, Net, fd(0))
            .socket(SocketCall::Bind)
            .wrap(wrap::net::sockaddr_in, wrap::std_out),
        ScEntry::new(S::connect, 3, Net, fd(0))
            .socket(SocketCall::Connect)
            .wrap(wrap::net::sockaddr_in, wrap::std_out),
        ScEntry::new(S::listen, 2, Net, fd(0))
            .socket(SocketCall::Listen)
            .wrap(wrap::net::plain_in, wrap::std_out),
        ScEntry::new(S::shutdown, 2, Net, fd(0))
            .socket(SocketCall::Shutdown)
            .wrap(wrap::net::plain_in, wrap::std_out),
        ScEntry::new(S::accept, 3, Net, fd(0))
            .socket(SocketCall::Accept)
            .flags(ScFlags::CB_R)
            .wrap(wrap::net::accept_in, wrap::fd::open_out),
        ScEntry::new(S::accept4, 4, Net, fd(0))
            .socket(SocketCall::Accept4)
            .flags(ScFlags::CB_R)
            .wrap(wrap::net::accept_in, wrap::fd::open_out),
        ScEntry::new(S::getsockname, 3, Net, fd(0))
            .socket(SocketCall::Getsockname)
            .wrap(wrap::net::sockaddr_out_in, wrap::std_out),
        ScEntry::new(S::getpeername, 3, Net, fd(0))
            .socket(SocketCall::Getpeername)
            .wrap(wrap::net::sockaddr_out_in, wrap::std_out),
        ScEntry::new(S::setsockopt, 5, Net, fd(0))
            .socket(SocketCall::Setsockopt)
            .wrap(wrap::net::setsockopt_in, wrap::std_out),
        ScEntry::new(S::getsockopt, 5, Net, fd(0))
            .socket(SocketCall::Getsockopt)
            .wrap(wrap::net::getsockopt_in, wrap::std_out),
        ScEntry::new(S::sendto, 6, Net, fd(0))
            .socket(SocketCall::Sendto)
            .flags(ScFlags::CB_W)
            .wrap(wrap::net::sendto_in, wrap::std_out),
        ScEntry::new(S::recvfrom, 6, Net, fd(0))
            .socket(SocketCall::Recvfrom)
            .flags(ScFlags::CB_R)
            .wrap(wrap::net::recvfrom_in, wrap::std_out),
        ScEntry::new(S::sendmsg, 3, Net, fd(0))
            .socket(SocketCall::Sendmsg)
            .flags(ScFlags::CB_W)
            .wrap(wrap::net::sendmsg_in, wrap::std_out),
        ScEntry::new(S::recvmsg, 3, Net, fd(0))
            .socket(SocketCall::Recvmsg)
            .flags(ScFlags::CB_R)
            .wrap(wrap::net::recvmsg_in, wrap::std_out),
    ]
}
