//! Entry-stop argument resolution and service selection.

use std::path::{Path, PathBuf};

use log::trace;
use nix::{
    errno::Errno,
    fcntl::{AtFlags, OFlag},
    libc,
    unistd::Pid,
};
use syscalls::{SyscallArgs, Sysno};

use crate::{
    canonicalize::{canonicalize, HostLookup, Lookup},
    epoch::{EpochTracker, Timestamp},
    error::Result,
    pcb::{fd_table::FdEntry, Parked, PathSlot},
    scheduler::{Interest, Readiness},
    services::{Choice, ChoiceQuery, Reply, ServiceCall, ServiceRegistry},
    tracer::memory::{CallerMemoryExt, NoMemory},
    types::{
        behavior::{Behavior, Phase},
        file_stat::FileStat,
        pcb_id::PcbId,
    },
};

use super::{
    sctab::{ChoiceKind, FlagArg, PathArg, ScFlags},
    wrap::{caller_errno, WrapContext},
};

/// Resolves path components through the service claiming them, the host
/// otherwise. Services that do not implement `lstat`/`readlink` leave the
/// lookup to the host.
pub struct RoutedLookup<'a> {
    pub registry: &'a ServiceRegistry,
    pub epochs: &'a mut EpochTracker,
    pub at: Timestamp,
    pub id: PcbId,
    pub host: HostLookup,
}

impl RoutedLookup<'_> {
    fn routed(&mut self, path: &Path, sysno: Sysno) -> Option<(std::result::Result<i64, Errno>, Reply)> {
        let code = self
            .registry
            .select(&ChoiceQuery::Path(path), self.at, self.epochs)
            .service()?;
        let handler = self.registry.syscall_handler(code, sysno)?;

        let mut memory = NoMemory;
        let mut call = ServiceCall::new(
            self.id,
            self.host.pid,
            sysno,
            SyscallArgs::new(0, 0, 0, 0, 0, 0),
            &mut memory,
            self.epochs,
            self.at,
        );
        call.path = Some(path.to_path_buf());

        match handler(&mut call) {
            Err(Errno::ENOSYS) => None,
            result => Some((result, std::mem::take(&mut call.reply))),
        }
    }
}

impl Lookup for RoutedLookup<'_> {
    fn lstat(&mut self, path: &Path) -> std::result::Result<FileStat, Errno> {
        match self.routed(path, Sysno::lstat) {
            Some((Ok(_), Reply::Stat(st))) => Ok(st),
            Some((Ok(_), _)) => Err(Errno::EIO),
            Some((Err(e), _)) => Err(e),
            None => self.host.lstat(path),
        }
    }

    fn readlink(&mut self, path: &Path) -> std::result::Result<PathBuf, Errno> {
        match self.routed(path, Sysno::readlink) {
            Some((Ok(_), Reply::Path(target))) => Ok(target),
            Some((Ok(_), _)) => Err(Errno::EINVAL),
            Some((Err(e), _)) => Err(e),
            None => self.host.readlink(path),
        }
    }
}

/// Whether the kernel-side descriptor `fd` of `pid` has `O_NONBLOCK` set.
fn is_nonblocking(pid: Pid, fd: i32) -> bool {
    let Ok(info) = std::fs::read_to_string(format!("/proc/{pid}/fdinfo/{fd}")) else {
        return false;
    };

    info.lines()
        .find_map(|l| l.strip_prefix("flags:"))
        .and_then(|f| i32::from_str_radix(f.trim(), 8).ok())
        .is_some_and(|f| f & libc::O_NONBLOCK != 0)
}

impl WrapContext<'_> {
    fn read_raw_path(&mut self, arg: usize) -> Result<std::result::Result<PathBuf, Errno>> {
        let addr = self.arg(arg);
        match self.memory().read_path(addr) {
            Ok(p) => Ok(Ok(p)),
            Err(e) => Ok(Err(caller_errno(e)?)),
        }
    }

    fn read_string(&mut self, arg: usize) -> Result<String> {
        let addr = self.arg(arg);
        if addr == 0 {
            return Ok(String::new());
        }

        match self.memory().read_cstring(addr, libc::PATH_MAX as _) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => Err(caller_errno(e)?.into()),
        }
    }

    /// Directory a relative path given with `dirfd` is resolved against.
    fn dirfd_path(&self, dirfd: i32) -> std::result::Result<PathBuf, Errno> {
        if dirfd == libc::AT_FDCWD {
            return Ok(self.pcb.fs.read().cwd.clone());
        }

        match self.pcb.fd_entry(dirfd) {
            Some(FdEntry::Virtual { file, .. }) => Ok(file.path.clone()),
            Some(FdEntry::Reserved) => Err(Errno::EBADF),
            None => std::fs::read_link(format!("/proc/{}/fd/{dirfd}", self.pcb.pid))
                .map_err(|_| Errno::EBADF),
        }
    }

    fn follow_flags(&self, follow: bool, flags: FlagArg) -> (bool, bool) {
        match flags {
            FlagArg::None => (follow, false),
            FlagArg::Open(i) => {
                let flags = OFlag::from_bits_truncate(self.arg(i) as _);
                let nofollow = flags.contains(OFlag::O_NOFOLLOW)
                    || flags.contains(OFlag::O_CREAT | OFlag::O_EXCL);
                (follow && !nofollow, false)
            }
            FlagArg::At(i) => {
                let flags = AtFlags::from_bits_truncate(self.arg(i) as _);
                let follow = if flags.contains(AtFlags::AT_SYMLINK_NOFOLLOW) {
                    false
                } else {
                    follow || flags.contains(AtFlags::AT_SYMLINK_FOLLOW)
                };
                (follow, flags.contains(AtFlags::AT_EMPTY_PATH))
            }
        }
    }

    fn resolve(
        &mut self,
        at: PathArg,
        raw: &Path,
        follow: bool,
    ) -> (PathSlot, Option<FileStat>) {
        let fs = self.pcb.fs.read().clone();

        let base = match at.dirfd {
            Some(d) if !raw.is_absolute() => match self.dirfd_path(self.arg(d) as i32) {
                Ok(p) => p,
                Err(e) => return (PathSlot::Error(e), None),
            },
            _ => fs.cwd,
        };

        let mut lookup = RoutedLookup {
            registry: self.registry,
            epochs: &mut *self.epochs,
            at: self.pcb.lookup_timestamp(),
            id: self.id,
            host: HostLookup::new(self.pcb.pid),
        };

        match canonicalize(raw, &base, &fs.root, follow, &mut lookup) {
            Ok(r) => (PathSlot::Resolved(r.path), r.stat),
            Err(e) => (PathSlot::Error(e), None),
        }
    }

    /// Reads and resolves the arguments the service choice depends on into
    /// the in-flight syscall state.
    pub(crate) fn resolve_arguments(&mut self) -> Result<()> {
        match self.entry.choice {
            ChoiceKind::Path {
                path,
                follow,
                flags,
                second,
            } => {
                let raw = match self.read_raw_path(path.arg)? {
                    Ok(raw) => raw,
                    Err(e) => {
                        self.pcb.syscall.path = PathSlot::Error(e);
                        return Ok(());
                    }
                };

                let (follow, empty_path) = self.follow_flags(follow, flags);
                if empty_path && raw.as_os_str().is_empty() {
                    if let Some(d) = path.dirfd {
                        self.pcb.syscall.fd = Some(self.arg(d) as i32);
                        return Ok(());
                    }
                }

                let (slot, stat) = self.resolve(path, &raw, follow);
                trace!("{} {raw:?} -> {slot:?}", self.pcb);
                self.pcb.syscall.path = slot;
                self.pcb.syscall.stat = stat;

                if let Some(second) = second {
                    if self.pcb.syscall.path.error().is_some() {
                        return Ok(());
                    }
                    let slot = match self.read_raw_path(second.arg)? {
                        Ok(raw) => self.resolve(second, &raw, false).0,
                        Err(e) => PathSlot::Error(e),
                    };
                    match slot.error() {
                        Some(e) => self.pcb.syscall.path = PathSlot::Error(e),
                        None => self.pcb.syscall.path2 = slot,
                    }
                }
            }
            ChoiceKind::Fd { arg } => {
                self.pcb.syscall.fd = Some(self.arg(arg) as i32);
            }
            ChoiceKind::Mount => {
                let strings = [0, 2, 4]
                    .into_iter()
                    .map(|i| self.read_string(i))
                    .collect::<Result<Vec<_>>>();

                let strings = match strings {
                    Ok(s) => s,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        self.pcb.syscall.path = PathSlot::Error(e.errno());
                        return Ok(());
                    }
                };
                self.pcb.syscall.strings = strings;

                let (slot, stat) = match self.read_raw_path(1)? {
                    Ok(raw) => self.resolve(PathArg::plain(1), &raw, true),
                    Err(e) => (PathSlot::Error(e), None),
                };
                self.pcb.syscall.path = slot;
                self.pcb.syscall.stat = stat;
            }
            ChoiceKind::None | ChoiceKind::Socket { .. } | ChoiceKind::Syscall => (),
        }

        Ok(())
    }

    fn choose_fd(&self, fd: i32) -> Choice {
        match self.pcb.fd_entry(fd) {
            Some(FdEntry::Virtual { file, .. }) => match self.registry.stamp(file.service) {
                Some(stamp) => Choice::Service {
                    code: file.service,
                    epoch: stamp.epoch,
                },
                // the owning service is gone
                None => Choice::Reserved,
            },
            Some(FdEntry::Reserved) => Choice::Reserved,
            None => Choice::None,
        }
    }

    /// Selects the service of the in-flight syscall as of its lookup
    /// timestamp.
    pub(crate) fn choose(&self) -> Choice {
        let at = self.pcb.lookup_timestamp();
        let syscall = &self.pcb.syscall;

        if let Some(fd) = syscall.fd {
            return self.choose_fd(fd);
        }

        let select = |query: ChoiceQuery| self.registry.select(&query, at, self.epochs);

        match self.entry.choice {
            ChoiceKind::Path { .. } => match syscall.path.path() {
                Some(path) => select(ChoiceQuery::Path(path)),
                None => Choice::None,
            },
            ChoiceKind::Socket { domain } => select(ChoiceQuery::Socket {
                domain: self.arg(domain) as i32,
            }),
            ChoiceKind::Mount => match syscall.strings.get(1) {
                Some(fstype) if !fstype.is_empty() => select(ChoiceQuery::FsType(fstype)),
                _ => Choice::None,
            },
            ChoiceKind::Syscall => select(ChoiceQuery::Syscall(syscall.sysno)),
            ChoiceKind::Fd { .. } | ChoiceKind::None => Choice::None,
        }
    }

    /// Blocking check of the chosen service's descriptor. Parks the process
    /// and returns the suspended behavior when it is not ready.
    pub(crate) fn check_ready(&mut self, phase: Phase) -> Result<Option<Behavior>> {
        let mut interest = Interest::empty();
        interest.set(Interest::READ, self.entry.flags.contains(ScFlags::CB_R));
        interest.set(Interest::WRITE, self.entry.flags.contains(ScFlags::CB_W));
        interest.set(Interest::EXCEPT, self.entry.flags.contains(ScFlags::CB_X));

        if interest.is_empty() {
            return Ok(None);
        }

        let (Some(code), Some(file), Some(fd)) = (self.service(), self.virtual_file(), self.fd())
        else {
            return Ok(None);
        };
        let Some(source) = self.registry.event_source(code) else {
            return Ok(None);
        };

        if is_nonblocking(self.pcb.pid, fd) {
            return Ok(None);
        }

        match self
            .scheduler
            .check_suspend_on(self.id, code, &*source, file.sfd, interest)
        {
            Readiness::Ready => Ok(None),
            Readiness::Parked(wakeup) => {
                self.pcb.parked = Some(Parked {
                    phase,
                    wakeup,
                    service: code,
                    sfd: file.sfd,
                });
                Ok(Some(Behavior::Suspended(phase)))
            }
        }
    }
}
