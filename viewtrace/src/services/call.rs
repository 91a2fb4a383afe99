use std::{
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use nix::unistd::Pid;
use syscalls::{SyscallArgs, Sysno};

use crate::{
    epoch::{Epoch, EpochTracker, Timestamp},
    tracer::memory::CallerMemory,
    types::{file_stat::FileStat, pcb_id::PcbId},
};

/// Data a handler hands back to be copied into the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Reply {
    #[default]
    None,
    Bytes(Vec<u8>),
    Stat(FileStat),
    Path(PathBuf),

    /// Received data along with the address it came from.
    Datagram { data: Vec<u8>, addr: Vec<u8> },
}

/// One handler invocation on behalf of a traced process.
///
/// Arguments are those of the canonical call (`open(path, flags, mode)` for
/// the whole open family, and so on), already unmarshalled: `path` and
/// `stat` hold the resolved target, `sfd` the service-side descriptor of a
/// descriptor call, `input` any caller buffer the call consumes, `sockaddr`
/// the socket address argument of `bind`, `connect`, `sendto` and `sendmsg`
/// and `strings` any other string argument (`mount` source, type and data).
pub struct ServiceCall<'c> {
    pub id: PcbId,
    pub pid: Pid,
    pub sysno: Sysno,
    pub args: SyscallArgs,
    pub path: Option<PathBuf>,
    pub path2: Option<PathBuf>,
    pub stat: Option<FileStat>,
    pub sfd: Option<i64>,
    pub input: Vec<u8>,
    pub sockaddr: Vec<u8>,
    pub strings: Vec<String>,
    pub reply: Reply,
    memory: &'c mut dyn CallerMemory,
    epochs: &'c mut EpochTracker,
    at: Timestamp,
}

impl<'c> ServiceCall<'c> {
    pub fn new(
        id: PcbId,
        pid: Pid,
        sysno: Sysno,
        args: SyscallArgs,
        memory: &'c mut dyn CallerMemory,
        epochs: &'c mut EpochTracker,
        at: Timestamp,
    ) -> Self {
        Self {
            id,
            pid,
            sysno,
            args,
            path: None,
            path2: None,
            stat: None,
            sfd: None,
            input: Vec::new(),
            sockaddr: Vec::new(),
            strings: Vec::new(),
            reply: Reply::None,
            memory,
            epochs,
            at,
        }
    }

    pub fn memory(&mut self) -> &mut (dyn CallerMemory + 'c) {
        &mut *self.memory
    }

    /// Timestamp the call is looked up at.
    pub fn at(&self) -> Timestamp {
        self.at
    }

    /// Stamps a new registration (a mount, say) in the caller's treepoch.
    pub fn stamp(&mut self) -> Timestamp {
        self.epochs.stamp(self.at.treepoch)
    }

    /// Epoch of `stamp` if visible to this call, [`Epoch::NONE`] otherwise.
    pub fn matching_epoch(&self, stamp: Timestamp) -> Epoch {
        self.epochs.matching_epoch(stamp, self.at)
    }

    pub fn path_bytes(&self) -> &[u8] {
        self.path
            .as_deref()
            .map(|p| p.as_os_str().as_bytes())
            .unwrap_or_default()
    }

    pub fn reply_bytes(&mut self, bytes: impl Into<Vec<u8>>) {
        self.reply = Reply::Bytes(bytes.into());
    }

    #[cfg(test)]
    pub fn for_test(memory: &'c mut dyn CallerMemory, epochs: &'c mut EpochTracker) -> Self {
        let at = epochs.now_at(epochs.root());
        Self::new(
            PcbId::new(0, 0),
            Pid::from_raw(1),
            Sysno::getpid,
            SyscallArgs::new(0, 0, 0, 0, 0, 0),
            memory,
            epochs,
            at,
        )
    }
}

/// A directory entry as returned by a service's `getdents64` handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: u8,
    pub name: OsString,
}

impl DirEntry {
    pub fn new(ino: u64, kind: u8, name: impl AsRef<OsStr>) -> Self {
        Self {
            ino,
            kind,
            name: name.as_ref().to_owned(),
        }
    }

    fn record_len(&self) -> usize {
        // ino + off + reclen + type + name + NUL, 8-byte aligned
        (19 + self.name.len() + 1 + 7) & !7
    }
}

/// Packs entries into `linux_dirent64` records, starting at offset `first`,
/// into at most `max` bytes. Returns the buffer and the number of entries
/// packed.
pub fn encode_dirents64(entries: &[DirEntry], first: u64, max: usize) -> (Vec<u8>, usize) {
    let mut buf = Vec::new();
    let mut packed = 0;

    for (i, e) in entries.iter().enumerate() {
        let reclen = e.record_len();
        if buf.len() + reclen > max {
            break;
        }

        let off = first + i as u64 + 1;
        buf.extend_from_slice(&e.ino.to_ne_bytes());
        buf.extend_from_slice(&off.to_ne_bytes());
        buf.extend_from_slice(&(reclen as u16).to_ne_bytes());
        buf.push(e.kind);
        buf.extend_from_slice(e.name.as_bytes());
        buf.resize(buf.len() + (reclen - 19 - e.name.len()), 0);

        packed += 1;
    }

    (buf, packed)
}

/// Path of `path` relative to `base`, as seen from inside a mount.
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    match path.strip_prefix(base) {
        Ok(rel) => Path::new("/").join(rel),
        Err(_) => path.to_path_buf(),
    }
}
