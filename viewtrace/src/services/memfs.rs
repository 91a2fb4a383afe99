//! `memfs`: an in-memory filesystem service.
//!
//! The tree is shown at the directories given at construction, visible from
//! the moment the service is registered, and at every later `mount` of type
//! [`FSTYPE`], visible from the moment of the mount on.

use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;
use nix::{errno::Errno, fcntl::OFlag, libc};
use parking_lot::Mutex;
use syscalls::Sysno;

use crate::{
    error::{Result, SysResult},
    types::file_stat::FileStat,
};

use super::{
    call::{encode_dirents64, relative_to, DirEntry},
    ChoiceContext, ChoiceQuery, Claim, Mount, MountTable, Reply, ServiceCall, ServiceDescriptor,
};

pub const FSTYPE: &str = "memfs";

const DEFAULT_FILE_PERM: u32 = 0o644;
const DEFAULT_DIR_PERM: u32 = 0o755;

/// Largest file the service keeps in memory. Writes past it fail with
/// `EFBIG`.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
    Symlink(PathBuf),
}

#[derive(Debug, Clone)]
struct Inode {
    ino: u64,
    perm: u32,
    node: Node,
}

impl Inode {
    fn stat(&self) -> FileStat {
        let st = match &self.node {
            Node::Dir => FileStat::directory(self.perm),
            Node::File(data) => FileStat::regular(data.len() as _, self.perm),
            Node::Symlink(target) => FileStat::symlink(target.as_os_str().len() as _),
        };
        st.with_ino(self.ino)
    }

    fn dirent_type(&self) -> u8 {
        match self.node {
            Node::Dir => libc::DT_DIR,
            Node::File(_) => libc::DT_REG,
            Node::Symlink(_) => libc::DT_LNK,
        }
    }
}

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    offset: u64,
    append: bool,
}

#[derive(Debug)]
struct State {
    /// Keyed by the path inside the filesystem, `/` being its root.
    inodes: BTreeMap<PathBuf, Inode>,
    open: HashMap<i64, OpenFile>,
    mounts: MountTable,
    next_sfd: i64,
    next_ino: u64,
}

impl State {
    fn new() -> Self {
        let mut state = Self {
            inodes: BTreeMap::new(),
            open: HashMap::new(),
            mounts: MountTable::new(),
            next_sfd: 3,
            next_ino: 1,
        };
        state.insert(PathBuf::from("/"), DEFAULT_DIR_PERM, Node::Dir);
        state
    }

    fn insert(&mut self, path: PathBuf, perm: u32, node: Node) {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(path, Inode { ino, perm, node });
    }

    fn parent_is_dir(&self, path: &Path) -> std::result::Result<(), Errno> {
        let parent = path.parent().unwrap_or(Path::new("/"));
        match self.inodes.get(parent).map(|i| &i.node) {
            Some(Node::Dir) => Ok(()),
            Some(_) => Err(Errno::ENOTDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn children(&self, dir: &Path) -> impl Iterator<Item = (&OsStr, &Inode)> + '_ {
        let dir = dir.to_path_buf();
        self.inodes
            .iter()
            .filter(move |(p, _)| p.parent() == Some(dir.as_path()))
            .filter_map(|(p, i)| Some((p.file_name()?, i)))
    }

    fn open_file(&mut self, sfd: Option<i64>) -> std::result::Result<&mut OpenFile, Errno> {
        sfd.and_then(|sfd| self.open.get_mut(&sfd)).ok_or(Errno::EBADF)
    }
}

pub struct MemFs {
    roots: Vec<PathBuf>,
    state: Mutex<State>,
}

impl MemFs {
    /// A filesystem shown at `roots`.
    pub fn new(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            state: Mutex::new(State::new()),
        }
    }

    /// Adds a regular file, creating missing parent directories. `path` is
    /// relative to the root of the filesystem.
    pub fn with_file(self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Self {
        let path = Path::new("/").join(path);
        {
            let mut state = self.state.lock();
            for dir in path.ancestors().skip(1) {
                if !state.inodes.contains_key(dir) {
                    state.insert(dir.to_path_buf(), DEFAULT_DIR_PERM, Node::Dir);
                }
            }
            state.insert(path, DEFAULT_FILE_PERM, Node::File(contents.into()));
        }
        self
    }

    /// Path inside the filesystem of the host path `path`, as seen by
    /// `call`.
    fn inner(&self, state: &State, call: &ServiceCall, path: &Path) -> Option<PathBuf> {
        if let Some(root) = self
            .roots
            .iter()
            .filter(|r| path.starts_with(r))
            .max_by_key(|r| r.components().count())
        {
            return Some(relative_to(path, root));
        }

        state
            .mounts
            .find(path, |stamp| call.matching_epoch(stamp))
            .map(|(m, _)| relative_to(path, &m.target))
    }

    fn target(&self, state: &State, call: &ServiceCall) -> std::result::Result<PathBuf, Errno> {
        let path = call.path.as_deref().ok_or(Errno::ENOENT)?;
        self.inner(state, call, path).ok_or(Errno::ENOENT)
    }

    fn claim(&self, query: &ChoiceQuery, ctx: &ChoiceContext) -> Claim {
        match query {
            ChoiceQuery::Path(path) if self.roots.iter().any(|r| path.starts_with(r)) => ctx.own(),
            ChoiceQuery::Path(path) => self.state.lock().mounts.claim(path, ctx),
            ChoiceQuery::FsType(fstype) if *fstype == FSTYPE => ctx.own(),
            _ => Claim::Decline,
        }
    }

    fn lstat(&self, call: &mut ServiceCall) -> SysResult {
        let state = self.state.lock();
        let target = self.target(&state, call)?;
        let inode = state.inodes.get(&target).ok_or(Errno::ENOENT)?;

        call.reply = Reply::Stat(inode.stat());
        Ok(0)
    }

    fn fstat(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let path = state.open_file(call.sfd)?.path.clone();
        let inode = state.inodes.get(&path).ok_or(Errno::ESTALE)?;

        call.reply = Reply::Stat(inode.stat());
        Ok(0)
    }

    fn open(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let target = self.target(&state, call)?;
        let flags = OFlag::from_bits_truncate(call.args.arg1 as _);
        let writable = flags.intersects(OFlag::O_WRONLY | OFlag::O_RDWR);

        match state.inodes.get_mut(&target) {
            Some(_) if flags.contains(OFlag::O_CREAT | OFlag::O_EXCL) => return Err(Errno::EEXIST),
            Some(Inode {
                node: Node::Dir, ..
            }) if writable => return Err(Errno::EISDIR),
            Some(Inode {
                node: Node::File(data),
                ..
            }) => {
                if flags.contains(OFlag::O_TRUNC) && writable {
                    data.clear();
                }
            }
            Some(Inode {
                node: Node::Dir, ..
            }) => (),
            Some(Inode {
                node: Node::Symlink(_),
                ..
            }) => return Err(Errno::ELOOP),
            None if flags.contains(OFlag::O_CREAT) => {
                state.parent_is_dir(&target)?;
                let perm = call.args.arg2 as u32 & 0o7777;
                state.insert(target.clone(), perm, Node::File(Vec::new()));
            }
            None => return Err(Errno::ENOENT),
        }

        if flags.contains(OFlag::O_DIRECTORY)
            && !matches!(state.inodes.get(&target).map(|i| &i.node), Some(Node::Dir))
        {
            return Err(Errno::ENOTDIR);
        }

        let sfd = state.next_sfd;
        state.next_sfd += 1;
        state.open.insert(
            sfd,
            OpenFile {
                path: target,
                offset: 0,
                append: flags.contains(OFlag::O_APPEND),
            },
        );

        debug!("memfs: {:?} opened as {sfd}", call.path);

        Ok(sfd)
    }

    fn read_at(&self, call: &mut ServiceCall, offset: Option<u64>) -> SysResult {
        let mut state = self.state.lock();
        let count = call.args.arg2;
        let file = state.open_file(call.sfd)?;
        let (path, pos) = (file.path.clone(), offset.unwrap_or(file.offset));

        let data = match state.inodes.get(&path).map(|i| &i.node) {
            Some(Node::File(data)) => data,
            Some(Node::Dir) => return Err(Errno::EISDIR),
            _ => return Err(Errno::ESTALE),
        };

        let start = usize::try_from(pos).map_or(data.len(), |p| p.min(data.len()));
        let end = start + count.min(data.len() - start);
        let bytes = data[start..end].to_vec();
        let n = bytes.len();

        if offset.is_none() {
            state.open_file(call.sfd)?.offset += n as u64;
        }

        call.reply_bytes(bytes);
        Ok(n as _)
    }

    fn write_at(&self, call: &mut ServiceCall, offset: Option<u64>) -> SysResult {
        let mut state = self.state.lock();
        let file = state.open_file(call.sfd)?;
        let (path, append, cur) = (file.path.clone(), file.append, file.offset);

        let Some(Node::File(data)) = state.inodes.get_mut(&path).map(|i| &mut i.node) else {
            return Err(Errno::EBADF);
        };

        if call.input.is_empty() {
            return Ok(0);
        }

        let pos = match (offset, append) {
            (Some(off), _) => off,
            (None, true) => data.len() as u64,
            (None, false) => cur,
        };
        let end = pos
            .checked_add(call.input.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(Errno::EFBIG)?;
        let (pos, end) = (pos as usize, end as usize);
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos..end].copy_from_slice(&call.input);

        if offset.is_none() {
            state.open_file(call.sfd)?.offset = end as u64;
        }

        Ok(call.input.len() as _)
    }

    fn lseek(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let file = state.open_file(call.sfd)?;
        let path = file.path.clone();
        let cur = file.offset as i64;

        let size = match state.inodes.get(&path).map(|i| &i.node) {
            Some(Node::File(data)) => data.len() as i64,
            _ => 0,
        };

        let offset = call.args.arg1 as i64;
        let new = match call.args.arg2 as i32 {
            libc::SEEK_SET => offset,
            libc::SEEK_CUR => cur + offset,
            libc::SEEK_END => size + offset,
            _ => return Err(Errno::EINVAL),
        };
        if new < 0 {
            return Err(Errno::EINVAL);
        }

        state.open_file(call.sfd)?.offset = new as u64;
        Ok(new)
    }

    fn getdents64(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let max = call.args.arg2;
        let file = state.open_file(call.sfd)?;
        let (dir, pos) = (file.path.clone(), file.offset);

        let this = state.inodes.get(&dir).ok_or(Errno::ESTALE)?;
        if !matches!(this.node, Node::Dir) {
            return Err(Errno::ENOTDIR);
        }

        let mut entries = vec![
            DirEntry::new(this.ino, libc::DT_DIR, "."),
            DirEntry::new(this.ino, libc::DT_DIR, ".."),
        ];
        entries.extend(
            state
                .children(&dir)
                .map(|(name, inode)| DirEntry::new(inode.ino, inode.dirent_type(), name)),
        );

        let rest = entries.get(pos as usize..).unwrap_or_default();
        let (buf, packed) = encode_dirents64(rest, pos, max);
        if packed == 0 && !rest.is_empty() {
            return Err(Errno::EINVAL);
        }

        state.open_file(call.sfd)?.offset += packed as u64;

        let n = buf.len();
        call.reply_bytes(buf);
        Ok(n as _)
    }

    fn close(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let sfd = call.sfd.ok_or(Errno::EBADF)?;
        state.open.remove(&sfd).ok_or(Errno::EBADF)?;
        Ok(0)
    }

    fn access(&self, call: &mut ServiceCall) -> SysResult {
        let state = self.state.lock();
        let target = self.target(&state, call)?;
        state.inodes.get(&target).map(|_| 0).ok_or(Errno::ENOENT)
    }

    fn mkdir(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let target = self.target(&state, call)?;

        if state.inodes.contains_key(&target) {
            return Err(Errno::EEXIST);
        }
        state.parent_is_dir(&target)?;

        let perm = call.args.arg1 as u32 & 0o7777;
        state.insert(target, perm, Node::Dir);
        Ok(0)
    }

    fn unlink(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let target = self.target(&state, call)?;

        match state.inodes.get(&target).map(|i| &i.node) {
            Some(Node::Dir) => Err(Errno::EISDIR),
            Some(_) => {
                state.inodes.remove(&target);
                Ok(0)
            }
            None => Err(Errno::ENOENT),
        }
    }

    fn rmdir(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let target = self.target(&state, call)?;

        match state.inodes.get(&target).map(|i| &i.node) {
            Some(Node::Dir) if target == Path::new("/") => Err(Errno::EBUSY),
            Some(Node::Dir) if state.children(&target).next().is_some() => Err(Errno::ENOTEMPTY),
            Some(Node::Dir) => {
                state.inodes.remove(&target);
                Ok(0)
            }
            Some(_) => Err(Errno::ENOTDIR),
            None => Err(Errno::ENOENT),
        }
    }

    fn symlink(&self, call: &mut ServiceCall) -> SysResult {
        let mut state = self.state.lock();
        let target = self.target(&state, call)?;
        let link_to = call.path2.clone().ok_or(Errno::EINVAL)?;

        if state.inodes.contains_key(&target) {
            return Err(Errno::EEXIST);
        }
        state.parent_is_dir(&target)?;
        state.insert(target, 0o777, Node::Symlink(link_to));
        Ok(0)
    }

    fn readlink(&self, call: &mut ServiceCall) -> SysResult {
        let state = self.state.lock();
        let target = self.target(&state, call)?;

        match state.inodes.get(&target).map(|i| &i.node) {
            Some(Node::Symlink(to)) => {
                let to = to.clone();
                drop(state);
                call.reply = Reply::Path(to);
                Ok(0)
            }
            Some(_) => Err(Errno::EINVAL),
            None => Err(Errno::ENOENT),
        }
    }

    fn mount(&self, call: &mut ServiceCall) -> SysResult {
        let target = call.path.clone().ok_or(Errno::ENOENT)?;
        let stamp = call.stamp();
        let mut strings = call.strings.iter().cloned();

        let mount = Mount {
            source: strings.next().unwrap_or_default(),
            fstype: strings.next().unwrap_or_default(),
            data: strings.next().filter(|d| !d.is_empty()),
            flags: call.args.arg3 as _,
            target,
            stamp,
        };

        debug!("memfs: mounted on {:?} at {stamp}", mount.target);
        self.state.lock().mounts.add(mount);
        Ok(0)
    }

    fn umount(&self, call: &mut ServiceCall) -> SysResult {
        let target = call.path.clone().ok_or(Errno::ENOENT)?;
        let mut state = self.state.lock();

        state
            .mounts
            .remove(&target, |stamp| call.matching_epoch(stamp))
            .map(|_| 0)
            .ok_or(Errno::EINVAL)
    }

    fn read(&self, call: &mut ServiceCall) -> SysResult {
        self.read_at(call, None)
    }

    fn pread(&self, call: &mut ServiceCall) -> SysResult {
        let offset = u64::try_from(call.args.arg3 as i64).map_err(|_| Errno::EINVAL)?;
        self.read_at(call, Some(offset))
    }

    fn write(&self, call: &mut ServiceCall) -> SysResult {
        self.write_at(call, None)
    }

    fn pwrite(&self, call: &mut ServiceCall) -> SysResult {
        let offset = u64::try_from(call.args.arg3 as i64).map_err(|_| Errno::EINVAL)?;
        self.write_at(call, Some(offset))
    }

    /// The service descriptor handing the calls to `fs`.
    pub fn descriptor(fs: Arc<MemFs>) -> Result<ServiceDescriptor> {
        let claim = fs.clone();

        let desc = ServiceDescriptor::builder(FSTYPE)
            .choose(move |query, ctx| claim.claim(query, ctx))
            .syscall(Sysno::lstat, handler(&fs, MemFs::lstat))
            .syscall(Sysno::fstat, handler(&fs, MemFs::fstat))
            .syscall(Sysno::open, handler(&fs, MemFs::open))
            .syscall(Sysno::read, handler(&fs, MemFs::read))
            .syscall(Sysno::pread64, handler(&fs, MemFs::pread))
            .syscall(Sysno::write, handler(&fs, MemFs::write))
            .syscall(Sysno::pwrite64, handler(&fs, MemFs::pwrite))
            .syscall(Sysno::lseek, handler(&fs, MemFs::lseek))
            .syscall(Sysno::getdents64, handler(&fs, MemFs::getdents64))
            .syscall(Sysno::close, handler(&fs, MemFs::close))
            .syscall(Sysno::access, handler(&fs, MemFs::access))
            .syscall(Sysno::mkdir, handler(&fs, MemFs::mkdir))
            .syscall(Sysno::unlink, handler(&fs, MemFs::unlink))
            .syscall(Sysno::rmdir, handler(&fs, MemFs::rmdir))
            .syscall(Sysno::symlink, handler(&fs, MemFs::symlink))
            .syscall(Sysno::readlink, handler(&fs, MemFs::readlink))
            .syscall(Sysno::mount, handler(&fs, MemFs::mount))
            .syscall(Sysno::umount2, handler(&fs, MemFs::umount))
            .build()?;

        Ok(desc)
    }
}

fn handler(
    fs: &Arc<MemFs>,
    f: fn(&MemFs, &mut ServiceCall) -> SysResult,
) -> impl Fn(&mut ServiceCall) -> SysResult + Send + Sync + 'static {
    let fs = fs.clone();
    move |call| f(&fs, call)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{epoch::EpochTracker, tracer::memory::NoMemory};

    fn fs() -> MemFs {
        MemFs::new(["/view"]).with_file("docs/hello.txt", "hello, world\n")
    }

    #[test]
    fn test_open_read_close() {
        let fs = fs();
        let mut epochs = EpochTracker::new();
        let mut memory = NoMemory;
        let mut call = ServiceCall::for_test(&mut memory, &mut epochs);

        call.path = Some("/view/docs/hello.txt".into());
        let sfd = fs.open(&mut call).unwrap();

        call.sfd = Some(sfd);
        call.args.arg2 = 5;
        assert_eq!(fs.read(&mut call), Ok(5));
        assert_eq!(call.reply, Reply::Bytes(b"hello".to_vec()));

        call.args.arg2 = 100;
        assert_eq!(fs.read(&mut call), Ok(8));
        assert_eq!(fs.read(&mut call), Ok(0));

        assert_eq!(fs.close(&mut call), Ok(0));
        assert_eq!(fs.close(&mut call), Err(Errno::EBADF));
    }

    #[test]
    fn test_huge_read_count_after_partial_read() {
        let fs = fs();
        let mut epochs = EpochTracker::new();
        let mut memory = NoMemory;
        let mut call = ServiceCall::for_test(&mut memory, &mut epochs);

        call.path = Some("/view/docs/hello.txt".into());
        call.sfd = Some(fs.open(&mut call).unwrap());

        call.args.arg2 = 5;
        assert_eq!(fs.read(&mut call), Ok(5));

        call.args.arg2 = usize::MAX;
        assert_eq!(fs.read(&mut call), Ok(8));
        assert_eq!(call.reply, Reply::Bytes(b", world\n".to_vec()));

        call.args.arg3 = u64::MAX as usize - 1;
        assert_eq!(fs.pread(&mut call), Err(Errno::EINVAL));
        call.args.arg3 = 1 << 62;
        assert_eq!(fs.pread(&mut call), Ok(0));
    }

    #[test]
    fn test_write_past_size_limit() {
        let fs = fs();
        let mut epochs = EpochTracker::new();
        let mut memory = NoMemory;
        let mut call = ServiceCall::for_test(&mut memory, &mut epochs);

        call.path = Some("/view/docs/hello.txt".into());
        call.args.arg1 = OFlag::O_RDWR.bits() as _;
        call.sfd = Some(fs.open(&mut call).unwrap());
        call.input = b"xyz".to_vec();

        call.args.arg3 = 1 << 62;
        assert_eq!(fs.pwrite(&mut call), Err(Errno::EFBIG));
        call.args.arg3 = MAX_FILE_SIZE as usize - 2;
        assert_eq!(fs.pwrite(&mut call), Err(Errno::EFBIG));
        call.args.arg3 = usize::MAX;
        assert_eq!(fs.pwrite(&mut call), Err(Errno::EINVAL));

        call.args.arg3 = 7;
        assert_eq!(fs.pwrite(&mut call), Ok(3));
        assert_eq!(fs.fstat(&mut call), Ok(0));
        let Reply::Stat(st) = call.reply.clone() else {
            panic!("no stat reply");
        };
        assert_eq!(st.size, 13);
    }

    #[test]
    fn test_create_and_stat() {
        let fs = fs();
        let mut epochs = EpochTracker::new();
        let mut memory = NoMemory;
        let mut call = ServiceCall::for_test(&mut memory, &mut epochs);

        call.path = Some("/view/new".into());
        assert_eq!(fs.open(&mut call), Err(Errno::ENOENT));

        call.args.arg1 = (OFlag::O_CREAT | OFlag::O_WRONLY).bits() as _;
        call.args.arg2 = 0o600;
        call.sfd = Some(fs.open(&mut call).unwrap());
        call.input = b"abc".to_vec();
        assert_eq!(fs.write(&mut call), Ok(3));

        assert_eq!(fs.lstat(&mut call), Ok(0));
        let Reply::Stat(st) = call.reply.clone() else {
            panic!("no stat reply");
        };
        assert_eq!(st.size, 3);
        assert_eq!(st.mode & 0o7777, 0o600);
        assert!(!st.is_dir());

        call.path = Some("/view/missing/new".into());
        assert_eq!(fs.open(&mut call), Err(Errno::ENOENT));
    }

    #[test]
    fn test_list_directory() {
        let fs = fs();
        let mut epochs = EpochTracker::new();
        let mut memory = NoMemory;
        let mut call = ServiceCall::for_test(&mut memory, &mut epochs);

        call.path = Some("/view/docs".into());
        call.args.arg1 = (OFlag::O_RDONLY | OFlag::O_DIRECTORY).bits() as _;
        call.sfd = Some(fs.open(&mut call).unwrap());

        call.args.arg2 = 4096;
        let n = fs.getdents64(&mut call).unwrap();
        let Reply::Bytes(buf) = &call.reply else {
            panic!("no dirents");
        };
        assert_eq!(buf.len(), n as usize);
        assert!(buf.windows(9).any(|w| w == b"hello.txt"));

        // everything was returned at once
        assert_eq!(fs.getdents64(&mut call), Ok(0));
    }

    #[test]
    fn test_rmdir_needs_empty_directory() {
        let fs = fs();
        let mut epochs = EpochTracker::new();
        let mut memory = NoMemory;
        let mut call = ServiceCall::for_test(&mut memory, &mut epochs);

        call.path = Some("/view/docs".into());
        assert_eq!(fs.rmdir(&mut call), Err(Errno::ENOTEMPTY));

        call.path = Some("/view/docs/hello.txt".into());
        assert_eq!(fs.unlink(&mut call), Ok(0));

        call.path = Some("/view/docs".into());
        assert_eq!(fs.rmdir(&mut call), Ok(0));
        assert_eq!(fs.access(&mut call), Err(Errno::ENOENT));
    }

    #[test]
    fn test_mount_is_visible_afterwards() {
        let fs = MemFs::new(Vec::<PathBuf>::new()).with_file("f", "x");
        let mut epochs = EpochTracker::new();
        let mut memory = NoMemory;
        let mut call = ServiceCall::for_test(&mut memory, &mut epochs);

        call.path = Some("/mnt/f".into());
        assert_eq!(fs.access(&mut call), Err(Errno::ENOENT));

        call.path = Some("/mnt".into());
        call.strings = vec!["none".into(), FSTYPE.into(), String::new()];
        assert_eq!(fs.mount(&mut call), Ok(0));
        drop(call);

        // a call made after the mount sees it
        let mut call = ServiceCall::for_test(&mut memory, &mut epochs);
        call.path = Some("/mnt/f".into());
        assert_eq!(fs.access(&mut call), Ok(0));

        call.path = Some("/mnt".into());
        assert_eq!(fs.umount(&mut call), Ok(0));
        call.path = Some("/mnt/f".into());
        assert_eq!(fs.access(&mut call), Err(Errno::ENOENT));
    }
}
