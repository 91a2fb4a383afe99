use nix::{
    libc,
    sys::stat::{major, makedev, minor, SFlag},
};

/// Owned snapshot of file metadata, independent of the kernel ABI it is
/// later serialized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: (i64, i64),
    pub mtime: (i64, i64),
    pub ctime: (i64, i64),
}

impl FileStat {
    pub fn directory(perm: u32) -> Self {
        Self {
            mode: SFlag::S_IFDIR.bits() | (perm & 0o7777),
            nlink: 2,
            blksize: 4096,
            ..Default::default()
        }
    }

    pub fn regular(size: i64, perm: u32) -> Self {
        Self {
            mode: SFlag::S_IFREG.bits() | (perm & 0o7777),
            nlink: 1,
            size,
            blksize: 4096,
            blocks: (size + 511) / 512,
            ..Default::default()
        }
    }

    pub fn symlink(target_len: i64) -> Self {
        Self {
            mode: SFlag::S_IFLNK.bits() | 0o777,
            nlink: 1,
            size: target_len,
            ..Default::default()
        }
    }

    pub fn with_ino(mut self, ino: u64) -> Self {
        self.ino = ino;
        self
    }

    pub fn file_type(&self) -> SFlag {
        SFlag::from_bits_truncate(self.mode & SFlag::S_IFMT.bits())
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == SFlag::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == SFlag::S_IFLNK
    }

    /// Serializes into the traced process's `struct stat`.
    pub fn to_stat_bytes(&self) -> Vec<u8> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };

        st.st_dev = self.dev as _;
        st.st_ino = self.ino as _;
        st.st_mode = self.mode as _;
        st.st_nlink = self.nlink as _;
        st.st_uid = self.uid as _;
        st.st_gid = self.gid as _;
        st.st_rdev = self.rdev as _;
        st.st_size = self.size as _;
        st.st_blksize = self.blksize as _;
        st.st_blocks = self.blocks as _;
        st.st_atime = self.atime.0 as _;
        st.st_atime_nsec = self.atime.1 as _;
        st.st_mtime = self.mtime.0 as _;
        st.st_mtime_nsec = self.mtime.1 as _;
        st.st_ctime = self.ctime.0 as _;
        st.st_ctime_nsec = self.ctime.1 as _;

        as_bytes(&st).to_vec()
    }

    /// Serializes into the traced process's `struct statx`.
    pub fn to_statx_bytes(&self) -> Vec<u8> {
        let mut stx: libc::statx = unsafe { std::mem::zeroed() };

        stx.stx_mask = libc::STATX_BASIC_STATS;
        stx.stx_blksize = self.blksize as _;
        stx.stx_nlink = self.nlink as _;
        stx.stx_uid = self.uid;
        stx.stx_gid = self.gid;
        stx.stx_mode = self.mode as _;
        stx.stx_ino = self.ino;
        stx.stx_size = self.size as _;
        stx.stx_blocks = self.blocks as _;
        stx.stx_atime.tv_sec = self.atime.0;
        stx.stx_atime.tv_nsec = self.atime.1 as _;
        stx.stx_mtime.tv_sec = self.mtime.0;
        stx.stx_mtime.tv_nsec = self.mtime.1 as _;
        stx.stx_ctime.tv_sec = self.ctime.0;
        stx.stx_ctime.tv_nsec = self.ctime.1 as _;
        stx.stx_rdev_major = major(self.rdev) as _;
        stx.stx_rdev_minor = minor(self.rdev) as _;
        stx.stx_dev_major = major(self.dev) as _;
        stx.stx_dev_minor = minor(self.dev) as _;

        as_bytes(&stx).to_vec()
    }

    pub fn with_dev(mut self, major: u64, minor: u64) -> Self {
        self.dev = makedev(major, minor);
        self
    }
}

impl From<nix::sys::stat::FileStat> for FileStat {
    fn from(st: nix::sys::stat::FileStat) -> Self {
        Self {
            dev: st.st_dev as _,
            ino: st.st_ino as _,
            mode: st.st_mode as _,
            nlink: st.st_nlink as _,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as _,
            size: st.st_size as _,
            blksize: st.st_blksize as _,
            blocks: st.st_blocks as _,
            atime: (st.st_atime as _, st.st_atime_nsec as _),
            mtime: (st.st_mtime as _, st.st_mtime_nsec as _),
            ctime: (st.st_ctime as _, st.st_ctime_nsec as _),
        }
    }
}

fn as_bytes<T: Sized>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}
