use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use crate::types::service_code::ServiceCode;

/// A descriptor opened by a service. Shared between every process descriptor
/// that refers to it (dup, fork without shared files), the service-side
/// descriptor is closed when the last reference goes away.
#[derive(Debug, PartialEq, Eq)]
pub struct VirtualFile {
    pub service: ServiceCode,
    pub sfd: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdEntry {
    Virtual {
        file: Arc<VirtualFile>,
        cloexec: bool,
    },

    /// Held by another virtualization layer. Any use is reported as `EBADF`.
    Reserved,
}

impl FdEntry {
    pub fn new_virtual(file: VirtualFile, cloexec: bool) -> Self {
        FdEntry::Virtual {
            file: Arc::new(file),
            cloexec,
        }
    }

    pub fn file(&self) -> Option<&Arc<VirtualFile>> {
        match self {
            FdEntry::Virtual { file, .. } => Some(file),
            FdEntry::Reserved => None,
        }
    }
}

/// Process descriptor number to virtual file mapping. Descriptors not in the
/// table belong to the kernel.
#[derive(Debug, Default, Clone)]
pub struct FdTable {
    entries: BTreeMap<i32, FdEntry>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fd: i32) -> Option<&FdEntry> {
        self.entries.get(&fd)
    }

    pub fn virtual_file(&self, fd: i32) -> Option<&Arc<VirtualFile>> {
        self.get(fd).and_then(|e| e.file())
    }

    pub fn is_reserved(&self, fd: i32) -> bool {
        matches!(self.get(fd), Some(FdEntry::Reserved))
    }

    /// Installs `entry` at `fd`, returning the entry it replaces.
    pub fn insert(&mut self, fd: i32, entry: FdEntry) -> Option<FdEntry> {
        self.entries.insert(fd, entry)
    }

    pub fn remove(&mut self, fd: i32) -> Option<FdEntry> {
        self.entries.remove(&fd)
    }

    pub fn reserve(&mut self, fd: i32) -> Option<FdEntry> {
        self.insert(fd, FdEntry::Reserved)
    }

    /// Mirrors a kernel-side `dup` from `old` to `new`. Returns whatever `new`
    /// referred to before, which the caller has to release.
    pub fn duplicate(&mut self, old: i32, new: i32, cloexec: bool) -> Option<FdEntry> {
        let entry = match self.entries.get(&old) {
            Some(FdEntry::Virtual { file, .. }) => Some(FdEntry::Virtual {
                file: file.clone(),
                cloexec,
            }),
            Some(FdEntry::Reserved) => Some(FdEntry::Reserved),
            None => None,
        };

        match entry {
            Some(entry) => self.insert(new, entry),
            None => self.remove(new),
        }
    }

    pub fn set_cloexec(&mut self, fd: i32, value: bool) {
        if let Some(FdEntry::Virtual { cloexec, .. }) = self.entries.get_mut(&fd) {
            *cloexec = value;
        }
    }

    /// Drops the entries the kernel closes on a successful exec.
    pub fn take_cloexec(&mut self) -> Vec<FdEntry> {
        let fds: Vec<i32> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e, FdEntry::Virtual { cloexec: true, .. }))
            .map(|(fd, _)| *fd)
            .collect();

        fds.into_iter()
            .filter_map(|fd| self.entries.remove(&fd))
            .collect()
    }

    pub fn take_all(&mut self) -> Vec<FdEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &FdEntry)> {
        self.entries.iter().map(|(fd, e)| (*fd, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(sfd: i64) -> VirtualFile {
        VirtualFile {
            service: ServiceCode(1),
            sfd,
            path: PathBuf::from("/v/f"),
        }
    }

    #[test]
    fn test_duplicate_shares_file() {
        let mut table = FdTable::new();
        table.insert(3, FdEntry::new_virtual(file(7), false));

        assert_eq!(table.duplicate(3, 9, true), None);

        let a = table.virtual_file(3).unwrap();
        let b = table.virtual_file(9).unwrap();
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(Arc::strong_count(a), 2);
    }

    #[test]
    fn test_duplicate_real_over_virtual() {
        let mut table = FdTable::new();
        table.insert(4, FdEntry::new_virtual(file(1), false));

        // dup2(real 0, 4) closes the virtual file at 4
        let replaced = table.duplicate(0, 4, false);
        assert!(matches!(replaced, Some(FdEntry::Virtual { .. })));
        assert!(table.get(4).is_none());
    }

    #[test]
    fn test_take_cloexec() {
        let mut table = FdTable::new();
        table.insert(3, FdEntry::new_virtual(file(1), true));
        table.insert(4, FdEntry::new_virtual(file(2), false));
        table.reserve(5);

        let closed = table.take_cloexec();
        assert_eq!(closed.len(), 1);
        assert!(table.get(3).is_none());
        assert!(table.get(4).is_some());
        assert!(table.is_reserved(5));
    }
}
