use std::{collections::HashMap, sync::Arc};

use log::{debug, info};
use nix::{sched::CloneFlags, unistd::Pid};
use parking_lot::RwLock;

use crate::{
    epoch::EpochTracker,
    error::{Error, Result},
    tracer::Handle,
    types::pcb_id::PcbId,
};

use super::{FsState, Pcb, SyscallState};

pub const INITIAL_CAPACITY: usize = 10;

#[derive(Default)]
struct Slot {
    generation: u32,
    pcb: Option<Pcb>,
}

/// Table of process control blocks.
///
/// Storage is a list of chunks. Growing appends a chunk as large as the
/// current capacity and never moves the existing ones, so [`PcbId`]s stay
/// valid across growth.
pub struct PcbStore {
    chunks: Vec<Box<[Slot]>>,
    capacity: usize,
    max_capacity: Option<usize>,
    len: usize,
    by_handle: HashMap<Handle, PcbId>,
}

impl PcbStore {
    pub fn new(max_capacity: Option<usize>) -> Self {
        let initial: Box<[Slot]> = (0..INITIAL_CAPACITY).map(|_| Slot::default()).collect();

        Self {
            chunks: vec![initial],
            capacity: INITIAL_CAPACITY,
            max_capacity,
            len: 0,
            by_handle: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn push_chunk(&mut self, size: usize) -> Result<()> {
        self.chunks
            .try_reserve(1)
            .map_err(|_| Error::PcbTableExhausted)?;

        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(size)
            .map_err(|_| Error::PcbTableExhausted)?;
        chunk.resize_with(size, Slot::default);

        self.chunks.push(chunk.into_boxed_slice());
        self.capacity += size;

        Ok(())
    }

    fn grow(&mut self) -> Result<()> {
        let size = self.capacity;

        if let Some(max) = self.max_capacity {
            if self.capacity + size > max {
                return Err(Error::PcbTableExhausted);
            }
        }

        self.push_chunk(size)?;
        info!("Process table grown to {} slots", self.capacity);

        Ok(())
    }

    fn locate(&self, index: usize) -> Option<(usize, usize)> {
        let mut offset = index;

        for (i, chunk) in self.chunks.iter().enumerate() {
            if offset < chunk.len() {
                return Some((i, offset));
            }
            offset -= chunk.len();
        }

        None
    }

    fn slot(&self, index: usize) -> Option<&Slot> {
        let (c, o) = self.locate(index)?;
        Some(&self.chunks[c][o])
    }

    fn slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        let (c, o) = self.locate(index)?;
        Some(&mut self.chunks[c][o])
    }

    pub fn get(&self, id: PcbId) -> Option<&Pcb> {
        self.slot(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.pcb.as_ref())
    }

    pub fn get_mut(&mut self, id: PcbId) -> Option<&mut Pcb> {
        self.slot_mut(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.pcb.as_mut())
    }

    fn free_index(&mut self) -> Result<usize> {
        let found = self
            .chunks
            .iter()
            .flat_map(|c| c.iter())
            .position(|s| s.pcb.is_none());

        match found {
            Some(index) => Ok(index),
            None => {
                let index = self.capacity;
                self.grow()?;
                Ok(index)
            }
        }
    }

    /// Creates the control block of a new traced process.
    ///
    /// `creator` is the process that issued the clone. Filesystem state and
    /// descriptor table are shared with it or copied according to
    /// `clone_flags`, and the new process lives in the creator's treepoch.
    /// `root_fs` is only used when there is no creator.
    pub fn allocate(
        &mut self,
        handle: Handle,
        pid: Pid,
        creator: Option<PcbId>,
        clone_flags: CloneFlags,
        root_fs: impl FnOnce() -> FsState,
        epochs: &mut EpochTracker,
    ) -> Result<PcbId> {
        if self.by_handle.contains_key(&handle) {
            return Err(Error::InvalidState);
        }

        let creator = creator.and_then(|c| self.get(c).map(|p| (c, p)));

        let (parent, fs, fds, treepoch) = match creator {
            Some((creator_id, creator)) => {
                let parent = if clone_flags.contains(CloneFlags::CLONE_PARENT) {
                    creator.parent
                } else {
                    Some(creator_id)
                };

                let fs = if clone_flags.contains(CloneFlags::CLONE_FS) {
                    creator.fs.clone()
                } else {
                    Arc::new(RwLock::new(creator.fs.read().clone()))
                };

                let fds = if clone_flags.contains(CloneFlags::CLONE_FILES) {
                    creator.fds.clone()
                } else {
                    Arc::new(RwLock::new(creator.fds.read().clone()))
                };

                (parent, fs, fds, creator.treepoch())
            }
            None => (
                None,
                Arc::new(RwLock::new(root_fs())),
                Arc::new(RwLock::new(Default::default())),
                epochs.root(),
            ),
        };

        let index = self.free_index()?;
        let treepoch = epochs.new_proc(treepoch);
        let timestamp = epochs.now_at(treepoch);

        let slot = self.slot_mut(index).ok_or(Error::InvalidState)?;
        let id = PcbId::new(index as _, slot.generation);

        slot.pcb = Some(Pcb {
            handle,
            pid,
            parent,
            children: Vec::new(),
            dynamic: index >= INITIAL_CAPACITY,
            timestamp,
            nest_epoch: timestamp.epoch,
            fs,
            fds,
            in_syscall: None,
            syscall: SyscallState::default(),
            parked: None,
            tmpfile_to_unlink: None,
        });

        if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            p.children.push(id);
        }

        self.by_handle.insert(handle, id);
        self.len += 1;

        debug!("{id} allocated for pid {pid} (parent {parent:?}, flags {clone_flags:?})");

        Ok(id)
    }

    /// Frees the slot of `id` and returns its control block. Children lose
    /// their back reference and the parent forgets about `id`.
    pub fn release(&mut self, id: PcbId) -> Option<Pcb> {
        let slot = self
            .slot_mut(id.index())
            .filter(|s| s.generation == id.generation)?;

        let pcb = slot.pcb.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        self.len -= 1;
        self.by_handle.remove(&pcb.handle);

        for child in &pcb.children {
            if let Some(c) = self.get_mut(*child) {
                c.parent = None;
            }
        }

        if let Some(p) = pcb.parent.and_then(|p| self.get_mut(p)) {
            p.children.retain(|c| *c != id);
        }

        debug!("{id} released (pid {})", pcb.pid);

        Some(pcb)
    }

    pub fn find_by_handle(&self, handle: Handle) -> Option<PcbId> {
        self.by_handle.get(&handle).copied()
    }

    /// Linear scan. Not meant for the syscall hot path.
    pub fn find_by_pid(&self, pid: Pid) -> Option<PcbId> {
        self.iter().find(|(_, p)| p.pid == pid).map(|(id, _)| id)
    }

    /// In-use control blocks in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (PcbId, &Pcb)> {
        self.chunks
            .iter()
            .flat_map(|c| c.iter())
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.pcb
                    .as_ref()
                    .map(|p| (PcbId::new(index as _, slot.generation), p))
            })
    }

    pub fn for_each(&self, mut f: impl FnMut(PcbId, &Pcb)) {
        self.iter().for_each(|(id, p)| f(id, p))
    }

    pub fn ids(&self) -> Vec<PcbId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn root_fs() -> FsState {
        FsState::new("/home", "/", 0o022)
    }

    fn alloc(
        store: &mut PcbStore,
        epochs: &mut EpochTracker,
        n: u64,
        creator: Option<PcbId>,
        flags: CloneFlags,
    ) -> PcbId {
        store
            .allocate(
                Handle(n),
                Pid::from_raw(n as _),
                creator,
                flags,
                root_fs,
                epochs,
            )
            .unwrap()
    }

    #[test]
    fn test_growth_keeps_ids_valid() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(None);

        let ids: Vec<PcbId> = (1..=25)
            .map(|n| alloc(&mut store, &mut epochs, n, None, CloneFlags::empty()))
            .collect();

        assert_eq!(store.len(), 25);
        assert_eq!(store.capacity(), 40);

        for (n, id) in ids.iter().enumerate() {
            assert_eq!(store.get(*id).unwrap().pid, Pid::from_raw(n as i32 + 1));
        }

        assert!(!store.get(ids[0]).unwrap().dynamic);
        assert!(store.get(ids[24]).unwrap().dynamic);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(Some(INITIAL_CAPACITY));

        for n in 1..=INITIAL_CAPACITY as u64 {
            alloc(&mut store, &mut epochs, n, None, CloneFlags::empty());
        }

        let err = store
            .allocate(
                Handle(100),
                Pid::from_raw(100),
                None,
                CloneFlags::empty(),
                root_fs,
                &mut epochs,
            )
            .unwrap_err();

        assert!(matches!(err, Error::PcbTableExhausted));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_release_then_lookup_fails() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(None);

        let id = alloc(&mut store, &mut epochs, 5, None, CloneFlags::empty());
        assert_eq!(store.find_by_pid(Pid::from_raw(5)), Some(id));

        store.release(id).unwrap();
        assert_eq!(store.find_by_pid(Pid::from_raw(5)), None);
        assert_eq!(store.find_by_handle(Handle(5)), None);
        assert!(store.get(id).is_none());

        // the slot is reused, the stale id stays dead
        let reused = alloc(&mut store, &mut epochs, 6, None, CloneFlags::empty());
        assert_eq!(reused.index(), id.index());
        assert!(store.get(id).is_none());
        assert!(store.release(id).is_none());
    }

    #[test]
    fn test_release_severs_children() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(None);

        let parent = alloc(&mut store, &mut epochs, 1, None, CloneFlags::empty());
        let a = alloc(&mut store, &mut epochs, 2, Some(parent), CloneFlags::empty());
        let b = alloc(&mut store, &mut epochs, 3, Some(parent), CloneFlags::empty());

        assert_eq!(store.get(parent).unwrap().children, vec![a, b]);

        store.release(parent);
        assert_eq!(store.get(a).unwrap().parent, None);
        assert_eq!(store.get(b).unwrap().parent, None);

        store.release(a);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clone_parent_reparents() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(None);

        let grand = alloc(&mut store, &mut epochs, 1, None, CloneFlags::empty());
        let parent = alloc(&mut store, &mut epochs, 2, Some(grand), CloneFlags::empty());
        let child = alloc(&mut store, &mut epochs, 3, Some(parent), CloneFlags::CLONE_PARENT);

        assert_eq!(store.get(child).unwrap().parent, Some(grand));
        assert_eq!(store.get(grand).unwrap().children, vec![parent, child]);
    }

    #[test]
    fn test_shared_fs_state() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(None);

        let parent = alloc(&mut store, &mut epochs, 1, None, CloneFlags::empty());
        let shared = alloc(&mut store, &mut epochs, 2, Some(parent), CloneFlags::CLONE_FS);
        let copied = alloc(&mut store, &mut epochs, 3, Some(parent), CloneFlags::empty());

        store.get(shared).unwrap().fs.write().cwd = PathBuf::from("/tmp");
        assert_eq!(store.get(parent).unwrap().fs.read().cwd, PathBuf::from("/tmp"));

        store.get(copied).unwrap().fs.write().cwd = PathBuf::from("/var");
        assert_eq!(store.get(parent).unwrap().fs.read().cwd, PathBuf::from("/tmp"));

        let fs = store.get(parent).unwrap().fs.clone();
        assert_eq!(Arc::strong_count(&fs), 3);
        store.release(shared);
        assert_eq!(Arc::strong_count(&fs), 2);
    }

    #[test]
    fn test_children_inherit_treepoch() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(None);

        let root = alloc(&mut store, &mut epochs, 1, None, CloneFlags::empty());
        let nested = epochs.new_fork(Some(epochs.root()));
        store.get_mut(root).unwrap().timestamp.treepoch = nested;

        let child = alloc(&mut store, &mut epochs, 2, Some(root), CloneFlags::empty());
        assert_eq!(store.get(child).unwrap().treepoch(), nested);
    }

    #[test]
    fn test_for_each_is_in_slot_order() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(None);

        let ids: Vec<PcbId> = (1..=4)
            .map(|n| alloc(&mut store, &mut epochs, n, None, CloneFlags::empty()))
            .collect();
        store.release(ids[1]);

        let mut seen = Vec::new();
        store.for_each(|id, _| seen.push(id));
        assert_eq!(seen, vec![ids[0], ids[2], ids[3]]);
    }

    #[test]
    fn test_nest_epoch_moves_lookups_forward() {
        let mut epochs = EpochTracker::new();
        let mut store = PcbStore::new(None);

        let id = alloc(&mut store, &mut epochs, 1, None, CloneFlags::empty());
        let pcb = store.get_mut(id).unwrap();
        let now = epochs.now();
        pcb.timestamp.epoch = now;
        pcb.nest_epoch = now;

        let old = pcb.set_nest_epoch(now.next());
        assert_eq!(old, now);
        assert_eq!(pcb.lookup_timestamp().epoch, now.next());

        assert_eq!(pcb.set_nest_epoch(crate::epoch::Epoch::NONE), now.next());
        assert_eq!(pcb.lookup_timestamp().epoch, now.next());
    }
}
