//! Temporal versioning of service and mount visibility.
//!
//! Every registration carries the [`Timestamp`] it became visible at. A lookup
//! performed "as of" another timestamp only honours registrations stamped in
//! the same treepoch or one of its ancestors, and no later than the lookup's
//! own epoch. Nested sessions get a child treepoch: what they register never
//! leaks to the outer session, while everything the outer session registered
//! stays visible to them.

use std::fmt::Display;

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    /// "No match" marker returned by visibility checks and choice predicates.
    pub const NONE: Epoch = Epoch(0);

    const FIRST: Epoch = Epoch(2);

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn next(&self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreepochId {
    index: u32,
    generation: u32,
}

impl Display for TreepochId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub epoch: Epoch,
    pub treepoch: TreepochId,
}

impl Timestamp {
    pub fn with_epoch(self, epoch: Epoch) -> Self {
        Self { epoch, ..self }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.epoch, self.treepoch)
    }
}

#[derive(Debug)]
struct TreepochNode {
    generation: u32,
    live: bool,
    parent: Option<TreepochId>,
    rise: Epoch,
    depth: u32,
    nproc: usize,
    nchildren: usize,
    view_id: u32,
    view_name: Option<String>,
}

#[derive(Debug)]
pub struct EpochTracker {
    clock: Epoch,
    nodes: Vec<TreepochNode>,
    free: Vec<u32>,
    next_view_id: u32,
    root: TreepochId,
}

impl Default for EpochTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochTracker {
    pub fn new() -> Self {
        let mut tracker = Self {
            clock: Epoch::FIRST,
            nodes: Vec::new(),
            free: Vec::new(),
            next_view_id: 0,
            root: TreepochId {
                index: 0,
                generation: 0,
            },
        };

        tracker.root = tracker.new_fork(None);
        tracker
    }

    pub fn root(&self) -> TreepochId {
        self.root
    }

    /// Current value of the clock.
    pub fn now(&self) -> Epoch {
        self.clock
    }

    pub fn now_at(&self, treepoch: TreepochId) -> Timestamp {
        Timestamp {
            epoch: self.clock,
            treepoch,
        }
    }

    /// Advances the clock and returns the new value.
    pub fn tick(&mut self) -> Epoch {
        self.clock = self.clock.next();
        self.clock
    }

    /// Stamps a new registration in `treepoch`. Lookups that started before
    /// this call never observe it.
    pub fn stamp(&mut self, treepoch: TreepochId) -> Timestamp {
        let epoch = self.tick();
        Timestamp { epoch, treepoch }
    }

    fn node(&self, id: TreepochId) -> Option<&TreepochNode> {
        self.nodes
            .get(id.index as usize)
            .filter(|n| n.live && n.generation == id.generation)
    }

    fn node_mut(&mut self, id: TreepochId) -> Option<&mut TreepochNode> {
        self.nodes
            .get_mut(id.index as usize)
            .filter(|n| n.live && n.generation == id.generation)
    }

    pub fn is_live(&self, id: TreepochId) -> bool {
        self.node(id).is_some()
    }

    pub fn parent(&self, id: TreepochId) -> Option<TreepochId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn depth(&self, id: TreepochId) -> Option<u32> {
        self.node(id).map(|n| n.depth)
    }

    pub fn rise(&self, id: TreepochId) -> Option<Epoch> {
        self.node(id).map(|n| n.rise)
    }

    /// Whether `ancestor` is `id` itself or lies on its path to the root.
    pub fn is_ancestor_or_self(&self, ancestor: TreepochId, id: TreepochId) -> bool {
        let mut cur = Some(id);

        while let Some(c) = cur {
            if !self.is_live(c) {
                return false;
            }
            if c == ancestor {
                return true;
            }
            cur = self.parent(c);
        }

        false
    }

    /// Returns `stamp.epoch` if the registration it describes is visible from
    /// `at`, [`Epoch::NONE`] otherwise.
    pub fn matching_epoch(&self, stamp: Timestamp, at: Timestamp) -> Epoch {
        if stamp.epoch <= at.epoch && self.is_ancestor_or_self(stamp.treepoch, at.treepoch) {
            stamp.epoch
        } else {
            Epoch::NONE
        }
    }

    /// Creates a new branch. `None` creates a root.
    pub fn new_fork(&mut self, parent: Option<TreepochId>) -> TreepochId {
        let rise = self.tick();
        let depth = parent.and_then(|p| self.depth(p)).map_or(0, |d| d + 1);
        let view_id = self.next_view_id;
        self.next_view_id += 1;

        if let Some(p) = parent.and_then(|p| self.node_mut(p)) {
            p.nchildren += 1;
        }

        let id = match self.free.pop() {
            Some(index) => {
                let node = &mut self.nodes[index as usize];
                node.generation += 1;
                node.live = true;
                node.parent = parent;
                node.rise = rise;
                node.depth = depth;
                node.nproc = 0;
                node.nchildren = 0;
                node.view_id = view_id;
                node.view_name = None;

                TreepochId {
                    index,
                    generation: node.generation,
                }
            }
            None => {
                self.nodes.push(TreepochNode {
                    generation: 0,
                    live: true,
                    parent,
                    rise,
                    depth,
                    nproc: 0,
                    nchildren: 0,
                    view_id,
                    view_name: None,
                });

                TreepochId {
                    index: (self.nodes.len() - 1) as _,
                    generation: 0,
                }
            }
        };

        debug!("New treepoch {id} (parent {parent:?}, rise {rise}, view {view_id})");

        id
    }

    /// Accounts for one more process living in `id`.
    pub fn new_proc(&mut self, id: TreepochId) -> TreepochId {
        if let Some(node) = self.node_mut(id) {
            node.nproc += 1;
        }
        id
    }

    /// Drops one process reference. A non-root node is freed once it has no
    /// process and no child left, which may cascade to its parent.
    pub fn del_proc(&mut self, id: TreepochId) {
        if let Some(node) = self.node_mut(id) {
            node.nproc = node.nproc.saturating_sub(1);
        }
        self.maybe_free(id);
    }

    fn maybe_free(&mut self, id: TreepochId) {
        let mut cur = Some(id);

        while let Some(c) = cur {
            if c == self.root {
                return;
            }

            let Some(node) = self.node_mut(c) else {
                return;
            };

            if node.nproc > 0 || node.nchildren > 0 {
                return;
            }

            node.live = false;
            node.view_name = None;
            let parent = node.parent.take();
            self.free.push(c.index);

            debug!("Treepoch {c} freed");

            if let Some(p) = parent.and_then(|p| self.node_mut(p)) {
                p.nchildren = p.nchildren.saturating_sub(1);
            }

            cur = parent;
        }
    }

    pub fn view_id(&self, id: TreepochId) -> Option<u32> {
        self.node(id).map(|n| n.view_id)
    }

    /// Name of the view, inherited from the closest named ancestor.
    pub fn view_name(&self, id: TreepochId) -> Option<&str> {
        let mut cur = Some(id);

        while let Some(c) = cur {
            let node = self.node(c)?;
            if let Some(name) = &node.view_name {
                return Some(name);
            }
            cur = node.parent;
        }

        None
    }

    pub fn set_view_name(&mut self, id: TreepochId, name: impl Into<String>) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.view_name = Some(name.into());
                true
            }
            None => false,
        }
    }

    /// Whether processes in `id` belong to the view `outer` or to a view
    /// nested inside it.
    pub fn same_view_or_nested(&self, outer: TreepochId, id: TreepochId) -> bool {
        self.is_ancestor_or_self(outer, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let mut tracker = EpochTracker::new();
        let root = tracker.root();

        let a = tracker.stamp(root);
        let b = tracker.stamp(root);
        assert!(b.epoch > a.epoch);
        assert_eq!(tracker.now(), b.epoch);
        assert!(!a.epoch.is_none());
    }

    #[test]
    fn test_matching_epoch_same_branch() {
        let mut tracker = EpochTracker::new();
        let root = tracker.root();

        let before = tracker.now_at(root);
        let reg = tracker.stamp(root);
        let after = tracker.now_at(root);

        assert_eq!(tracker.matching_epoch(reg, before), Epoch::NONE);
        assert_eq!(tracker.matching_epoch(reg, after), reg.epoch);
    }

    #[test]
    fn test_nested_branch_visibility() {
        let mut tracker = EpochTracker::new();
        let root = tracker.root();

        let outer_reg = tracker.stamp(root);
        let nested = tracker.new_fork(Some(root));
        tracker.new_proc(nested);
        let inner_reg = tracker.stamp(nested);

        let outer_view = tracker.now_at(root);
        let inner_view = tracker.now_at(nested);

        // inner registrations never leak outward
        assert_eq!(tracker.matching_epoch(inner_reg, outer_view), Epoch::NONE);
        assert_eq!(tracker.matching_epoch(inner_reg, inner_view), inner_reg.epoch);

        // outer registrations stay visible inside
        assert_eq!(tracker.matching_epoch(outer_reg, inner_view), outer_reg.epoch);
    }

    #[test]
    fn test_sibling_branches_are_isolated() {
        let mut tracker = EpochTracker::new();
        let root = tracker.root();

        let a = tracker.new_fork(Some(root));
        let b = tracker.new_fork(Some(root));
        tracker.new_proc(a);
        tracker.new_proc(b);

        let reg_a = tracker.stamp(a);
        assert_eq!(tracker.matching_epoch(reg_a, tracker.now_at(b)), Epoch::NONE);
    }

    #[test]
    fn test_freed_branch_invalidates_stamps() {
        let mut tracker = EpochTracker::new();
        let root = tracker.root();

        let nested = tracker.new_fork(Some(root));
        tracker.new_proc(nested);
        let reg = tracker.stamp(nested);
        let view = tracker.now_at(nested);

        tracker.del_proc(nested);
        assert!(!tracker.is_live(nested));
        assert_eq!(tracker.matching_epoch(reg, view), Epoch::NONE);

        // the slot is reused under a new generation
        let reused = tracker.new_fork(Some(root));
        assert_ne!(reused, nested);
        assert!(tracker.is_live(reused));
    }

    #[test]
    fn test_free_cascades_to_parent() {
        let mut tracker = EpochTracker::new();
        let root = tracker.root();

        let mid = tracker.new_fork(Some(root));
        let leaf = tracker.new_fork(Some(mid));
        tracker.new_proc(leaf);

        tracker.del_proc(leaf);
        assert!(!tracker.is_live(leaf));
        assert!(!tracker.is_live(mid));
        assert!(tracker.is_live(root));
    }

    #[test]
    fn test_view_names_inherit() {
        let mut tracker = EpochTracker::new();
        let root = tracker.root();
        let nested = tracker.new_fork(Some(root));
        tracker.new_proc(nested);

        assert_eq!(tracker.view_name(nested), None);
        tracker.set_view_name(root, "outer");
        assert_eq!(tracker.view_name(nested), Some("outer"));
        tracker.set_view_name(nested, "inner");
        assert_eq!(tracker.view_name(nested), Some("inner"));
        assert_eq!(tracker.view_name(root), Some("outer"));

        assert_eq!(tracker.view_id(root), Some(0));
        assert_eq!(tracker.view_id(nested), Some(1));
        assert!(tracker.same_view_or_nested(root, nested));
        assert!(!tracker.same_view_or_nested(nested, root));
    }
}
