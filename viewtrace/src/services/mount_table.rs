use std::path::{Path, PathBuf};

use crate::epoch::{Epoch, Timestamp};

use super::{ChoiceContext, Claim};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub flags: u64,
    pub data: Option<String>,
    pub stamp: Timestamp,
}

/// Epoch-aware prefix table a service can keep its mounts in.
///
/// A lookup only sees mounts stamped no later than, and in a treepoch
/// visible from, the lookup's timestamp. Among visible mounts covering a
/// path the deepest target wins, then the most recent one.
#[derive(Debug, Default, Clone)]
pub struct MountTable {
    mounts: Vec<Mount>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mount: Mount) {
        self.mounts.push(mount);
    }

    /// Removes the most recent mount on `target` that `matching` finds visible.
    pub fn remove(&mut self, target: &Path, matching: impl Fn(Timestamp) -> Epoch) -> Option<Mount> {
        let (pos, _) = self
            .mounts
            .iter()
            .enumerate()
            .filter(|(_, m)| m.target == target)
            .map(|(i, m)| (i, matching(m.stamp)))
            .filter(|(_, e)| !e.is_none())
            .max_by_key(|(_, e)| *e)?;

        Some(self.mounts.remove(pos))
    }

    pub fn lookup(&self, path: &Path, ctx: &ChoiceContext) -> Option<(&Mount, Epoch)> {
        self.find(path, |stamp| ctx.matching_epoch(stamp))
    }

    /// Like [`MountTable::lookup`], for handlers which see mounts through
    /// [`ServiceCall::matching_epoch`](super::ServiceCall::matching_epoch).
    pub fn find(&self, path: &Path, matching: impl Fn(Timestamp) -> Epoch) -> Option<(&Mount, Epoch)> {
        self.mounts
            .iter()
            .filter(|m| path.starts_with(&m.target))
            .map(|m| (m, matching(m.stamp)))
            .filter(|(_, e)| !e.is_none())
            .max_by_key(|(m, e)| (m.target.components().count(), *e))
    }

    pub fn claim(&self, path: &Path, ctx: &ChoiceContext) -> Claim {
        match self.lookup(path, ctx) {
            Some((_, epoch)) => Claim::Own(epoch),
            None => Claim::Decline,
        }
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::EpochTracker;

    fn mount(target: &str, stamp: Timestamp) -> Mount {
        Mount {
            source: "none".into(),
            target: target.into(),
            fstype: "test".into(),
            flags: 0,
            data: None,
            stamp,
        }
    }

    #[test]
    fn test_deepest_visible_mount_wins() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut table = MountTable::new();

        let outer = epochs.stamp(root);
        table.add(mount("/m", outer));
        let before_inner = epochs.now_at(root);
        let inner = epochs.stamp(root);
        table.add(mount("/m/sub", inner));

        let path = Path::new("/m/sub/f");

        let ctx = ChoiceContext::new(&epochs, epochs.now_at(root), outer);
        let (m, e) = table.lookup(path, &ctx).unwrap();
        assert_eq!(m.target, PathBuf::from("/m/sub"));
        assert_eq!(e, inner.epoch);

        // a lookup that started before the inner mount does not see it
        let ctx = ChoiceContext::new(&epochs, before_inner, outer);
        let (m, _) = table.lookup(path, &ctx).unwrap();
        assert_eq!(m.target, PathBuf::from("/m"));

        assert_eq!(table.claim(Path::new("/other"), &ctx), Claim::Decline);
    }

    #[test]
    fn test_remove_most_recent() {
        let mut epochs = EpochTracker::new();
        let root = epochs.root();
        let mut table = MountTable::new();

        let first = epochs.stamp(root);
        table.add(mount("/m", first));
        let second = epochs.stamp(root);
        table.add(mount("/m", second));

        let at = epochs.now_at(root);
        let removed = table
            .remove(Path::new("/m"), |s| epochs.matching_epoch(s, at))
            .unwrap();
        assert_eq!(removed.stamp, second);
        assert_eq!(table.len(), 1);
    }
}
