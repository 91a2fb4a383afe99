//! Process-relative path resolution.
//!
//! Turns the raw path argument of a syscall into an absolute host path with
//! every symbolic link resolved, stat'ing each component on the way so that
//! the final component's metadata comes for free. Components are looked up
//! through a [`Lookup`], which lets paths inside a view be resolved by the
//! service owning them instead of the host.

use std::{
    collections::VecDeque,
    ffi::OsString,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

use log::trace;
use nix::{errno::Errno, unistd::Pid};

use crate::{tracer::memory::PATH_MAX, types::file_stat::FileStat};

/// Maximum number of symbolic links followed in one resolution.
pub const MAX_SYMLINKS: usize = 40;

pub trait Lookup {
    /// Metadata of `path` without following a final symbolic link.
    fn lstat(&mut self, path: &Path) -> Result<FileStat, Errno>;

    fn readlink(&mut self, path: &Path) -> Result<PathBuf, Errno>;
}

/// Resolves against the host filesystem, on behalf of process `pid`.
pub struct HostLookup {
    pub pid: Pid,
}

impl HostLookup {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl Lookup for HostLookup {
    fn lstat(&mut self, path: &Path) -> Result<FileStat, Errno> {
        Ok(nix::sys::stat::lstat(path)?.into())
    }

    fn readlink(&mut self, path: &Path) -> Result<PathBuf, Errno> {
        // the tracer's own view of these links is not the caller's
        if path == Path::new("/proc/self") {
            return Ok(PathBuf::from(self.pid.to_string()));
        }
        if path == Path::new("/proc/thread-self") {
            return Ok(PathBuf::from(format!("{0}/task/{0}", self.pid)));
        }

        std::fs::read_link(path)
            .map_err(|e| e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,

    /// `None` if the final component does not exist.
    pub stat: Option<FileStat>,
}

fn push_components(queue: &mut VecDeque<OsString>, path: &Path) {
    let items: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(n) => Some(n.to_owned()),
            Component::ParentDir => Some("..".into()),
            _ => None,
        })
        .collect();

    for item in items.into_iter().rev() {
        queue.push_front(item);
    }
}

/// Resolves `raw` relative to `cwd` (absolute paths relative to `root`).
///
/// A missing final component is not an error: the caller may be about to
/// create it. A missing or non-directory intermediate component is.
/// `..` never climbs above `root`.
pub fn canonicalize(
    raw: &Path,
    cwd: &Path,
    root: &Path,
    follow_last: bool,
    lookup: &mut dyn Lookup,
) -> Result<Resolved, Errno> {
    let bytes = raw.as_os_str().as_bytes();

    if bytes.is_empty() {
        return Err(Errno::ENOENT);
    }
    if bytes.len() >= PATH_MAX {
        return Err(Errno::ENAMETOOLONG);
    }

    let must_be_dir = bytes.ends_with(b"/");
    let follow_last = follow_last || must_be_dir;

    let mut current = if raw.is_absolute() {
        root.to_path_buf()
    } else {
        cwd.to_path_buf()
    };

    let mut queue = VecDeque::new();
    push_components(&mut queue, raw);

    let mut stat = None;
    let mut nr_links = 0;

    while let Some(name) = queue.pop_front() {
        let is_last = queue.is_empty();

        if name == ".." {
            if current != root && current.starts_with(root) {
                current.pop();
            }
            stat = None;
            continue;
        }

        let candidate = current.join(&name);
        if candidate.as_os_str().len() >= PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        let st = match lookup.lstat(&candidate) {
            Ok(st) => st,
            Err(Errno::ENOENT) if is_last => {
                return Ok(Resolved {
                    path: candidate,
                    stat: None,
                })
            }
            Err(e) => return Err(e),
        };

        if st.is_symlink() && (!is_last || follow_last) {
            nr_links += 1;
            if nr_links > MAX_SYMLINKS {
                return Err(Errno::ELOOP);
            }

            let target = lookup.readlink(&candidate)?;
            trace!("{candidate:?} -> {target:?}");

            if target.is_absolute() {
                current = root.to_path_buf();
            }
            push_components(&mut queue, &target);

            if queue.is_empty() {
                // link to "/" or to itself
                stat = None;
            }
            continue;
        }

        if !is_last && !st.is_dir() {
            return Err(Errno::ENOTDIR);
        }

        current = candidate;
        stat = Some(st);
    }

    let stat = match stat {
        Some(st) => st,
        None => lookup.lstat(&current)?,
    };

    if must_be_dir && !stat.is_dir() {
        return Err(Errno::ENOTDIR);
    }

    Ok(Resolved {
        path: current,
        stat: Some(stat),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    enum Node {
        Dir,
        File,
        Link(&'static str),
    }

    struct FakeFs(HashMap<PathBuf, Node>);

    impl FakeFs {
        fn new(entries: &[(&str, Node)]) -> Self {
            let mut map: HashMap<PathBuf, Node> = HashMap::new();
            map.insert("/".into(), Node::Dir);
            for (p, n) in entries {
                let n = match n {
                    Node::Dir => Node::Dir,
                    Node::File => Node::File,
                    Node::Link(t) => Node::Link(*t),
                };
                map.insert(PathBuf::from(p), n);
            }
            Self(map)
        }
    }

    impl Lookup for FakeFs {
        fn lstat(&mut self, path: &Path) -> Result<FileStat, Errno> {
            match self.0.get(path) {
                Some(Node::Dir) => Ok(FileStat::directory(0o755)),
                Some(Node::File) => Ok(FileStat::regular(3, 0o644)),
                Some(Node::Link(t)) => Ok(FileStat::symlink(t.len() as _)),
                None => Err(Errno::ENOENT),
            }
        }

        fn readlink(&mut self, path: &Path) -> Result<PathBuf, Errno> {
            match self.0.get(path) {
                Some(Node::Link(t)) => Ok(PathBuf::from(t)),
                _ => Err(Errno::EINVAL),
            }
        }
    }

    fn fs() -> FakeFs {
        FakeFs::new(&[
            ("/home", Node::Dir),
            ("/home/u", Node::Dir),
            ("/home/u/f.txt", Node::File),
            ("/home/u/rel", Node::Link("f.txt")),
            ("/home/u/abs", Node::Link("/home")),
            ("/home/u/loop", Node::Link("loop")),
            ("/jail", Node::Dir),
            ("/jail/etc", Node::Dir),
            ("/jail/lnk", Node::Link("/etc")),
        ])
    }

    fn resolve(raw: &str, follow: bool) -> Result<Resolved, Errno> {
        canonicalize(Path::new(raw), Path::new("/home/u"), Path::new("/"), follow, &mut fs())
    }

    #[test]
    fn test_relative_and_dots() {
        let r = resolve("./../u/f.txt", true).unwrap();
        assert_eq!(r.path, PathBuf::from("/home/u/f.txt"));
        assert!(r.stat.unwrap().file_type() == nix::sys::stat::SFlag::S_IFREG);

        let r = resolve("/../../home", true).unwrap();
        assert_eq!(r.path, PathBuf::from("/home"));
    }

    #[test]
    fn test_symlinks() {
        assert_eq!(
            resolve("rel", true).unwrap().path,
            PathBuf::from("/home/u/f.txt")
        );

        // not following the last component keeps the link itself
        let r = resolve("rel", false).unwrap();
        assert_eq!(r.path, PathBuf::from("/home/u/rel"));
        assert!(r.stat.unwrap().is_symlink());

        assert_eq!(
            resolve("abs/u", true).unwrap().path,
            PathBuf::from("/home/u")
        );
        assert_eq!(resolve("loop", true), Err(Errno::ELOOP));
    }

    #[test]
    fn test_missing_components() {
        let r = resolve("new.txt", true).unwrap();
        assert_eq!(r.path, PathBuf::from("/home/u/new.txt"));
        assert_eq!(r.stat, None);

        assert_eq!(resolve("missing/new.txt", true), Err(Errno::ENOENT));
        assert_eq!(resolve("f.txt/x", true), Err(Errno::ENOTDIR));
        assert_eq!(resolve("f.txt/", true), Err(Errno::ENOTDIR));
        assert_eq!(resolve("", true), Err(Errno::ENOENT));
    }

    #[test]
    fn test_root_confines_absolute_links() {
        let r = canonicalize(
            Path::new("/lnk"),
            Path::new("/jail"),
            Path::new("/jail"),
            true,
            &mut fs(),
        )
        .unwrap();
        assert_eq!(r.path, PathBuf::from("/jail/etc"));

        let r = canonicalize(
            Path::new("../../.."),
            Path::new("/jail"),
            Path::new("/jail"),
            true,
            &mut fs(),
        )
        .unwrap();
        assert_eq!(r.path, PathBuf::from("/jail"));
    }

    #[test]
    fn test_idempotent() {
        let a = resolve("abs/u/rel", true).unwrap();
        let b = resolve("abs/u/rel", true).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.path, PathBuf::from("/home/u/f.txt"));
    }
}
