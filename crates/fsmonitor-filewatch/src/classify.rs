use std::borrow::Cow;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Name of the metadata directory inside a working tree.
pub const DOT_GIT: &str = ".git";

/// Reserved file name prefix for cookie files inside the metadata directory.
pub const COOKIE_PREFIX: &str = ".fsmonitor-daemon-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// Not under any watched root.
    OutsideCone,
    /// An ordinary path inside the working tree, including the root itself.
    WorkdirPath,
    /// The metadata directory itself (or the `.git` entry of the working
    /// tree).
    MetadataDir,
    InsideMetadataDir,
    /// A cookie file inside the metadata directory.
    InsideMetadataDirCookie,
    /// A cookie-named entry below `<worktree>/.git` when the real metadata
    /// directory lives elsewhere.
    InsideWorkdirDotGitCookie,
    /// Anything else below `<worktree>/.git` when the real metadata
    /// directory lives elsewhere.
    InsideWorkdirDotGitOther,
}

/// The one or two directory trees the daemon watches.
///
/// The working tree is always watched. The metadata directory only gets a
/// watch of its own when it lives outside the working tree, e.g. for linked
/// worktrees and separate git dirs. A metadata directory nested in the
/// working tree, `.git` or otherwise, is covered by the worktree watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRoots {
    worktree: Utf8PathBuf,
    metadata_dir: Utf8PathBuf,
    /// The metadata directory relative to the working tree, when nested.
    nested_metadata: Option<Utf8PathBuf>,
}

impl WatchRoots {
    /// Both paths must be absolute and canonical.
    pub fn new(worktree: Utf8PathBuf, metadata_dir: Utf8PathBuf) -> Self {
        let nested_metadata = metadata_dir
            .strip_prefix(&worktree)
            .ok()
            .filter(|rel| rel.components().any(|c| normal_name(c).is_some()))
            .map(Utf8Path::to_owned);
        Self {
            worktree,
            metadata_dir,
            nested_metadata,
        }
    }

    pub fn worktree(&self) -> &Utf8Path {
        &self.worktree
    }

    pub fn metadata_dir(&self) -> &Utf8Path {
        &self.metadata_dir
    }

    pub fn has_separate_metadata(&self) -> bool {
        self.nested_metadata.is_none()
    }

    /// The directories that need a recursive watch.
    pub fn watch_paths(&self) -> Vec<&Utf8Path> {
        if self.has_separate_metadata() {
            vec![&self.worktree, &self.metadata_dir]
        } else {
            vec![&self.worktree]
        }
    }

    /// The path relative to the working tree root, if it is inside it.
    pub fn worktree_relative<'a>(&self, path: &'a Utf8Path) -> Option<&'a Utf8Path> {
        path.strip_prefix(&self.worktree).ok()
    }

    /// Classifies an absolute path. Pure, and cheap enough to run for every
    /// event the backend reports.
    pub fn classify(&self, path: &Utf8Path) -> PathKind {
        let kind = self.classify_in_worktree(path);
        if !self.has_separate_metadata() || kind != PathKind::OutsideCone {
            return kind;
        }

        match path.strip_prefix(&self.metadata_dir) {
            Err(_) => PathKind::OutsideCone,
            Ok(rel) => classify_in_metadata(rel),
        }
    }

    fn classify_in_worktree(&self, path: &Utf8Path) -> PathKind {
        let Ok(rel) = path.strip_prefix(&self.worktree) else {
            return PathKind::OutsideCone;
        };
        if let Some(inner) = self
            .nested_metadata
            .as_deref()
            .and_then(|metadata| strip_names(rel, metadata))
        {
            return classify_in_metadata(inner);
        }

        // a `.git` that is not the metadata directory: a gitlink file, or a
        // directory git does not use for this worktree
        let mut names = rel.components().filter_map(normal_name);
        match names.next() {
            None => PathKind::WorkdirPath,
            Some(first) if !names_eq(first, DOT_GIT) => PathKind::WorkdirPath,
            Some(_) => match names.next() {
                None => PathKind::MetadataDir,
                Some(name) if is_cookie_name(name) => PathKind::InsideWorkdirDotGitCookie,
                Some(_) => PathKind::InsideWorkdirDotGitOther,
            },
        }
    }
}

fn classify_in_metadata(rel: &Utf8Path) -> PathKind {
    match first_name(rel) {
        None => PathKind::MetadataDir,
        Some(name) if is_cookie_name(name) => PathKind::InsideMetadataDirCookie,
        Some(_) => PathKind::InsideMetadataDir,
    }
}

/// Strips `prefix` from `path` name by name, honouring the platform's case
/// sensitivity.
fn strip_names<'a>(path: &'a Utf8Path, prefix: &Utf8Path) -> Option<&'a Utf8Path> {
    let mut rest = path.components();
    for expected in prefix.components().filter_map(normal_name) {
        let found = rest.by_ref().find_map(normal_name)?;
        if !names_eq(found, expected) {
            return None;
        }
    }
    Some(rest.as_path())
}

/// Renders a worktree-relative path the way clients expect it on the wire:
/// forward slashes on every platform.
pub fn wire_path(rel: &Utf8Path) -> Cow<'_, str> {
    if cfg!(windows) {
        Cow::Owned(rel.as_str().replace('\\', "/"))
    } else {
        Cow::Borrowed(rel.as_str())
    }
}

fn normal_name(component: Utf8Component<'_>) -> Option<&str> {
    match component {
        Utf8Component::Normal(name) => Some(name),
        _ => None,
    }
}

fn first_name(rel: &Utf8Path) -> Option<&str> {
    rel.components().find_map(normal_name)
}

fn is_cookie_name(name: &str) -> bool {
    name.len() >= COOKIE_PREFIX.len()
        && name.is_char_boundary(COOKIE_PREFIX.len())
        && names_eq(&name[..COOKIE_PREFIX.len()], COOKIE_PREFIX)
}

// macOS and Windows filesystems are case-insensitive by default.
#[cfg(any(target_os = "macos", windows))]
fn names_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(not(any(target_os = "macos", windows)))]
fn names_eq(a: &str, b: &str) -> bool {
    a == b
}

#[cfg(all(test, unix))]
mod test {
    use camino::Utf8Path;
    use test_case::test_case;

    use super::{PathKind, WatchRoots};

    fn single_root() -> WatchRoots {
        WatchRoots::new("/repo".into(), "/repo/.git".into())
    }

    fn two_roots() -> WatchRoots {
        WatchRoots::new("/repo".into(), "/gitdirs/repo".into())
    }

    #[test_case("/repo", PathKind::WorkdirPath ; "root itself")]
    #[test_case("/repo/src/main.c", PathKind::WorkdirPath ; "plain file")]
    #[test_case("/repo/.gitignore", PathKind::WorkdirPath ; "dot git prefix only")]
    #[test_case("/repo/sub/.git/HEAD", PathKind::WorkdirPath ; "nested repo")]
    #[test_case("/repo/.git", PathKind::MetadataDir ; "metadata dir")]
    #[test_case("/repo/.git/HEAD", PathKind::InsideMetadataDir ; "inside metadata")]
    #[test_case("/repo/.git/refs/heads/main", PathKind::InsideMetadataDir ; "deep inside metadata")]
    #[test_case("/repo/.git/.fsmonitor-daemon-abc", PathKind::InsideMetadataDirCookie ; "cookie")]
    #[test_case("/repo/.git/refs/.fsmonitor-daemon-abc", PathKind::InsideMetadataDir ; "cookie name not at top")]
    #[test_case("/other/file", PathKind::OutsideCone ; "outside")]
    #[test_case("/repository/file", PathKind::OutsideCone ; "sibling sharing a prefix")]
    #[test_case("/", PathKind::OutsideCone ; "filesystem root")]
    fn test_single_root(path: &str, expected: PathKind) {
        assert_eq!(single_root().classify(Utf8Path::new(path)), expected);
    }

    #[test_case("/repo/src/main.c", PathKind::WorkdirPath ; "plain file")]
    #[test_case("/repo/.git", PathKind::MetadataDir ; "gitlink file")]
    #[test_case("/repo/.git/.fsmonitor-daemon-1", PathKind::InsideWorkdirDotGitCookie ; "workdir dot git cookie")]
    #[test_case("/repo/.git/config", PathKind::InsideWorkdirDotGitOther ; "workdir dot git other")]
    #[test_case("/gitdirs/repo", PathKind::MetadataDir ; "metadata root")]
    #[test_case("/gitdirs/repo/index", PathKind::InsideMetadataDir ; "inside metadata root")]
    #[test_case("/gitdirs/repo/.fsmonitor-daemon-1-2", PathKind::InsideMetadataDirCookie ; "metadata cookie")]
    #[test_case("/gitdirs/other/index", PathKind::OutsideCone ; "other metadata dir")]
    #[test_case("/elsewhere", PathKind::OutsideCone ; "outside both")]
    fn test_two_roots(path: &str, expected: PathKind) {
        assert_eq!(two_roots().classify(Utf8Path::new(path)), expected);
    }

    #[test_case("/repo/meta", PathKind::MetadataDir ; "metadata dir")]
    #[test_case("/repo/meta/HEAD", PathKind::InsideMetadataDir ; "inside metadata")]
    #[test_case("/repo/meta/.fsmonitor-daemon-1-0", PathKind::InsideMetadataDirCookie ; "cookie")]
    #[test_case("/repo/meta/fsmonitor--daemon.log", PathKind::InsideMetadataDir ; "daemon log")]
    #[test_case("/repo/metadata/x", PathKind::WorkdirPath ; "sibling sharing a prefix")]
    #[test_case("/repo/src/main.c", PathKind::WorkdirPath ; "plain file")]
    #[test_case("/repo/.git", PathKind::MetadataDir ; "unused dot git")]
    #[test_case("/repo/.git/config", PathKind::InsideWorkdirDotGitOther ; "inside unused dot git")]
    fn test_nested_metadata_dir(path: &str, expected: PathKind) {
        let roots = WatchRoots::new("/repo".into(), "/repo/meta".into());
        assert_eq!(roots.classify(Utf8Path::new(path)), expected);
    }

    #[test_case("/repo/tools/git", PathKind::MetadataDir ; "metadata dir")]
    #[test_case("/repo/tools/git/.fsmonitor-daemon-1-0", PathKind::InsideMetadataDirCookie ; "cookie")]
    #[test_case("/repo/tools/git/objects/ab", PathKind::InsideMetadataDir ; "deep inside")]
    #[test_case("/repo/tools", PathKind::WorkdirPath ; "parent of metadata")]
    #[test_case("/repo/tools/build.sh", PathKind::WorkdirPath ; "next to metadata")]
    fn test_deeply_nested_metadata_dir(path: &str, expected: PathKind) {
        let roots = WatchRoots::new("/repo".into(), "/repo/tools/git".into());
        assert_eq!(roots.classify(Utf8Path::new(path)), expected);
    }

    #[test]
    fn test_watch_paths() {
        assert_eq!(single_root().watch_paths(), vec![Utf8Path::new("/repo")]);
        assert_eq!(
            two_roots().watch_paths(),
            vec![Utf8Path::new("/repo"), Utf8Path::new("/gitdirs/repo")]
        );
        let nested = WatchRoots::new("/repo".into(), "/repo/meta".into());
        assert!(!nested.has_separate_metadata());
        assert_eq!(nested.watch_paths(), vec![Utf8Path::new("/repo")]);
    }

    #[test]
    fn test_every_path_outside_both_roots_is_outside_cone() {
        let roots = two_roots();
        for path in ["/", "/re", "/repo2/x", "/gitdirs", "/gitdirs/repo2", "/tmp/repo/.git"] {
            assert_eq!(roots.classify(Utf8Path::new(path)), PathKind::OutsideCone);
        }
    }
}
