use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use fsmonitor_filewatch::{WatchRoots, DOT_GIT};
use thiserror::Error;
use tracing::debug;

use crate::{config::CONFIG_FILE_NAME, endpoint::SOCKET_NAME};

pub const TOKEN_FILE_NAME: &str = "fsmonitor--daemon.token";
pub const LOG_FILE_NAME: &str = "fsmonitor--daemon.log";

const GITDIR_PREFIX: &str = "gitdir:";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not a git repository (or any of the parent directories): {0}")]
    NotARepository(Utf8PathBuf),
    #[error("invalid gitfile format: {0}")]
    InvalidGitFile(Utf8PathBuf),
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8(PathBuf),
    #[error("unable to resolve {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the daemon lives for a given working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPaths {
    worktree: Utf8PathBuf,
    metadata_dir: Utf8PathBuf,
}

impl RepoPaths {
    /// Walks up from `cwd` to the first directory with a `.git` entry.
    ///
    /// A `.git` directory is the metadata directory. A `.git` file must
    /// hold a `gitdir: <path>` line pointing at it instead.
    pub fn discover(cwd: &Utf8Path) -> Result<Self, RepoError> {
        let cwd = canonicalize(cwd)?;
        let worktree = find_worktree(&cwd).ok_or_else(|| RepoError::NotARepository(cwd.clone()))?;
        let dot_git = worktree.join(DOT_GIT);
        let metadata_dir = if dot_git.is_dir() {
            dot_git
        } else {
            canonicalize(&read_gitfile(&worktree, &dot_git)?)?
        };
        debug!("discovered worktree {} with metadata {}", worktree, metadata_dir);
        Ok(Self {
            worktree,
            metadata_dir,
        })
    }

    /// Uses an explicit metadata directory. The worktree is still discovered
    /// from `cwd`, falling back to `cwd` itself.
    pub fn with_metadata_dir(cwd: &Utf8Path, metadata_dir: &Utf8Path) -> Result<Self, RepoError> {
        let cwd = canonicalize(cwd)?;
        let worktree = find_worktree(&cwd).unwrap_or(cwd);
        let metadata_dir = if metadata_dir.is_absolute() {
            canonicalize(metadata_dir)?
        } else {
            canonicalize(&worktree.join(metadata_dir))?
        };
        Ok(Self {
            worktree,
            metadata_dir,
        })
    }

    pub fn worktree(&self) -> &Utf8Path {
        &self.worktree
    }

    pub fn metadata_dir(&self) -> &Utf8Path {
        &self.metadata_dir
    }

    pub fn watch_roots(&self) -> WatchRoots {
        WatchRoots::new(self.worktree.clone(), self.metadata_dir.clone())
    }

    pub fn socket_path(&self) -> Utf8PathBuf {
        self.metadata_dir.join(SOCKET_NAME)
    }

    pub fn token_file(&self) -> Utf8PathBuf {
        self.metadata_dir.join(TOKEN_FILE_NAME)
    }

    pub fn log_file(&self) -> Utf8PathBuf {
        self.metadata_dir.join(LOG_FILE_NAME)
    }

    pub fn config_file(&self) -> Utf8PathBuf {
        self.metadata_dir.join(CONFIG_FILE_NAME)
    }
}

fn find_worktree(start: &Utf8Path) -> Option<Utf8PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(DOT_GIT).exists())
        .map(Utf8Path::to_owned)
}

fn read_gitfile(worktree: &Utf8Path, dot_git: &Utf8Path) -> Result<Utf8PathBuf, RepoError> {
    let contents = std::fs::read_to_string(dot_git).map_err(|source| RepoError::Io {
        path: dot_git.to_owned(),
        source,
    })?;
    let target = contents
        .lines()
        .next()
        .and_then(|line| line.strip_prefix(GITDIR_PREFIX))
        .map(str::trim)
        .filter(|target| !target.is_empty())
        .ok_or_else(|| RepoError::InvalidGitFile(dot_git.to_owned()))?;
    let target = Utf8Path::new(target);
    Ok(if target.is_absolute() {
        target.to_owned()
    } else {
        worktree.join(target)
    })
}

fn canonicalize(path: &Utf8Path) -> Result<Utf8PathBuf, RepoError> {
    let real = dunce::canonicalize(path).map_err(|source| RepoError::Io {
        path: path.to_owned(),
        source,
    })?;
    utf8(real)
}

fn utf8(path: PathBuf) -> Result<Utf8PathBuf, RepoError> {
    Utf8PathBuf::from_path_buf(path).map_err(RepoError::NonUtf8)
}

/// The current directory as a UTF-8 path.
pub fn current_dir() -> Result<Utf8PathBuf, RepoError> {
    let cwd = std::env::current_dir().map_err(|source| RepoError::Io {
        path: Utf8PathBuf::from("."),
        source,
    })?;
    utf8(cwd)
}
