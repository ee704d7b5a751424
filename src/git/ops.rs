//! Critical Git operations: mutations (and sensitive reads) of a cache
//! repository that must not race with other operations on the same
//! directory. The critical-op map serializes them per path; this module
//! only defines the operations themselves.

use std::{
    hash::{Hash, Hasher},
    path::PathBuf,
};

use crate::{consumer::Logger, git::repo::GitCache};

/// Kinds of critical operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GitOpType {
    /// Initialize an empty bare repository if absent. Idempotent.
    EnsureInit,
    /// Create a root commit from a prepared tree; returns the commit id.
    InitialCommit,
    /// Write a tag keeping a commit reachable, anchoring it against GC.
    KeepTag,
    /// Read HEAD of the repository.
    GetHeadId,
    /// Resolve a local branch to its full refname.
    GetBranchRefname,
}

/// Parameters of one critical operation.
///
/// Identity (equality, hashing) covers `target_path` and `git_hash` only;
/// `branch` and `message` ride along without being part of the key.
#[derive(Clone, Debug)]
pub struct GitOpParams {
    pub target_path: PathBuf,
    pub git_hash: String,
    pub branch: Option<String>,
    pub message: Option<String>,
}

impl GitOpParams {
    pub fn new(target_path: impl Into<PathBuf>, git_hash: impl Into<String>) -> Self {
        GitOpParams {
            target_path: target_path.into(),
            git_hash: git_hash.into(),
            branch: None,
            message: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl PartialEq for GitOpParams {
    fn eq(&self, other: &Self) -> bool {
        self.target_path == other.target_path && self.git_hash == other.git_hash
    }
}

impl Eq for GitOpParams {}

impl Hash for GitOpParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.target_path.hash(state);
        self.git_hash.hash(state);
    }
}

/// Key of the critical-op map.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GitOpKey {
    pub params: GitOpParams,
    pub op_type: GitOpType,
}

/// Result of a critical operation. `ok = false` means the operation itself
/// failed; downstream code distinguishes that from a map-level error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitOpValue {
    pub result: Option<String>,
    pub ok: bool,
}

impl GitOpValue {
    fn failed() -> Self {
        GitOpValue { result: None, ok: false }
    }

    fn succeeded(result: Option<String>) -> Self {
        GitOpValue { result, ok: true }
    }
}

impl GitOpKey {
    /// Run the operation. Failures are reported through `logger` as
    /// non-fatal messages and yield `ok = false`; the caller decides how
    /// hard to fail.
    pub fn operation(&self, git_bin: &str, logger: &Logger) -> GitOpValue {
        match self.run(git_bin) {
            Ok(value) => value,
            Err(err) => {
                logger(&format!("Git op on {:?}: {err}", self.params.target_path), false);
                GitOpValue::failed()
            }
        }
    }

    fn run(&self, git_bin: &str) -> Result<GitOpValue, crate::errors::SetupError> {
        match self.op_type {
            GitOpType::EnsureInit => {
                GitCache::open_or_init(&self.params.target_path)?;
                Ok(GitOpValue::succeeded(None))
            }
            GitOpType::InitialCommit => {
                let cache = GitCache::open_or_init(&self.params.target_path)?;
                let tree_id = self.params.git_hash.parse()?;
                let message = self
                    .params
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Content of tree {}", self.params.git_hash));
                let commit = cache.commit_tree(&tree_id, &message)?;
                Ok(GitOpValue::succeeded(Some(commit.hex())))
            }
            GitOpType::KeepTag => {
                let cache = GitCache::open_or_init(&self.params.target_path)?;
                if let Ok(id) = self.params.git_hash.parse() {
                    if cache.contains_object(&id) {
                        cache.keep_tag(&id)?;
                        return Ok(GitOpValue::succeeded(None));
                    }
                }
                // The commit may only exist packed after a fetch.
                cache.keep_tag_cli(git_bin, &self.params.git_hash)?;
                Ok(GitOpValue::succeeded(None))
            }
            GitOpType::GetHeadId => {
                let cache = GitCache::open_or_init(&self.params.target_path)?;
                match cache.head_id()? {
                    Some(id) => Ok(GitOpValue::succeeded(Some(id.hex()))),
                    None => Ok(GitOpValue::failed()),
                }
            }
            GitOpType::GetBranchRefname => {
                let cache = GitCache::open_or_init(&self.params.target_path)?;
                let branch = self.params.branch.as_deref().unwrap_or("master");
                match cache.branch_refname(branch)? {
                    Some(refname) => Ok(GitOpValue::succeeded(Some(refname))),
                    None => Ok(GitOpValue::failed()),
                }
            }
        }
    }
}
