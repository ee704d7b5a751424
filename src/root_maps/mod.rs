//! Maps producing workspace roots, one per repository checkout family.
//!
//! Every map resolves to a tagged JSON array describing where a build can
//! find the repository's sources: a git tree in the cache, a plain
//! filesystem path, or a marker deferring to another repository. Present
//! git-tree roots carry the cache path as a third element; absent roots
//! are known by tree hash alone.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::{Value, json};

use crate::{
    consumer::Logger,
    git::ops::{GitOpKey, GitOpParams, GitOpType},
    ops_maps::critical_git_op::CriticalGitOpMap,
    pool::TaskPool,
};

pub mod commit_git;
pub mod content_git;
pub mod distdir_git;
pub mod foreign_file_git;
pub mod fpath_git;
pub mod tree_id_git;

/// Workspace-root tag literals.
pub const GIT_TREE_MARKER: &str = "git tree";
pub const GIT_TREE_IGNORE_SPECIAL_MARKER: &str = "git tree ignore-special";
pub const FILE_MARKER: &str = "file";
pub const FILE_IGNORE_SPECIAL_MARKER: &str = "file ignore-special";
pub const COMPUTED_MARKER: &str = "computed";
pub const TREE_STRUCTURE_MARKER: &str = "tree structure";

/// Assemble a git-tree workspace root. Present roots (`cache_path` given)
/// carry the location of the git cache; absent roots are hash-only.
pub fn git_tree_root(tree_hex: &str, ignore_special: bool, cache_path: Option<&Path>) -> Value {
    let marker = if ignore_special {
        GIT_TREE_IGNORE_SPECIAL_MARKER
    } else {
        GIT_TREE_MARKER
    };
    match cache_path {
        Some(path) => json!([marker, tree_hex, path.to_string_lossy()]),
        None => json!([marker, tree_hex]),
    }
}

/// Durable association of a content id with the git tree it imported to,
/// kept next to the stores so later runs (and concurrent roots sharing an
/// archive) skip re-extraction.
pub struct TreeIdMappings {
    root: PathBuf,
}

impl TreeIdMappings {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, crate::errors::SetupError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(TreeIdMappings { root })
    }

    fn entry_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(format!("{kind}-{id}"))
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<String> {
        let tree = fs::read_to_string(self.entry_path(kind, id)).ok()?;
        let tree = tree.trim();
        (!tree.is_empty()).then(|| tree.to_string())
    }

    pub fn set(&self, kind: &str, id: &str, tree_hex: &str) {
        if let Err(err) = fs::write(self.entry_path(kind, id), format!("{tree_hex}\n")) {
            tracing::warn!("could not record tree mapping {kind}-{id}: {err}");
        }
    }
}

/// Anchor a tree in the cache: initial commit, then keep tag, both
/// serialized through the critical-op map; `done` runs afterwards.
pub(crate) fn anchor_tree<F>(
    critical_git_op_map: &CriticalGitOpMap,
    pool: &Arc<TaskPool>,
    cache_root: &Path,
    tree_hex: String,
    message: String,
    logger: Logger,
    done: F,
) where
    F: FnOnce() + Send + 'static,
{
    let commit_key = GitOpKey {
        params: GitOpParams::new(cache_root, tree_hex.clone()).with_message(message),
        op_type: GitOpType::InitialCommit,
    };
    let cache_root = cache_root.to_path_buf();
    let tag_map = critical_git_op_map.clone();
    let tag_pool = pool.clone();
    let tag_logger = logger.clone();
    critical_git_op_map.consume_after_keys_ready(
        pool,
        vec![commit_key],
        move |values| {
            let Some(commit) = values[0].result.clone().filter(|_| values[0].ok) else {
                tag_logger(&format!("Initial commit for tree {tree_hex} failed"), true);
                return;
            };
            let keep_key = GitOpKey {
                params: GitOpParams::new(&cache_root, commit),
                op_type: GitOpType::KeepTag,
            };
            let done_logger = tag_logger.clone();
            tag_map.clone().consume_after_keys_ready(
                &tag_pool,
                vec![keep_key],
                move |values| {
                    if !values[0].ok {
                        done_logger("Keep tag could not be written", true);
                        return;
                    }
                    done();
                },
                tag_logger,
            );
        },
        logger,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_tree_root_forms() {
        let present = git_tree_root("abc", false, Some(Path::new("/cache/git")));
        assert_eq!(present, json!(["git tree", "abc", "/cache/git"]));
        let absent = git_tree_root("abc", true, None);
        assert_eq!(absent, json!(["git tree ignore-special", "abc"]));
    }

    #[test]
    fn test_tree_id_mappings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mappings = TreeIdMappings::open(dir.path().join("tree-map")).unwrap();
        assert_eq!(mappings.get("archive", "c1-none"), None);
        mappings.set("archive", "c1-none", "deadbeef");
        assert_eq!(mappings.get("archive", "c1-none").as_deref(), Some("deadbeef"));
    }
}
