//! Map importing a prepared directory into the Git cache.
//!
//! The import itself writes loose objects (idempotent, lock-free); the
//! surrounding repository mutations (init, anchoring commit, keep tag) are
//! chained through the critical-op map so they never race with other
//! operations on the cache path.

use std::{
    hash::{Hash, Hasher},
    path::PathBuf,
};

use crate::{
    consumer::AsyncMapConsumer,
    git::{
        ops::{GitOpKey, GitOpParams, GitOpType},
        repo::GitCache,
    },
    ops_maps::critical_git_op::CriticalGitOpMap,
};

/// Key describing one directory import. Identity is the content id plus
/// the flags that change the resulting tree; the directory path is payload
/// (two extractions of the same content are interchangeable).
#[derive(Clone, Debug)]
pub struct CommitInfo {
    pub dir: PathBuf,
    pub repo_type: String,
    pub content: String,
    pub ignore_special: bool,
}

impl PartialEq for CommitInfo {
    fn eq(&self, other: &Self) -> bool {
        self.content == other.content
            && self.repo_type == other.repo_type
            && self.ignore_special == other.ignore_special
    }
}

impl Eq for CommitInfo {}

impl Hash for CommitInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content.hash(state);
        self.repo_type.hash(state);
        self.ignore_special.hash(state);
    }
}

/// Resolves to the hex id of the imported tree.
pub type ImportToGitMap = AsyncMapConsumer<CommitInfo, String>;

pub fn create_import_to_git_map(
    critical_git_op_map: CriticalGitOpMap,
    git_cache_root: PathBuf,
) -> ImportToGitMap {
    AsyncMapConsumer::new(move |pool, setter, logger, _subcaller, key: &CommitInfo| {
        let init_key = GitOpKey {
            params: GitOpParams::new(&git_cache_root, ""),
            op_type: GitOpType::EnsureInit,
        };
        let key = key.clone();
        let git_cache_root = git_cache_root.clone();
        let critical_map = critical_git_op_map.clone();
        let pool = pool.clone();
        let op_logger = logger.clone();
        critical_git_op_map.consume_after_keys_ready(
            &pool.clone(),
            vec![init_key],
            move |values| {
                if !values[0].ok {
                    op_logger(
                        &format!("Could not initialize Git cache at {git_cache_root:?}"),
                        true,
                    );
                    return;
                }
                let cache = match GitCache::open_or_init(&git_cache_root) {
                    Ok(cache) => cache,
                    Err(err) => {
                        op_logger(&err.to_string(), true);
                        return;
                    }
                };
                let tree_id = match cache.import_directory(&key.dir, key.ignore_special) {
                    Ok(tree_id) => tree_id,
                    Err(err) => {
                        op_logger(
                            &format!(
                                "While importing {:?} ({} {}): {err}",
                                key.dir, key.repo_type, key.content
                            ),
                            true,
                        );
                        return;
                    }
                };
                // anchor the tree with a commit and a keep tag, serialized
                // on the cache path
                let commit_key = GitOpKey {
                    params: GitOpParams::new(&git_cache_root, tree_id.hex()).with_message(
                        format!("Content of {} {}", key.repo_type, key.content),
                    ),
                    op_type: GitOpType::InitialCommit,
                };
                let tag_logger = op_logger.clone();
                let tag_map = critical_map.clone();
                let tag_pool = pool.clone();
                let cache_root = git_cache_root.clone();
                critical_map.consume_after_keys_ready(
                    &pool,
                    vec![commit_key],
                    move |values| {
                        let Some(commit) = values[0].result.clone().filter(|_| values[0].ok)
                        else {
                            tag_logger(
                                &format!("Initial commit for tree {} failed", tree_id.hex()),
                                true,
                            );
                            return;
                        };
                        let keep_key = GitOpKey {
                            params: GitOpParams::new(&cache_root, commit),
                            op_type: GitOpType::KeepTag,
                        };
                        let done_logger = tag_logger.clone();
                        tag_map.consume_after_keys_ready(
                            &tag_pool.clone(),
                            vec![keep_key],
                            move |values| {
                                if !values[0].ok {
                                    done_logger("Keep tag could not be written", true);
                                    return;
                                }
                                setter.set(tree_id.hex());
                            },
                            tag_logger.clone(),
                        );
                    },
                    op_logger.clone(),
                );
            },
            logger,
        );
    })
}
