//! Workspace roots for `git tree` repositories: a tree known by id,
//! produced by a generic command when not already cached.

use std::{
    hash::{Hash, Hasher},
    path::PathBuf,
};

use crate::{
    consumer::AsyncMapConsumer,
    ops_maps::git_tree_fetch::{GitTreeFetchMap, GitTreeInfo},
    root_maps::git_tree_root,
};

/// Key of one tree-id root.
#[derive(Clone, Debug)]
pub struct TreeIdInfo {
    pub tree_info: GitTreeInfo,
    pub ignore_special: bool,
    pub absent: bool,
}

impl PartialEq for TreeIdInfo {
    fn eq(&self, other: &Self) -> bool {
        self.tree_info == other.tree_info
            && self.ignore_special == other.ignore_special
            && self.absent == other.absent
    }
}

impl Eq for TreeIdInfo {}

impl Hash for TreeIdInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tree_info.hash(state);
        self.ignore_special.hash(state);
        self.absent.hash(state);
    }
}

/// Resolves to `(workspace_root, cache_hit)`.
pub type TreeIdGitMap = AsyncMapConsumer<TreeIdInfo, (serde_json::Value, bool)>;

pub fn create_tree_id_git_map(
    git_tree_fetch_map: GitTreeFetchMap,
    git_cache_root: PathBuf,
) -> TreeIdGitMap {
    AsyncMapConsumer::new(move |pool, setter, logger, _subcaller, key: &TreeIdInfo| {
        // if the root is absent, no work needs to be done
        if key.absent {
            let root = git_tree_root(&key.tree_info.hash, key.ignore_special, None);
            setter.set((root, false));
            return;
        }
        // make sure the required tree is in the Git cache
        let key = key.clone();
        let git_cache_root = git_cache_root.clone();
        git_tree_fetch_map.consume_after_keys_ready(
            pool,
            vec![key.tree_info.clone()],
            move |values| {
                let is_cache_hit = *values[0];
                let root =
                    git_tree_root(&key.tree_info.hash, key.ignore_special, Some(&git_cache_root));
                setter.set((root, is_cache_hit));
            },
            logger,
        );
    })
}
