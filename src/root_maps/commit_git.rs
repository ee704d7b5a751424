//! Workspace roots for `git` repositories pinned to a commit.
//!
//! The cache repository is initialized through the critical-op map, then
//! the commit is looked up locally; a hit avoids all network traffic.
//! Otherwise the commit is fetched from the upstream URL (then the
//! mirrors) with the `git` binary, anchored with a keep tag, and the
//! `subdir` tree becomes the workspace root. Absent roots fall back to a
//! serve-endpoint attestation before fetching.

use std::{
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::Arc,
};

use crate::{
    consumer::AsyncMapConsumer,
    git::{
        ops::{GitOpKey, GitOpParams, GitOpType},
        repo::GitCache,
    },
    ops_maps::critical_git_op::CriticalGitOpMap,
    root_maps::git_tree_root,
    serve::ServeApi,
};

/// Key of one commit-pinned root. Identity is the commit hash, the subdir
/// and the root-shaping flags; URL, branch and mirrors are fetch hints.
#[derive(Clone, Debug)]
pub struct GitRepoInfo {
    /// Commit hash to make available.
    pub hash: String,
    pub repo_url: String,
    pub branch: String,
    pub subdir: String,
    pub mirrors: Vec<String>,
    pub inherit_env: Vec<String>,
    /// Repository this work is done for; used in diagnostics.
    pub origin: String,
    pub ignore_special: bool,
    pub absent: bool,
}

impl PartialEq for GitRepoInfo {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.subdir == other.subdir
            && self.ignore_special == other.ignore_special
            && self.absent == other.absent
    }
}

impl Eq for GitRepoInfo {}

impl Hash for GitRepoInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.subdir.hash(state);
        self.ignore_special.hash(state);
        self.absent.hash(state);
    }
}

pub struct CommitGitContext {
    pub critical_git_op_map: CriticalGitOpMap,
    pub git_cache_root: PathBuf,
    pub git_bin: String,
    pub serve: Option<Arc<dyn ServeApi>>,
}

/// Resolves to `(workspace_root, cache_hit)`.
pub type CommitGitMap = AsyncMapConsumer<GitRepoInfo, (serde_json::Value, bool)>;

fn emit_commit_root(
    context: &CommitGitContext,
    key: &GitRepoInfo,
    cache: &GitCache,
    cache_hit: bool,
) -> Result<(serde_json::Value, bool), String> {
    let tree = cache
        .commit_subtree(&context.git_bin, &key.hash, &key.subdir)
        .map_err(|e| e.to_string())?;
    let cache_path = (!key.absent).then_some(context.git_cache_root.as_path());
    Ok((git_tree_root(&tree, key.ignore_special, cache_path), cache_hit))
}

pub fn create_commit_git_map(context: Arc<CommitGitContext>) -> CommitGitMap {
    AsyncMapConsumer::new(move |pool, setter, logger, _subcaller, key: &GitRepoInfo| {
        let init_key = GitOpKey {
            params: GitOpParams::new(&context.git_cache_root, ""),
            op_type: GitOpType::EnsureInit,
        };
        let context = context.clone();
        let key = key.clone();
        let pool = pool.clone();
        let ensure_logger = logger.clone();
        let critical_map = context.critical_git_op_map.clone();
        critical_map.clone().consume_after_keys_ready(
            &pool.clone(),
            vec![init_key],
            move |values| {
                if !values[0].ok {
                    ensure_logger(
                        &format!("Could not initialize Git cache at {:?}", context.git_cache_root),
                        true,
                    );
                    return;
                }
                let cache = match GitCache::open_or_init(&context.git_cache_root) {
                    Ok(cache) => cache,
                    Err(err) => {
                        ensure_logger(&err.to_string(), true);
                        return;
                    }
                };
                // commit already known: no network needed
                if cache.object_exists(&context.git_bin, &key.hash) {
                    match emit_commit_root(&context, &key, &cache, true) {
                        Ok(result) => setter.set(result),
                        Err(msg) => ensure_logger(&msg, true),
                    }
                    return;
                }
                // absent root: a serve-endpoint attestation suffices
                if key.absent {
                    if let Some(serve) = &context.serve {
                        if let Some(tree) = serve.commit_tree_id(&key.hash, &key.subdir) {
                            setter.set((git_tree_root(&tree, key.ignore_special, None), false));
                            return;
                        }
                    }
                }
                // fetch from upstream, then the mirrors
                let mut fetched = false;
                for url in std::iter::once(&key.repo_url).chain(key.mirrors.iter()) {
                    match cache.fetch(&context.git_bin, url, Some(&key.branch), &key.inherit_env) {
                        Ok(()) if cache.object_exists(&context.git_bin, &key.hash) => {
                            fetched = true;
                            break;
                        }
                        Ok(()) => {
                            ensure_logger(
                                &format!(
                                    "Fetched branch {:?} of {url}, commit {} still unknown",
                                    key.branch, key.hash
                                ),
                                false,
                            );
                        }
                        Err(err) => ensure_logger(&err.to_string(), false),
                    }
                }
                if !fetched {
                    ensure_logger(
                        &format!(
                            "While setting up commit {} for {:?}: commit not found in any source",
                            key.hash, key.origin
                        ),
                        true,
                    );
                    return;
                }
                // anchor the fetched commit, then emit the root
                let keep_key = GitOpKey {
                    params: GitOpParams::new(&context.git_cache_root, key.hash.clone()),
                    op_type: GitOpType::KeepTag,
                };
                let emit_logger = ensure_logger.clone();
                let emit_context = context.clone();
                critical_map.consume_after_keys_ready(
                    &pool,
                    vec![keep_key],
                    move |values| {
                        if !values[0].ok {
                            emit_logger("Keep tag could not be written", true);
                            return;
                        }
                        let cache = match GitCache::open_or_init(&emit_context.git_cache_root) {
                            Ok(cache) => cache,
                            Err(err) => {
                                emit_logger(&err.to_string(), true);
                                return;
                            }
                        };
                        match emit_commit_root(&emit_context, &key, &cache, false) {
                            Ok(result) => setter.set(result),
                            Err(msg) => emit_logger(&msg, true),
                        }
                    },
                    ensure_logger.clone(),
                );
            },
            logger,
        );
    })
}
