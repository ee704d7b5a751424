//! Workspace roots for `distdir` repositories: a synthesized directory of
//! distribution archives, one non-executable blob per distfile.
//!
//! The content id of a distdir is the git-blob hash of the canonical JSON
//! of its `{distfile: [content_hash, executable]}` mapping, so two
//! distdirs listing the same archives share one root.

use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::Arc,
};

use crate::{
    consumer::AsyncMapConsumer,
    git::{
        object::{TreeItem, TreeItemMode},
        repo::GitCache,
    },
    hash::compute_hash,
    ops_maps::{
        content_cas::{ArchiveContent, ContentCasMap},
        critical_git_op::CriticalGitOpMap,
    },
    root_maps::{TreeIdMappings, anchor_tree, git_tree_root},
    storage::cas::LocalCas,
};

/// Key of one distdir root. Identity is the content id plus absence.
#[derive(Clone, Debug)]
pub struct DistdirInfo {
    pub content_id: String,
    /// distfile name -> archive content hash
    pub content_list: BTreeMap<String, String>,
    pub repos_to_fetch: Vec<ArchiveContent>,
    /// Repository this work is done for; used in diagnostics.
    pub origin: String,
    pub absent: bool,
}

impl PartialEq for DistdirInfo {
    fn eq(&self, other: &Self) -> bool {
        self.content_id == other.content_id && self.absent == other.absent
    }
}

impl Eq for DistdirInfo {}

impl Hash for DistdirInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content_id.hash(state);
        self.absent.hash(state);
    }
}

/// Stable content id over the distfile mapping (canonical JSON of the
/// sorted `{name: [hash, executable]}` object, git-blob hashed).
pub fn distdir_content_id(content_for_id: &BTreeMap<String, (String, bool)>) -> String {
    let canonical =
        serde_json::to_string(content_for_id).expect("string map serialization cannot fail");
    compute_hash(canonical.as_bytes())
}

pub struct DistdirGitContext {
    pub content_cas_map: ContentCasMap,
    pub critical_git_op_map: CriticalGitOpMap,
    pub cas: Arc<LocalCas>,
    pub mappings: Arc<TreeIdMappings>,
    pub git_cache_root: PathBuf,
}

/// Resolves to `(workspace_root, cache_hit)`.
pub type DistdirGitMap = AsyncMapConsumer<DistdirInfo, (serde_json::Value, bool)>;

pub fn create_distdir_git_map(context: Arc<DistdirGitContext>) -> DistdirGitMap {
    AsyncMapConsumer::new(move |pool, setter, logger, _subcaller, key: &DistdirInfo| {
        let cache_path = (!key.absent).then(|| context.git_cache_root.clone());
        if let Some(tree_hex) = context.mappings.get("distdir", &key.content_id) {
            setter.set((git_tree_root(&tree_hex, false, cache_path.as_deref()), true));
            return;
        }
        let context = context.clone();
        let key = key.clone();
        let pool = pool.clone();
        let build_logger = logger.clone();
        // fan out: all archives of the distdir fetched in parallel
        context.content_cas_map.clone().consume_after_keys_ready(
            &pool.clone(),
            key.repos_to_fetch.clone(),
            move |_values| {
                let tree_hex = {
                    let cache = match GitCache::open_or_init(&context.git_cache_root) {
                        Ok(cache) => cache,
                        Err(err) => {
                            build_logger(&err.to_string(), true);
                            return;
                        }
                    };
                    let mut items = Vec::with_capacity(key.content_list.len());
                    for (distfile, content_hash) in &key.content_list {
                        let data = match context.cas.read(content_hash) {
                            Ok(data) => data,
                            Err(err) => {
                                build_logger(
                                    &format!("Missing distdir entry {distfile:?}: {err}"),
                                    true,
                                );
                                return;
                            }
                        };
                        match cache.put_blob(&data) {
                            Ok(blob) => items.push(TreeItem {
                                mode: TreeItemMode::Blob,
                                name: distfile.clone(),
                                id: blob,
                            }),
                            Err(err) => {
                                build_logger(&err.to_string(), true);
                                return;
                            }
                        }
                    }
                    match cache.put_tree(items) {
                        Ok(tree) => tree.hex(),
                        Err(err) => {
                            build_logger(&err.to_string(), true);
                            return;
                        }
                    }
                };
                let emit_context = context.clone();
                let emit_key = key.clone();
                let emit_tree = tree_hex.clone();
                anchor_tree(
                    &context.critical_git_op_map,
                    &pool,
                    &context.git_cache_root,
                    tree_hex,
                    format!("Distdir {}", key.content_id),
                    build_logger.clone(),
                    move || {
                        emit_context
                            .mappings
                            .set("distdir", &emit_key.content_id, &emit_tree);
                        let cache_path =
                            (!emit_key.absent).then(|| emit_context.git_cache_root.clone());
                        setter.set((
                            git_tree_root(&emit_tree, false, cache_path.as_deref()),
                            false,
                        ));
                    },
                );
            },
            logger,
        );
    })
}
