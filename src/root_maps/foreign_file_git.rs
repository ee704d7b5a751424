//! Workspace roots for `foreign file` repositories: a single fetched file
//! placed into a fresh tree under a chosen name.

use std::{
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
    ops_maps::{
        content_cas::{ArchiveContent, ContentCasMap},
        critical_git_op::CriticalGitOpMap,
    },
    root_maps::{TreeIdMappings, anchor_tree, git_tree_root},
    storage::cas::LocalCas,
};

/// Key of one foreign-file root; all fields participate in identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignFileInfo {
    pub archive: ArchiveContent,
    pub name: String,
    pub executable: bool,
    pub absent: bool,
}

impl Hash for ForeignFileInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.archive.hash(state);
        self.name.hash(state);
        self.executable.hash(state);
        self.absent.hash(state);
    }
}

impl ForeignFileInfo {
    fn mapping_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.archive.content_hash, self.name, self.executable
        )
    }
}

pub struct ForeignFileGitContext {
    pub content_cas_map: ContentCasMap,
    pub critical_git_op_map: CriticalGitOpMap,
    pub cas: Arc<LocalCas>,
    pub mappings: Arc<TreeIdMappings>,
    pub git_cache_root: PathBuf,
}

/// Resolves to `(workspace_root, cache_hit)`.
pub type ForeignFileGitMap = AsyncMapConsumer<ForeignFileInfo, (serde_json::Value, bool)>;

pub fn create_foreign_file_git_map(context: Arc<ForeignFileGitContext>) -> ForeignFileGitMap {
    AsyncMapConsumer::new(move |pool, setter, logger, _subcaller, key: &ForeignFileInfo| {
        let cache_path = (!key.absent).then(|| context.git_cache_root.clone());
        if let Some(tree_hex) = context.mappings.get("foreign-file", &key.mapping_id()) {
            setter.set((git_tree_root(&tree_hex, false, cache_path.as_deref()), true));
            return;
        }
        let context = context.clone();
        let key = key.clone();
        let pool = pool.clone();
        let build_logger = logger.clone();
        context.content_cas_map.clone().consume_after_keys_ready(
            &pool.clone(),
            vec![key.archive.clone()],
            move |_values| {
                let data = match context.cas.read(&key.archive.content_hash) {
                    Ok(data) => data,
                    Err(err) => {
                        build_logger(&err.to_string(), true);
                        return;
                    }
                };
                let tree_hex = {
                    let cache = match GitCache::open_or_init(&context.git_cache_root) {
                        Ok(cache) => cache,
                        Err(err) => {
                            build_logger(&err.to_string(), true);
                            return;
                        }
                    };
                    let tree = cache.put_blob(&data).and_then(|blob| {
                        cache.put_tree(vec![TreeItem {
                            mode: if key.executable {
                                TreeItemMode::BlobExecutable
                            } else {
                                TreeItemMode::Blob
                            },
                            name: key.name.clone(),
                            id: blob,
                        }])
                    });
                    match tree {
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
                    tree_hex.clone(),
                    format!("Foreign file {} as {:?}", key.archive.content_hash, key.name),
                    build_logger.clone(),
                    move || {
                        emit_context
                            .mappings
                            .set("foreign-file", &emit_key.mapping_id(), &emit_tree);
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

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        consumer::tracing_logger,
        fetch::Fetcher,
        git::object::parse_tree,
        ops_maps::{
            content_cas::{ContentCasContext, create_content_cas_map},
            critical_git_op::{CriticalGitOpGuard, create_critical_git_op_map},
        },
        pool::TaskPool,
        storage::operation_cache::OperationCache,
    };

    fn make_context(base: &std::path::Path) -> Arc<ForeignFileGitContext> {
        let cas = Arc::new(LocalCas::open(base.join("cas")).unwrap());
        let cas_context = Arc::new(ContentCasContext {
            cas: cas.clone(),
            fetcher: Arc::new(Fetcher::new(Some(std::time::Duration::from_millis(200))).unwrap()),
            distdirs: Vec::new(),
            additional_mirrors: Vec::new(),
            serve: None,
            operations: Arc::new(OperationCache::new()),
        });
        let guard = Arc::new(CriticalGitOpGuard::new());
        Arc::new(ForeignFileGitContext {
            content_cas_map: create_content_cas_map(cas_context),
            critical_git_op_map: create_critical_git_op_map(guard, "git".to_string()),
            cas,
            mappings: Arc::new(TreeIdMappings::open(base.join("tree-map")).unwrap()),
            git_cache_root: base.join("git"),
        })
    }

    #[test]
    fn test_foreign_file_tree_has_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let context = make_context(dir.path());
        context.cas.put(b"#!/bin/sh\necho hi\n").unwrap();

        let key = ForeignFileInfo {
            archive: ArchiveContent {
                content_hash: crate::hash::compute_hash(b"#!/bin/sh\necho hi\n"),
                distfile: None,
                fetch_url: "https://unreachable.invalid/hi.sh".to_string(),
                mirrors: Vec::new(),
                sha256: None,
                sha512: None,
                origin: "tool".to_string(),
            },
            name: "hi.sh".to_string(),
            executable: true,
            absent: false,
        };
        let map = create_foreign_file_git_map(context.clone());
        let pool = Arc::new(TaskPool::new(4));
        let result = Arc::new(Mutex::new(None));
        {
            let result = result.clone();
            map.consume_after_keys_ready(
                &pool,
                vec![key],
                move |values| *result.lock().unwrap() = Some(values[0].as_ref().clone()),
                tracing_logger(),
            );
        }
        pool.join();
        let (root, cache_hit) = result.lock().unwrap().take().unwrap();
        assert!(!cache_hit);
        let root = root.as_array().unwrap();
        assert_eq!(root[0], "git tree");

        let cache = GitCache::open_or_init(&context.git_cache_root).unwrap();
        let (_, payload) = cache
            .read_object(&root[1].as_str().unwrap().parse().unwrap())
            .unwrap();
        let items = parse_tree(&payload).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "hi.sh");
        assert_eq!(items[0].mode, TreeItemMode::BlobExecutable);
    }
}
