//! Workspace roots for `file` repositories that must live in Git: the
//! `to_git` pragma and both symlink-resolution pragmas import the local
//! directory into the cache. Plain file roots never reach this map; the
//! setup map emits their filesystem-path form directly.

use std::{
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::Arc,
};

use crate::{
    archive,
    config::pragmas::PragmaSpecial,
    consumer::AsyncMapConsumer,
    ops_maps::import_to_git::{CommitInfo, ImportToGitMap},
    root_maps::git_tree_root,
};

/// Key of one to-git file root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FpathInfo {
    pub fpath: PathBuf,
    pub pragma_special: Option<PragmaSpecial>,
    pub absent: bool,
}

impl Hash for FpathInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fpath.hash(state);
        self.pragma_special.hash(state);
        self.absent.hash(state);
    }
}

pub struct FpathGitContext {
    pub import_to_git_map: ImportToGitMap,
    pub git_cache_root: PathBuf,
}

/// Resolves to the workspace root; local paths are not counted as cache
/// hits or executed fetches, so no flag accompanies the root.
pub type FilePathGitMap = AsyncMapConsumer<FpathInfo, serde_json::Value>;

pub fn create_fpath_git_map(context: Arc<FpathGitContext>) -> FilePathGitMap {
    AsyncMapConsumer::new(move |pool, setter, logger, _subcaller, key: &FpathInfo| {
        let needs_resolution = matches!(
            key.pragma_special,
            Some(PragmaSpecial::ResolvePartially | PragmaSpecial::ResolveCompletely)
        );
        // resolution must not mutate the user's directory: work on a copy
        let (import_dir, scratch) = if needs_resolution {
            let scratch = match tempfile::tempdir() {
                Ok(scratch) => scratch,
                Err(err) => {
                    logger(&format!("Could not create scratch directory: {err}"), true);
                    return;
                }
            };
            let copy = scratch.path().join("tree");
            if let Err(err) = archive::copy_tree(&key.fpath, &copy) {
                logger(&format!("While copying {:?}: {err}", key.fpath), true);
                return;
            }
            if let Err(err) = archive::resolve_special_aliased(
                &copy,
                &key.fpath,
                key.pragma_special.expect("checked above"),
            ) {
                logger(&err.to_string(), true);
                return;
            }
            (copy, Some(scratch))
        } else {
            (key.fpath.clone(), None)
        };
        let ignore_special = key.pragma_special == Some(PragmaSpecial::Ignore);
        let import_key = CommitInfo {
            dir: import_dir,
            repo_type: "file".to_string(),
            content: format!(
                "{}-{}",
                key.fpath.to_string_lossy(),
                key.pragma_special.map(|p| p.keyword()).unwrap_or("none")
            ),
            ignore_special,
        };
        let key = key.clone();
        let context = context.clone();
        context.import_to_git_map.clone().consume_after_keys_ready(
            pool,
            vec![import_key],
            move |values| {
                let _scratch = scratch;
                let tree_hex = values[0].as_ref();
                let cache_path = (!key.absent).then_some(context.git_cache_root.as_path());
                setter.set(git_tree_root(tree_hex, ignore_special, cache_path));
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
        git::repo::GitCache,
        ops_maps::critical_git_op::{CriticalGitOpGuard, create_critical_git_op_map},
        pool::TaskPool,
    };

    fn make_context(base: &std::path::Path) -> Arc<FpathGitContext> {
        let guard = Arc::new(CriticalGitOpGuard::new());
        let critical = create_critical_git_op_map(guard, "git".to_string());
        let git_cache_root = base.join("git");
        Arc::new(FpathGitContext {
            import_to_git_map: crate::ops_maps::import_to_git::create_import_to_git_map(
                critical,
                git_cache_root.clone(),
            ),
            git_cache_root,
        })
    }

    #[test]
    fn test_to_git_import_emits_tree_root() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("data.txt"), "data").unwrap();
        let context = make_context(dir.path());

        let map = create_fpath_git_map(context.clone());
        let pool = Arc::new(TaskPool::new(2));
        let result = Arc::new(Mutex::new(None));
        {
            let result = result.clone();
            map.consume_after_keys_ready(
                &pool,
                vec![FpathInfo { fpath: src.clone(), pragma_special: None, absent: false }],
                move |values| *result.lock().unwrap() = Some(values[0].as_ref().clone()),
                tracing_logger(),
            );
        }
        pool.join();
        let root = result.lock().unwrap().take().unwrap();
        let root = root.as_array().unwrap();
        assert_eq!(root[0], "git tree");
        assert_eq!(root.len(), 3);
        // the source directory is untouched and the tree matches it
        let cache = GitCache::open_or_init(&context.git_cache_root).unwrap();
        let reimported = cache.import_directory(&src, false).unwrap();
        assert_eq!(reimported.hex(), root[1].as_str().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolution_does_not_mutate_source() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("real.txt"), "real").unwrap();
        symlink(src.join("real.txt"), src.join("abs-link")).unwrap();
        let context = make_context(dir.path());

        let map = create_fpath_git_map(context);
        let pool = Arc::new(TaskPool::new(2));
        let result = Arc::new(Mutex::new(None));
        {
            let result = result.clone();
            map.consume_after_keys_ready(
                &pool,
                vec![FpathInfo {
                    fpath: src.clone(),
                    pragma_special: Some(PragmaSpecial::ResolveCompletely),
                    absent: false,
                }],
                move |values| *result.lock().unwrap() = Some(values[0].as_ref().clone()),
                tracing_logger(),
            );
        }
        pool.join();
        assert!(result.lock().unwrap().is_some());
        // source still has its symlink
        assert!(
            std::fs::symlink_metadata(src.join("abs-link"))
                .unwrap()
                .file_type()
                .is_symlink()
        );
    }
}
