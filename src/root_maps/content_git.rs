//! Workspace roots for `archive` and `zip` repositories.
//!
//! The archive is fetched through the content-CAS map, unpacked, its
//! symlinks treated per the `special` pragma, and the result imported into
//! the Git cache. The association content → imported tree is recorded
//! durably, so a later run (or a second root into another subdir of the
//! same archive) is a cache hit without re-extraction.

use std::{
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::Arc,
};

use crate::{
    archive,
    config::pragmas::PragmaSpecial,
    consumer::AsyncMapConsumer,
    git::repo::GitCache,
    ops_maps::{
        content_cas::{ArchiveContent, ContentCasMap},
        import_to_git::{CommitInfo, ImportToGitMap},
    },
    root_maps::{TreeIdMappings, git_tree_root},
    storage::cas::LocalCas,
};

/// Key identifying one archive-based root. Equality covers all fields:
/// different subdirs or pragmas of the same archive are different roots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveRepoInfo {
    pub archive: ArchiveContent,
    /// `archive` or `zip`; decides the unpack format.
    pub repo_type: String,
    pub subdir: String,
    pub pragma_special: Option<PragmaSpecial>,
    pub absent: bool,
}

impl Hash for ArchiveRepoInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.archive.hash(state);
        self.repo_type.hash(state);
        self.subdir.hash(state);
        self.pragma_special.hash(state);
        self.absent.hash(state);
    }
}

impl ArchiveRepoInfo {
    /// Durable mapping id: content plus everything that changes the
    /// imported tree.
    fn mapping_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.archive.content_hash,
            self.repo_type,
            self.pragma_special.map(|p| p.keyword()).unwrap_or("none")
        )
    }
}

pub struct ContentGitContext {
    pub content_cas_map: ContentCasMap,
    pub import_to_git_map: ImportToGitMap,
    pub cas: Arc<LocalCas>,
    pub mappings: Arc<TreeIdMappings>,
    pub git_cache_root: PathBuf,
}

/// Resolves to `(workspace_root, cache_hit)`.
pub type ContentGitMap = AsyncMapConsumer<ArchiveRepoInfo, (serde_json::Value, bool)>;

fn emit_root(
    context: &ContentGitContext,
    key: &ArchiveRepoInfo,
    archive_tree_hex: &str,
    cache_hit: bool,
) -> Result<(serde_json::Value, bool), String> {
    let cache = GitCache::open_or_init(&context.git_cache_root).map_err(|e| e.to_string())?;
    let archive_tree = archive_tree_hex.parse().map_err(|e: crate::errors::SetupError| e.to_string())?;
    let subdir_tree = cache
        .resolve_subtree(&archive_tree, &key.subdir)
        .map_err(|e| e.to_string())?;
    let ignore_special = key.pragma_special == Some(PragmaSpecial::Ignore);
    let cache_path = (!key.absent).then_some(context.git_cache_root.as_path());
    Ok((
        git_tree_root(&subdir_tree.hex(), ignore_special, cache_path),
        cache_hit,
    ))
}

pub fn create_content_git_map(context: Arc<ContentGitContext>) -> ContentGitMap {
    AsyncMapConsumer::new(move |pool, setter, logger, _subcaller, key: &ArchiveRepoInfo| {
        // previously imported: only subdir resolution is left
        if let Some(tree_hex) = context.mappings.get("archive", &key.mapping_id()) {
            match emit_root(&context, key, &tree_hex, true) {
                Ok(result) => setter.set(result),
                Err(msg) => logger(&msg, true),
            }
            return;
        }
        // no fetch needed counts as a cache hit even when the tree still
        // has to be imported
        let was_in_cas = context.cas.contains(&key.archive.content_hash);
        let context = context.clone();
        let key = key.clone();
        let pool = pool.clone();
        let fetch_logger = logger.clone();
        context.content_cas_map.clone().consume_after_keys_ready(
            &pool.clone(),
            vec![key.archive.clone()],
            move |_values| {
                // content is now in the CAS: unpack and import
                let data = match context.cas.read(&key.archive.content_hash) {
                    Ok(data) => data,
                    Err(err) => {
                        fetch_logger(&err.to_string(), true);
                        return;
                    }
                };
                let scratch = match tempfile::tempdir() {
                    Ok(scratch) => scratch,
                    Err(err) => {
                        fetch_logger(&format!("Could not create scratch directory: {err}"), true);
                        return;
                    }
                };
                if let Err(err) = archive::unpack(&key.repo_type, &data, scratch.path()) {
                    fetch_logger(
                        &format!("While unpacking {}: {err}", key.archive.content_hash),
                        true,
                    );
                    return;
                }
                if let Some(special) = key.pragma_special {
                    if let Err(err) = archive::resolve_special(scratch.path(), special) {
                        fetch_logger(&err.to_string(), true);
                        return;
                    }
                }
                let import_key = CommitInfo {
                    dir: scratch.path().to_path_buf(),
                    repo_type: key.repo_type.clone(),
                    content: key.mapping_id(),
                    ignore_special: key.pragma_special == Some(PragmaSpecial::Ignore),
                };
                let emit_logger = fetch_logger.clone();
                let emit_context = context.clone();
                context.import_to_git_map.clone().consume_after_keys_ready(
                    &pool,
                    vec![import_key],
                    move |values| {
                        let _scratch = scratch;
                        let tree_hex = values[0].as_ref();
                        emit_context
                            .mappings
                            .set("archive", &key.mapping_id(), tree_hex);
                        match emit_root(&emit_context, &key, tree_hex, was_in_cas) {
                            Ok(result) => setter.set(result),
                            Err(msg) => emit_logger(&msg, true),
                        }
                    },
                    fetch_logger.clone(),
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
        ops_maps::{
            content_cas::{ContentCasContext, create_content_cas_map},
            critical_git_op::{CriticalGitOpGuard, create_critical_git_op_map},
            import_to_git::create_import_to_git_map,
        },
        pool::TaskPool,
        storage::operation_cache::OperationCache,
    };

    pub(crate) fn make_tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn make_context(base: &std::path::Path) -> Arc<ContentGitContext> {
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
        let critical = create_critical_git_op_map(guard, "git".to_string());
        let git_cache_root = base.join("git");
        Arc::new(ContentGitContext {
            content_cas_map: create_content_cas_map(cas_context),
            import_to_git_map: create_import_to_git_map(critical, git_cache_root.clone()),
            cas,
            mappings: Arc::new(TreeIdMappings::open(base.join("tree-map")).unwrap()),
            git_cache_root,
        })
    }

    fn archive_info(data: &[u8], subdir: &str) -> ArchiveRepoInfo {
        ArchiveRepoInfo {
            archive: ArchiveContent {
                content_hash: crate::hash::compute_hash(data),
                distfile: None,
                fetch_url: "https://unreachable.invalid/a.tar.gz".to_string(),
                mirrors: Vec::new(),
                sha256: None,
                sha512: None,
                origin: "r".to_string(),
            },
            repo_type: "archive".to_string(),
            subdir: subdir.to_string(),
            pragma_special: None,
            absent: false,
        }
    }

    /// A cached archive materializes to a present git-tree root; running
    /// the same key again is served from the durable mapping.
    #[test]
    fn test_cached_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let context = make_context(dir.path());
        let data = make_tar_gz(&[("sub/inner.txt", "inner"), ("top.txt", "top")]);
        context.cas.put(&data).unwrap();

        let map = create_content_git_map(context.clone());
        let pool = Arc::new(TaskPool::new(4));
        let results = Arc::new(Mutex::new(Vec::new()));
        for round in 0..2 {
            let map_fresh = if round == 0 {
                map.clone()
            } else {
                // second round: fresh map instance, durable mapping only
                create_content_git_map(context.clone())
            };
            let results = results.clone();
            map_fresh.consume_after_keys_ready(
                &pool,
                vec![archive_info(&data, "sub")],
                move |values| results.lock().unwrap().push(values[0].as_ref().clone()),
                tracing_logger(),
            );
            pool.join();
        }
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        let (first_root, first_hit) = &results[0];
        let (second_root, second_hit) = &results[1];
        // content was pre-seeded in the CAS: no fetch ran either time
        assert!(*first_hit, "content in CAS counts as a cache hit");
        assert!(*second_hit, "second run hits the durable mapping");
        assert_eq!(first_root, second_root);
        let root = first_root.as_array().unwrap();
        assert_eq!(root[0], "git tree");
        assert_eq!(root.len(), 3);
        // the subdir tree contains exactly inner.txt
        let cache = GitCache::open_or_init(&context.git_cache_root).unwrap();
        let tree = root[1].as_str().unwrap().parse().unwrap();
        let (_, payload) = cache.read_object(&tree).unwrap();
        let items = crate::git::object::parse_tree(&payload).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "inner.txt");
    }

    /// Distinct subdirs of one archive are distinct roots but share the
    /// single import of the archive.
    #[test]
    fn test_subdirs_share_import() {
        let dir = tempfile::tempdir().unwrap();
        let context = make_context(dir.path());
        let data = make_tar_gz(&[("a/x.txt", "x"), ("b/y.txt", "y")]);
        context.cas.put(&data).unwrap();

        let map = create_content_git_map(context.clone());
        let pool = Arc::new(TaskPool::new(4));
        let results = Arc::new(Mutex::new(Vec::new()));
        for subdir in ["a", "b"] {
            let results = results.clone();
            map.consume_after_keys_ready(
                &pool,
                vec![archive_info(&data, subdir)],
                move |values| results.lock().unwrap().push(values[0].as_ref().clone()),
                tracing_logger(),
            );
        }
        pool.join();
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        assert_ne!(results[0].0, results[1].0);
        // one shared import for the archive content
        let info = archive_info(&data, "a");
        assert_eq!(
            context.import_to_git_map.compute_count(&CommitInfo {
                dir: PathBuf::new(),
                repo_type: "archive".to_string(),
                content: info.mapping_id(),
                ignore_special: false,
            }),
            1
        );
    }
}
