//! Map making a known git tree available in the cache by running a
//! user-supplied command.
//!
//! The key advertises the tree id the command is expected to produce. A
//! tree already in the cache is a cache hit; otherwise the command runs in
//! a scratch directory with exactly the declared environment, its output
//! directory is imported, and the imported tree id must match the
//! advertised one.

use std::{
    collections::BTreeMap,
    hash::{Hash, Hasher},
    path::PathBuf,
    process::Command,
};

use crate::{
    consumer::AsyncMapConsumer,
    git::repo::GitCache,
    ops_maps::import_to_git::{CommitInfo, ImportToGitMap},
};

/// All information needed to make a git tree available. Identity is the
/// tree hash; command and environment ride along.
#[derive(Clone, Debug)]
pub struct GitTreeInfo {
    pub hash: String,
    pub env_vars: BTreeMap<String, String>,
    pub inherit_env: Vec<String>,
    pub command: Vec<String>,
    /// Repository this work is done for; used in diagnostics.
    pub origin: String,
}

impl PartialEq for GitTreeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for GitTreeInfo {}

impl Hash for GitTreeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// Resolves to whether the tree was already present (cache hit).
pub type GitTreeFetchMap = AsyncMapConsumer<GitTreeInfo, bool>;

fn run_tree_command(key: &GitTreeInfo, workdir: &std::path::Path) -> Result<(), String> {
    let Some((program, args)) = key.command.split_first() else {
        return Err("Field \"cmd\" must name a command".to_string());
    };
    let mut command = Command::new(program);
    command.args(args).current_dir(workdir).env_clear();
    if !key.env_vars.contains_key("PATH") && !key.inherit_env.iter().any(|v| v == "PATH") {
        command.env("PATH", "/usr/local/bin:/usr/bin:/bin");
    }
    for (name, value) in &key.env_vars {
        command.env(name, value);
    }
    for name in &key.inherit_env {
        if let Ok(value) = std::env::var(name) {
            command.env(name, value);
        }
    }
    let output = command
        .output()
        .map_err(|err| format!("Could not launch {program:?}: {err}"))?;
    if !output.status.success() {
        return Err(format!(
            "Command {:?} failed with {}:\n{}",
            key.command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

pub fn create_git_tree_fetch_map(
    import_to_git_map: ImportToGitMap,
    git_cache_root: PathBuf,
) -> GitTreeFetchMap {
    AsyncMapConsumer::new(move |pool, setter, logger, _subcaller, key: &GitTreeInfo| {
        // cache hit: the tree is already known locally
        if let Ok(cache) = GitCache::open_or_init(&git_cache_root) {
            if let Ok(tree_id) = key.hash.parse() {
                if cache.contains_object(&tree_id) {
                    setter.set(true);
                    return;
                }
            }
        }
        let scratch = match tempfile::tempdir() {
            Ok(scratch) => scratch,
            Err(err) => {
                logger(&format!("Could not create scratch directory: {err}"), true);
                return;
            }
        };
        if let Err(msg) = run_tree_command(key, scratch.path()) {
            logger(
                &format!("While fetching git tree {} for {:?}: {msg}", key.hash, key.origin),
                true,
            );
            return;
        }
        let expected = key.hash.clone();
        let origin = key.origin.clone();
        let import_logger = logger.clone();
        import_to_git_map.consume_after_keys_ready(
            pool,
            vec![CommitInfo {
                dir: scratch.path().to_path_buf(),
                repo_type: "git tree".to_string(),
                content: key.hash.clone(),
                ignore_special: false,
            }],
            move |values| {
                // scratch lives until the import is done
                let _scratch = scratch;
                let produced = values[0].as_ref();
                if *produced != expected {
                    import_logger(
                        &format!(
                            "Command for {origin:?} produced tree {produced}, expected {expected}"
                        ),
                        true,
                    );
                    return;
                }
                setter.set(false);
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
        consumer::{make_logger, tracing_logger},
        ops_maps::critical_git_op::{CriticalGitOpGuard, create_critical_git_op_map},
        pool::TaskPool,
    };

    fn tree_maps(cache_root: &std::path::Path) -> GitTreeFetchMap {
        let guard = Arc::new(CriticalGitOpGuard::new());
        let critical = create_critical_git_op_map(guard, "git".to_string());
        let import = crate::ops_maps::import_to_git::create_import_to_git_map(
            critical,
            cache_root.to_path_buf(),
        );
        create_git_tree_fetch_map(import, cache_root.to_path_buf())
    }

    /// Expected tree id of a directory holding `out.txt` with "produced\n".
    fn expected_tree_hex(cache_root: &std::path::Path) -> String {
        let cache = GitCache::open_or_init(cache_root).unwrap();
        let blob = cache.put_blob(b"produced\n").unwrap();
        cache
            .put_tree(vec![crate::git::object::TreeItem {
                mode: crate::git::object::TreeItemMode::Blob,
                name: "out.txt".to_string(),
                id: blob,
            }])
            .unwrap()
            .hex()
    }

    #[test]
    fn test_tree_already_present_is_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("git");
        let tree_hex = expected_tree_hex(&cache_root);
        let map = tree_maps(&cache_root);

        let pool = Arc::new(TaskPool::new(2));
        let hit = Arc::new(Mutex::new(None));
        {
            let hit = hit.clone();
            map.consume_after_keys_ready(
                &pool,
                vec![GitTreeInfo {
                    hash: tree_hex,
                    env_vars: BTreeMap::new(),
                    inherit_env: Vec::new(),
                    command: vec!["true".to_string()],
                    origin: "r".to_string(),
                }],
                move |values| *hit.lock().unwrap() = Some(*values[0]),
                tracing_logger(),
            );
        }
        pool.join();
        assert_eq!(hit.lock().unwrap().take(), Some(true));
    }

    /// The command runs, its output is imported, and the advertised id is
    /// verified against the imported tree.
    #[test]
    fn test_command_produces_expected_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("git");
        // compute the id in a throwaway cache so the real one starts empty
        let tree_hex = expected_tree_hex(&dir.path().join("scratch-cache"));
        let map = tree_maps(&cache_root);

        let pool = Arc::new(TaskPool::new(4));
        let hit = Arc::new(Mutex::new(None));
        {
            let hit = hit.clone();
            map.consume_after_keys_ready(
                &pool,
                vec![GitTreeInfo {
                    hash: tree_hex.clone(),
                    env_vars: BTreeMap::new(),
                    inherit_env: Vec::new(),
                    command: vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        "printf 'produced\\n' > out.txt".to_string(),
                    ],
                    origin: "r".to_string(),
                }],
                move |values| *hit.lock().unwrap() = Some(*values[0]),
                tracing_logger(),
            );
        }
        pool.join();
        assert_eq!(hit.lock().unwrap().take(), Some(false));
        let cache = GitCache::open_or_init(&cache_root).unwrap();
        assert!(cache.contains_object(&tree_hex.parse().unwrap()));
    }

    /// A command producing a different tree than advertised is fatal.
    #[test]
    fn test_wrong_tree_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("git");
        let map = tree_maps(&cache_root);

        let pool = Arc::new(TaskPool::new(4));
        let sink = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = sink.clone();
            map.consume_after_keys_ready(
                &pool,
                vec![GitTreeInfo {
                    hash: "0000000000000000000000000000000000000000".to_string(),
                    env_vars: BTreeMap::new(),
                    inherit_env: Vec::new(),
                    command: vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        "printf 'other\\n' > out.txt".to_string(),
                    ],
                    origin: "r".to_string(),
                }],
                |_| panic!("must not resolve"),
                make_logger(move |msg, fatal| {
                    sink.lock().unwrap().push((msg.to_string(), fatal));
                }),
            );
        }
        pool.join();
        let sink = sink.lock().unwrap();
        assert!(sink.iter().any(|(msg, fatal)| *fatal && msg.contains("expected")));
    }
}
