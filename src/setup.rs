//! Setup driver: builds the map family, sets up every reachable
//! repository, and writes the assembled multi-repo configuration to the
//! local CAS.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::{Map, Value, json};

use crate::{
    config::repos::{ALT_DIR_FIELDS, RepositoryConfig},
    consumer::{Logger, make_logger},
    errors::SetupError,
    fetch::Fetcher,
    ops_maps::{
        content_cas::{ContentCasContext, create_content_cas_map},
        critical_git_op::{CriticalGitOpGuard, create_critical_git_op_map},
        git_tree_fetch::create_git_tree_fetch_map,
        import_to_git::create_import_to_git_map,
    },
    pool::TaskPool,
    repo_map::{
        repos_to_setup::{ReposToSetupContext, create_repos_to_setup_map},
        stats::SetupStats,
    },
    root_maps::{
        TreeIdMappings,
        commit_git::{CommitGitContext, create_commit_git_map},
        content_git::{ContentGitContext, create_content_git_map},
        distdir_git::{DistdirGitContext, create_distdir_git_map},
        foreign_file_git::{ForeignFileGitContext, create_foreign_file_git_map},
        fpath_git::{FpathGitContext, create_fpath_git_map},
        tree_id_git::create_tree_id_git_map,
    },
    serve::ServeApi,
    storage::{cas::LocalCas, operation_cache::OperationCache},
};

/// Driver configuration. `storage_root` owns the CAS, the Git cache and
/// the durable tree mappings.
pub struct SetupArgs {
    pub storage_root: PathBuf,
    pub jobs: usize,
    pub git_bin: String,
    pub main: Option<String>,
    pub fetch_absent: bool,
    pub distdirs: Vec<PathBuf>,
    pub additional_mirrors: Vec<String>,
    pub fetch_timeout: Option<Duration>,
    pub serve: Option<Arc<dyn ServeApi>>,
}

impl SetupArgs {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        SetupArgs {
            storage_root: storage_root.into(),
            jobs: num_cpus::get(),
            git_bin: "git".to_string(),
            main: None,
            fetch_absent: false,
            distdirs: Vec::new(),
            additional_mirrors: Vec::new(),
            fetch_timeout: None,
            serve: None,
        }
    }
}

/// Result of a successful setup run.
#[derive(Debug)]
pub struct SetupOutput {
    /// Content hash of the emitted configuration blob.
    pub digest: String,
    /// On-disk location of the blob in the local CAS.
    pub path: PathBuf,
    pub main: Option<String>,
    pub stats: Arc<SetupStats>,
}

/// Set up all repositories reachable from the main repository and return
/// the digest of the emitted multi-repo configuration.
pub fn multi_repo_setup(config_json: &Value, args: &SetupArgs) -> Result<SetupOutput, SetupError> {
    tracing::info!("Performing repositories setup");
    let config = Arc::new(RepositoryConfig::from_json(config_json)?);

    let main = config.effective_main(args.main.as_deref());
    let to_setup: Vec<String> = match &main {
        Some(main) => config.reachable_repositories(main)?.into_iter().collect(),
        None => Vec::new(),
    };
    tracing::info!("Found {} repositories to set up", to_setup.len());

    let cas = Arc::new(LocalCas::open(args.storage_root.join("cas"))?);
    let mappings = Arc::new(TreeIdMappings::open(args.storage_root.join("tree-map"))?);
    let git_cache_root = args.storage_root.join("git");
    let operations = Arc::new(OperationCache::new());
    let stats = Arc::new(SetupStats::new());
    let fetcher = Arc::new(Fetcher::new(args.fetch_timeout)?);

    // the map family shares one critical-op guard and one git cache
    let guard = Arc::new(CriticalGitOpGuard::new());
    let critical_git_op_map = create_critical_git_op_map(guard, args.git_bin.clone());
    let content_cas_map = create_content_cas_map(Arc::new(ContentCasContext {
        cas: cas.clone(),
        fetcher,
        distdirs: args.distdirs.clone(),
        additional_mirrors: args.additional_mirrors.clone(),
        serve: args.serve.clone(),
        operations: operations.clone(),
    }));
    let import_to_git_map =
        create_import_to_git_map(critical_git_op_map.clone(), git_cache_root.clone());
    let git_tree_fetch_map =
        create_git_tree_fetch_map(import_to_git_map.clone(), git_cache_root.clone());
    let commit_git_map = create_commit_git_map(Arc::new(CommitGitContext {
        critical_git_op_map: critical_git_op_map.clone(),
        git_cache_root: git_cache_root.clone(),
        git_bin: args.git_bin.clone(),
        serve: args.serve.clone(),
    }));
    let content_git_map = create_content_git_map(Arc::new(ContentGitContext {
        content_cas_map: content_cas_map.clone(),
        import_to_git_map: import_to_git_map.clone(),
        cas: cas.clone(),
        mappings: mappings.clone(),
        git_cache_root: git_cache_root.clone(),
    }));
    let foreign_file_git_map = create_foreign_file_git_map(Arc::new(ForeignFileGitContext {
        content_cas_map: content_cas_map.clone(),
        critical_git_op_map: critical_git_op_map.clone(),
        cas: cas.clone(),
        mappings: mappings.clone(),
        git_cache_root: git_cache_root.clone(),
    }));
    let fpath_git_map = create_fpath_git_map(Arc::new(FpathGitContext {
        import_to_git_map: import_to_git_map.clone(),
        git_cache_root: git_cache_root.clone(),
    }));
    let distdir_git_map = create_distdir_git_map(Arc::new(DistdirGitContext {
        content_cas_map,
        critical_git_op_map,
        cas: cas.clone(),
        mappings,
        git_cache_root: git_cache_root.clone(),
    }));
    let tree_id_git_map = create_tree_id_git_map(git_tree_fetch_map, git_cache_root);
    let repos_to_setup_map = create_repos_to_setup_map(Arc::new(ReposToSetupContext {
        config: config.clone(),
        commit_git_map,
        content_git_map,
        foreign_file_git_map,
        fpath_git_map,
        distdir_git_map,
        tree_id_git_map,
        stats: stats.clone(),
        fetch_absent: args.fetch_absent,
    }));

    // collect every message; any fatal one fails the run after quiescence
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let driver_logger: Logger = {
        let errors = errors.clone();
        make_logger(move |msg, fatal| {
            if fatal {
                tracing::error!("{msg}");
                errors.lock().expect("error sink poisoned").push(msg.to_string());
            } else {
                tracing::warn!("{msg}");
            }
        })
    };

    let assembled: Arc<Mutex<Option<Map<String, Value>>>> = Arc::new(Mutex::new(None));
    {
        let pool = Arc::new(TaskPool::new(args.jobs));
        let keys = to_setup.clone();
        let assembled = assembled.clone();
        repos_to_setup_map.consume_after_keys_ready(
            &pool,
            to_setup.clone(),
            move |values| {
                let mut mr_repos = Map::new();
                for (name, cfg) in keys.iter().zip(values) {
                    mr_repos.insert(name.clone(), cfg.as_ref().clone());
                }
                *assembled.lock().expect("assembly sink poisoned") = Some(mr_repos);
            },
            driver_logger,
        );
        pool.join();
    }

    let errors = errors.lock().expect("error sink poisoned");
    if !errors.is_empty() {
        let pending = repos_to_setup_map.pending_keys();
        if !pending.is_empty() {
            tracing::error!("Repositories left unresolved: {pending:?}");
        }
        return Err(SetupError::SetupFailed(errors.join("\n")));
    }
    let mut mr_repos = assembled
        .lock()
        .expect("assembly sink poisoned")
        .take()
        .ok_or_else(|| {
            SetupError::Internal("Setup finished without producing a configuration".to_string())
        })?;

    // take-over roots naming another repository become that repository's
    // workspace root
    let mut root_replacements: Vec<(String, String, Value)> = Vec::new();
    for (name, cfg) in &mr_repos {
        for field in ALT_DIR_FIELDS {
            let referenced = cfg.get(field).and_then(Value::as_str);
            let root = referenced
                .and_then(|referenced| mr_repos.get(referenced))
                .and_then(|entry| entry.get("workspace_root"));
            if let Some(root) = root {
                root_replacements.push((name.clone(), field.to_string(), root.clone()));
            }
        }
    }
    for (name, field, root) in root_replacements {
        if let Some(cfg) = mr_repos.get_mut(&name).and_then(Value::as_object_mut) {
            cfg.insert(field, root);
        }
    }

    let mut mr_config = Map::new();
    if let Some(main) = &main {
        mr_config.insert("main".to_string(), json!(main));
    }
    mr_config.insert("repositories".to_string(), Value::Object(mr_repos));

    let blob = serde_json::to_vec_pretty(&Value::Object(mr_config))
        .map_err(|e| SetupError::Internal(e.to_string()))?;
    let digest = cas.put(&blob)?;
    let path = cas
        .blob_path(&digest)
        .ok_or_else(|| SetupError::Internal("Emitted blob vanished from CAS".to_string()))?;
    tracing::info!("Setup finished, configuration {digest}");
    Ok(SetupOutput { digest, path, main, stats })
}
