//! Top-level map: one key per repository name, resolving to the emitted
//! configuration entry `{workspace_root, ...take-over fields}`.
//!
//! The compute function resolves alias chains, dispatches to the root map
//! matching the repository type, and counts the work class (cache hit,
//! executed fetch, local path). Precomputed roots subcall on the
//! repository they reference, so it is set up first.

use std::{collections::BTreeMap, sync::Arc};

use serde_json::{Map, Value, json};

use crate::{
    config::{
        field_reader::FieldReader,
        pragmas::{CheckoutType, PragmaSpecial, checkout_type, pragma_flag, pragma_special},
        repos::{RepositoryConfig, TAKE_OVER_FIELDS},
    },
    consumer::{AsyncMapConsumer, Logger, Setter, SubCaller},
    fetch::distfile_name,
    pool::TaskPool,
    repo_map::{parse, stats::SetupStats},
    root_maps::{
        COMPUTED_MARKER, FILE_IGNORE_SPECIAL_MARKER, FILE_MARKER, TREE_STRUCTURE_MARKER,
        commit_git::CommitGitMap,
        content_git::ContentGitMap,
        distdir_git::{DistdirGitMap, DistdirInfo, distdir_content_id},
        foreign_file_git::ForeignFileGitMap,
        fpath_git::{FilePathGitMap, FpathInfo},
        tree_id_git::{TreeIdGitMap, TreeIdInfo},
    },
};

pub struct ReposToSetupContext {
    pub config: Arc<RepositoryConfig>,
    pub commit_git_map: CommitGitMap,
    pub content_git_map: ContentGitMap,
    pub foreign_file_git_map: ForeignFileGitMap,
    pub fpath_git_map: FilePathGitMap,
    pub distdir_git_map: DistdirGitMap,
    pub tree_id_git_map: TreeIdGitMap,
    pub stats: Arc<SetupStats>,
    pub fetch_absent: bool,
}

/// Resolves to the configuration entry emitted for the repository.
pub type ReposToSetupMap = AsyncMapConsumer<String, Value>;

/// Copy take-over fields verbatim from the input entry.
fn set_repos_take_over(config: &RepositoryConfig, repo_name: &str, cfg: &mut Map<String, Value>) {
    if let Some(entry) = config.repo_entry(repo_name) {
        for field in TAKE_OVER_FIELDS {
            if let Some(value) = entry.get(field) {
                cfg.insert(field.to_string(), value.clone());
            }
        }
    }
}

fn finish_root(
    context: &ReposToSetupContext,
    repo_name: &str,
    root: Value,
    cache_hit: Option<bool>,
    setter: Setter<String, Value>,
) {
    let mut cfg = Map::new();
    cfg.insert("workspace_root".to_string(), root);
    set_repos_take_over(&context.config, repo_name, &mut cfg);
    match cache_hit {
        Some(true) => context.stats.increment_cache_hits(),
        Some(false) => context.stats.increment_executed(),
        None => context.stats.increment_local_paths(),
    }
    setter.set(Value::Object(cfg));
}

fn file_checkout(
    context: &Arc<ReposToSetupContext>,
    pool: &Arc<TaskPool>,
    repo_name: &str,
    desc: &Value,
    setter: Setter<String, Value>,
    logger: Logger,
) {
    let Some(reader) = FieldReader::create(desc, repo_name, "repository", logger.clone()) else {
        return;
    };
    let Some(path) = reader.read_string("path") else {
        return;
    };
    let fpath = match std::path::absolute(&path) {
        Ok(fpath) => fpath,
        Err(err) => {
            logger(&format!("Cannot make {path:?} absolute: {err}"), true);
            return;
        }
    };
    let special = pragma_special(desc);
    let to_git = pragma_flag(desc, "to_git")
        || matches!(
            special,
            Some(PragmaSpecial::ResolvePartially | PragmaSpecial::ResolveCompletely)
        );
    if to_git {
        let info = FpathInfo {
            fpath,
            pragma_special: special,
            absent: !context.fetch_absent && pragma_flag(desc, "absent"),
        };
        let context = context.clone();
        let repo_name = repo_name.to_string();
        context.fpath_git_map.clone().consume_after_keys_ready(
            pool,
            vec![info],
            move |values| {
                finish_root(&context, &repo_name, values[0].as_ref().clone(), None, setter);
            },
            logger,
        );
        return;
    }
    // plain file root: a filesystem location, no git involved
    let marker = if special == Some(PragmaSpecial::Ignore) {
        FILE_IGNORE_SPECIAL_MARKER
    } else {
        FILE_MARKER
    };
    let root = json!([marker, fpath.to_string_lossy()]);
    finish_root(context, repo_name, root, None, setter);
}

fn distdir_checkout(
    context: &Arc<ReposToSetupContext>,
    pool: &Arc<TaskPool>,
    repo_name: &str,
    desc: &Value,
    setter: Setter<String, Value>,
    logger: Logger,
) {
    let Some(reader) = FieldReader::create(desc, repo_name, "repository", logger.clone()) else {
        return;
    };
    let Some(dist_repos) = reader.read_value("repositories").map(Value::as_array) else {
        return;
    };
    let Some(dist_repos) = dist_repos else {
        logger("Mandatory field \"repositories\" must be a list", true);
        return;
    };
    let mut content_for_id: BTreeMap<String, (String, bool)> = BTreeMap::new();
    let mut content_list: BTreeMap<String, String> = BTreeMap::new();
    let mut repos_to_fetch = Vec::new();
    for dist_repo in dist_repos {
        let Some(dist_repo_name) = dist_repo.as_str() else {
            logger(
                &format!("Unsupported \"repositories\" list entry {dist_repo}"),
                true,
            );
            return;
        };
        let Some(dist_desc) = context.config.repository_desc(dist_repo_name) else {
            logger(&format!("No repository named {dist_repo_name:?}"), true);
            return;
        };
        let resolved = match context.config.resolve_repo_desc(dist_desc, dist_repo_name) {
            Ok(resolved) => resolved,
            Err(err) => {
                logger(&err.to_string(), true);
                return;
            }
        };
        let Some(type_str) = resolved.get("type").and_then(Value::as_str) else {
            logger(
                &format!("Mandatory key \"type\" missing for repository {dist_repo_name:?}"),
                true,
            );
            return;
        };
        match checkout_type(type_str) {
            Some(CheckoutType::Archive) => {}
            Some(_) => continue, // only archives contribute distfiles
            None => {
                logger(
                    &format!("Unknown type {type_str:?} for repository {dist_repo_name:?}"),
                    true,
                );
                return;
            }
        }
        let Some(archive) = parse::parse_archive_content(resolved, dist_repo_name, &logger)
        else {
            return;
        };
        let Some(distfile) = distfile_name(archive.distfile.as_deref(), &archive.fetch_url)
        else {
            logger(
                &format!("Cannot determine distfile name for repository {dist_repo_name:?}"),
                true,
            );
            return;
        };
        content_for_id.insert(distfile.clone(), (archive.content_hash.clone(), false));
        content_list.insert(distfile, archive.content_hash.clone());
        repos_to_fetch.push(archive);
    }
    let info = DistdirInfo {
        content_id: distdir_content_id(&content_for_id),
        content_list,
        repos_to_fetch,
        origin: repo_name.to_string(),
        absent: !context.fetch_absent && pragma_flag(desc, "absent"),
    };
    let context = context.clone();
    let repo_name = repo_name.to_string();
    context.distdir_git_map.clone().consume_after_keys_ready(
        pool,
        vec![info],
        move |values| {
            let (root, cache_hit) = values[0].as_ref();
            finish_root(&context, &repo_name, root.clone(), Some(*cache_hit), setter);
        },
        logger,
    );
}

fn precomputed_checkout(
    context: &Arc<ReposToSetupContext>,
    repo_name: &str,
    repo_type: CheckoutType,
    desc: &Value,
    setter: Setter<String, Value>,
    subcaller: SubCaller<String, Value>,
    logger: Logger,
) {
    let Some(reader) = FieldReader::create(desc, repo_name, "repository", logger.clone()) else {
        return;
    };
    let Some(target_repo) = reader.read_string("repo") else {
        return;
    };
    let root = match repo_type {
        CheckoutType::Computed => {
            let Some(target) = reader.read_value("target") else {
                return;
            };
            let Some(target_config) = reader.read_value("config") else {
                return;
            };
            json!([COMPUTED_MARKER, target_repo.clone(), target.clone(), target_config.clone()])
        }
        _ => json!([TREE_STRUCTURE_MARKER, target_repo.clone()]),
    };
    let context = context.clone();
    let repo_name = repo_name.to_string();
    // the referenced repository must be set up first
    subcaller.call(
        vec![target_repo],
        move |_values| {
            finish_root(&context, &repo_name, root, None, setter);
        },
        logger,
    );
}

pub fn create_repos_to_setup_map(context: Arc<ReposToSetupContext>) -> ReposToSetupMap {
    AsyncMapConsumer::new(move |pool, setter, logger, subcaller, key: &String| {
        let repo_name = key.clone();
        let wrapped_logger: Logger = {
            let logger = logger.clone();
            Arc::new(move |msg: &str, fatal: bool| {
                logger(
                    &format!("While setting up repository {repo_name:?}:\n{msg}"),
                    fatal,
                );
            })
        };
        let Some(entry) = context.config.repo_entry(key) else {
            wrapped_logger("Missing config entry", true);
            return;
        };
        if !entry.is_object() {
            wrapped_logger("Config entry is not a map", true);
            return;
        }
        let Some(desc) = entry.get("repository") else {
            wrapped_logger("Mandatory key \"repository\" missing", true);
            return;
        };
        let resolved = match context.config.resolve_repo_desc(desc, key) {
            Ok(resolved) => resolved,
            Err(err) => {
                wrapped_logger(&err.to_string(), true);
                return;
            }
        };
        if !resolved.is_object() {
            wrapped_logger("Repository resolves to a non-map description", true);
            return;
        }
        let Some(type_str) = resolved.get("type").and_then(Value::as_str) else {
            wrapped_logger("Mandatory key \"type\" missing or not a string", true);
            return;
        };
        let Some(kind) = checkout_type(type_str) else {
            wrapped_logger(&format!("Unknown repository type {type_str:?}"), true);
            return;
        };
        match kind {
            CheckoutType::Git => {
                let Some(info) = parse::parse_git_description(
                    resolved,
                    key,
                    context.fetch_absent,
                    &wrapped_logger,
                ) else {
                    return;
                };
                let context = context.clone();
                let repo_name = key.clone();
                context.commit_git_map.clone().consume_after_keys_ready(
                    pool,
                    vec![info],
                    move |values| {
                        let (root, cache_hit) = values[0].as_ref();
                        finish_root(&context, &repo_name, root.clone(), Some(*cache_hit), setter);
                    },
                    wrapped_logger,
                );
            }
            CheckoutType::Archive => {
                let Some(info) = parse::parse_archive_description(
                    resolved,
                    type_str,
                    key,
                    context.fetch_absent,
                    &wrapped_logger,
                ) else {
                    return;
                };
                let context = context.clone();
                let repo_name = key.clone();
                context.content_git_map.clone().consume_after_keys_ready(
                    pool,
                    vec![info],
                    move |values| {
                        let (root, cache_hit) = values[0].as_ref();
                        finish_root(&context, &repo_name, root.clone(), Some(*cache_hit), setter);
                    },
                    wrapped_logger,
                );
            }
            CheckoutType::ForeignFile => {
                let Some(info) = parse::parse_foreign_file_description(
                    resolved,
                    key,
                    context.fetch_absent,
                    &wrapped_logger,
                ) else {
                    return;
                };
                let context = context.clone();
                let repo_name = key.clone();
                context.foreign_file_git_map.clone().consume_after_keys_ready(
                    pool,
                    vec![info],
                    move |values| {
                        let (root, cache_hit) = values[0].as_ref();
                        finish_root(&context, &repo_name, root.clone(), Some(*cache_hit), setter);
                    },
                    wrapped_logger,
                );
            }
            CheckoutType::File => {
                file_checkout(&context, pool, key, resolved, setter, wrapped_logger);
            }
            CheckoutType::Distdir => {
                distdir_checkout(&context, pool, key, resolved, setter, wrapped_logger);
            }
            CheckoutType::GitTree => {
                let Some(tree_info) =
                    parse::parse_git_tree_description(resolved, key, &wrapped_logger)
                else {
                    return;
                };
                let info = TreeIdInfo {
                    tree_info,
                    ignore_special: pragma_special(resolved) == Some(PragmaSpecial::Ignore),
                    absent: !context.fetch_absent && pragma_flag(resolved, "absent"),
                };
                let context = context.clone();
                let repo_name = key.clone();
                context.tree_id_git_map.clone().consume_after_keys_ready(
                    pool,
                    vec![info],
                    move |values| {
                        let (root, cache_hit) = values[0].as_ref();
                        finish_root(&context, &repo_name, root.clone(), Some(*cache_hit), setter);
                    },
                    wrapped_logger,
                );
            }
            CheckoutType::Computed | CheckoutType::TreeStructure => {
                precomputed_checkout(
                    &context,
                    key,
                    kind,
                    resolved,
                    setter,
                    subcaller,
                    wrapped_logger,
                );
            }
        }
    })
}
