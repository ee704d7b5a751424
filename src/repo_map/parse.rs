//! Parsers turning repository descriptions into the root-map keys.
//!
//! Each parser goes through the field reader, so a malformed description
//! produces exactly one fatal message naming the repository, and no
//! partially-filled key ever reaches a map.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    config::{
        field_reader::FieldReader,
        pragmas::{PragmaSpecial, pragma_flag, pragma_special},
    },
    consumer::Logger,
    hash::is_hex_hash,
    ops_maps::{content_cas::ArchiveContent, git_tree_fetch::GitTreeInfo},
    root_maps::{commit_git::GitRepoInfo, content_git::ArchiveRepoInfo,
        foreign_file_git::ForeignFileInfo},
};

/// Normalize a `subdir` field: no absolute paths, no upward components;
/// empty and `.` both mean the root of the tree.
pub fn normalize_subdir(raw: &str) -> Option<String> {
    let mut components: Vec<&str> = Vec::new();
    if raw.starts_with('/') {
        return None;
    }
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop()?;
            }
            other => components.push(other),
        }
    }
    Some(if components.is_empty() {
        ".".to_string()
    } else {
        components.join("/")
    })
}

fn read_subdir(reader: &FieldReader<'_>, logger: &Logger) -> Option<String> {
    let raw = reader.read_optional_string("subdir")?;
    let raw = raw.unwrap_or_default();
    match normalize_subdir(&raw) {
        Some(subdir) => Some(subdir),
        None => {
            logger(
                &format!("Expected field \"subdir\" to be a non-upwards relative path, found {raw:?}"),
                true,
            );
            None
        }
    }
}

fn read_content_hash(reader: &FieldReader<'_>, logger: &Logger) -> Option<String> {
    let content = reader.read_string("content")?;
    if let Err(msg) = is_hex_hash(&content) {
        logger(
            &format!("Unsupported value for mandatory field \"content\": {msg}"),
            true,
        );
        return None;
    }
    Some(content)
}

/// Parse the fetch-relevant fields shared by `archive`, `zip` and
/// `foreign file` descriptions.
pub fn parse_archive_content(
    desc: &Value,
    origin: &str,
    logger: &Logger,
) -> Option<ArchiveContent> {
    let reader = FieldReader::create(desc, origin, "repository", logger.clone())?;
    let content_hash = read_content_hash(&reader, logger)?;
    let fetch_url = reader.read_string("fetch")?;
    let distfile = reader.read_optional_string("distfile")?;
    let sha256 = reader.read_optional_string("sha256")?;
    let sha512 = reader.read_optional_string("sha512")?;
    let mirrors = reader.read_string_list("mirrors")?;
    Some(ArchiveContent {
        content_hash,
        distfile,
        fetch_url,
        mirrors,
        sha256,
        sha512,
        origin: origin.to_string(),
    })
}

/// Parse an `archive`/`zip` description into its root key.
pub fn parse_archive_description(
    desc: &Value,
    repo_type: &str,
    origin: &str,
    fetch_absent: bool,
    logger: &Logger,
) -> Option<ArchiveRepoInfo> {
    let archive = parse_archive_content(desc, origin, logger)?;
    let reader = FieldReader::create(desc, origin, "repository", logger.clone())?;
    reader.expect_fields(&[
        "type", "content", "fetch", "subdir", "distfile", "sha256", "sha512", "mirrors", "pragma",
    ]);
    let subdir = read_subdir(&reader, logger)?;
    Some(ArchiveRepoInfo {
        archive,
        repo_type: repo_type.to_string(),
        subdir,
        pragma_special: pragma_special(desc),
        absent: !fetch_absent && pragma_flag(desc, "absent"),
    })
}

/// Parse a `foreign file` description into its root key.
pub fn parse_foreign_file_description(
    desc: &Value,
    origin: &str,
    fetch_absent: bool,
    logger: &Logger,
) -> Option<ForeignFileInfo> {
    let archive = parse_archive_content(desc, origin, logger)?;
    let reader = FieldReader::create(desc, origin, "repository", logger.clone())?;
    let name = reader.read_string("name")?;
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        logger(&format!("Field \"name\" is not a valid file name: {name:?}"), true);
        return None;
    }
    let executable = match desc.get("executable") {
        None => false,
        Some(Value::Bool(executable)) => *executable,
        Some(other) => {
            logger(
                &format!("Unsupported value {other} for optional field \"executable\""),
                true,
            );
            return None;
        }
    };
    Some(ForeignFileInfo {
        archive,
        name,
        executable,
        absent: !fetch_absent && pragma_flag(desc, "absent"),
    })
}

/// Parse a `git` description into its root key.
pub fn parse_git_description(
    desc: &Value,
    origin: &str,
    fetch_absent: bool,
    logger: &Logger,
) -> Option<GitRepoInfo> {
    let reader = FieldReader::create(desc, origin, "repository", logger.clone())?;
    reader.expect_fields(&[
        "type", "commit", "repository", "branch", "subdir", "mirrors", "inherit env", "pragma",
    ]);
    let commit = reader.read_string("commit")?;
    if let Err(msg) = is_hex_hash(&commit) {
        logger(
            &format!("Unsupported value for mandatory field \"commit\": {msg}"),
            true,
        );
        return None;
    }
    let repo_url = reader.read_string("repository")?;
    let branch = reader.read_string("branch")?;
    let subdir = read_subdir(&reader, logger)?;
    let mirrors = reader.read_string_list("mirrors")?;
    let inherit_env = reader.read_string_list("inherit env")?;
    Some(GitRepoInfo {
        hash: commit,
        repo_url,
        branch,
        subdir,
        mirrors,
        inherit_env,
        origin: origin.to_string(),
        ignore_special: pragma_special(desc) == Some(PragmaSpecial::Ignore),
        absent: !fetch_absent && pragma_flag(desc, "absent"),
    })
}

/// Parse a `git tree` description into the tree-fetch key.
pub fn parse_git_tree_description(
    desc: &Value,
    origin: &str,
    logger: &Logger,
) -> Option<GitTreeInfo> {
    let reader = FieldReader::create(desc, origin, "repository", logger.clone())?;
    reader.expect_fields(&["type", "id", "cmd", "env", "inherit env", "pragma"]);
    let tree_id = reader.read_string("id")?;
    if let Err(msg) = is_hex_hash(&tree_id) {
        logger(&format!("Unsupported value for mandatory field \"id\": {msg}"), true);
        return None;
    }
    let command = reader.read_string_list("cmd")?;
    if command.is_empty() {
        logger("Mandatory field \"cmd\" must be a non-empty list", true);
        return None;
    }
    let mut env_vars = BTreeMap::new();
    match desc.get("env") {
        None => {}
        Some(Value::Object(map)) => {
            for (name, value) in map {
                match value.as_str() {
                    Some(value) => {
                        env_vars.insert(name.clone(), value.to_string());
                    }
                    None => {
                        logger(
                            &format!("Unsupported value {value} for variable {name:?} in \"env\""),
                            true,
                        );
                        return None;
                    }
                }
            }
        }
        Some(other) => {
            logger(&format!("Unsupported value {other} for optional field \"env\""), true);
            return None;
        }
    }
    let inherit_env = reader.read_string_list("inherit env")?;
    Some(GitTreeInfo {
        hash: tree_id,
        env_vars,
        inherit_env,
        command,
        origin: origin.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::consumer::make_logger;

    fn sink_logger() -> (Arc<Mutex<Vec<(String, bool)>>>, Logger) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let logger = {
            let sink = sink.clone();
            make_logger(move |msg, fatal| sink.lock().unwrap().push((msg.to_string(), fatal)))
        };
        (sink, logger)
    }

    #[test]
    fn test_normalize_subdir() {
        assert_eq!(normalize_subdir("").as_deref(), Some("."));
        assert_eq!(normalize_subdir("./a/b/.").as_deref(), Some("a/b"));
        assert_eq!(normalize_subdir("a/../b").as_deref(), Some("b"));
        assert_eq!(normalize_subdir("../x"), None);
        assert_eq!(normalize_subdir("/abs"), None);
    }

    #[test]
    fn test_parse_archive_description() {
        let (_, logger) = sink_logger();
        let desc = json!({
            "type": "archive",
            "content": "30d74d258442c7c65512eafab474568dd706c430",
            "fetch": "https://example.com/a.tar.gz",
            "subdir": "src",
            "sha256": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
            "mirrors": ["https://mirror.example.com/a.tar.gz"],
            "pragma": {"special": "ignore", "absent": true}
        });
        let info = parse_archive_description(&desc, "archive", "r", false, &logger).unwrap();
        assert_eq!(info.subdir, "src");
        assert_eq!(info.pragma_special, Some(PragmaSpecial::Ignore));
        assert!(info.absent);
        assert_eq!(info.archive.mirrors.len(), 1);
        assert!(info.archive.sha256.is_some());

        // fetch_absent overrides the absent pragma
        let fetched = parse_archive_description(&desc, "archive", "r", true, &logger).unwrap();
        assert!(!fetched.absent);
    }

    #[test]
    fn test_parse_archive_missing_content_is_single_fatal() {
        let (sink, logger) = sink_logger();
        let desc = json!({"type": "archive", "fetch": "https://example.com/a.tar"});
        assert!(parse_archive_description(&desc, "archive", "r", false, &logger).is_none());
        let sink = sink.lock().unwrap();
        assert_eq!(sink.len(), 1);
        assert!(sink[0].1);
        assert!(sink[0].0.contains("content"));
    }

    #[test]
    fn test_parse_git_description() {
        let (_, logger) = sink_logger();
        let desc = json!({
            "type": "git",
            "commit": "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3",
            "repository": "https://example.com/repo.git",
            "branch": "main",
            "inherit env": ["SSH_AUTH_SOCK"]
        });
        let info = parse_git_description(&desc, "r", false, &logger).unwrap();
        assert_eq!(info.branch, "main");
        assert_eq!(info.subdir, ".");
        assert_eq!(info.inherit_env, vec!["SSH_AUTH_SOCK"]);
        assert!(!info.ignore_special);
    }

    #[test]
    fn test_parse_git_tree_description() {
        let (_, logger) = sink_logger();
        let desc = json!({
            "type": "git tree",
            "id": "4b825dc642cb6eb9a060e54bf8d69288fbee4904",
            "cmd": ["sh", "-c", "true"],
            "env": {"OUT": "tree"}
        });
        let info = parse_git_tree_description(&desc, "r", &logger).unwrap();
        assert_eq!(info.command.len(), 3);
        assert_eq!(info.env_vars.get("OUT").map(String::as_str), Some("tree"));
    }

    #[test]
    fn test_parse_foreign_file_rejects_bad_name() {
        let (sink, logger) = sink_logger();
        let desc = json!({
            "type": "foreign file",
            "content": "30d74d258442c7c65512eafab474568dd706c430",
            "fetch": "https://example.com/f",
            "name": "a/b"
        });
        assert!(parse_foreign_file_description(&desc, "r", false, &logger).is_none());
        assert!(sink.lock().unwrap().iter().any(|(m, f)| *f && m.contains("name")));
    }
}
