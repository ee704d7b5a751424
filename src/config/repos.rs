//! Parsed multi-repository configuration.
//!
//! Wraps the input JSON: a `repositories` object mapping repository names
//! to entries of the form `{"repository": <description or alias>, ...}`,
//! plus an optional top-level `main`. Alias resolution runs a full
//! fixed point with a visit set, so arbitrarily long alias chains work
//! and any cycle is rejected.

use std::collections::{BTreeSet, HashSet, VecDeque};

use serde_json::{Map, Value};

use crate::errors::SetupError;

/// Take-over fields: copied verbatim from the input entry to the emitted
/// configuration when present.
pub const TAKE_OVER_FIELDS: [&str; 7] = [
    "target_root",
    "rule_root",
    "expression_root",
    "target_file_name",
    "rule_file_name",
    "expression_file_name",
    "bindings",
];

/// Take-over fields whose value may name another repository; the driver
/// rewrites them to that repository's workspace root after setup.
pub const ALT_DIR_FIELDS: [&str; 3] = ["target_root", "rule_root", "expression_root"];

pub struct RepositoryConfig {
    repositories: Map<String, Value>,
    main: Option<String>,
}

impl RepositoryConfig {
    /// Parse the top-level configuration object.
    pub fn from_json(config: &Value) -> Result<Self, SetupError> {
        let object = config
            .as_object()
            .ok_or_else(|| SetupError::Schema("Configuration is not an object".to_string()))?;
        let repositories = match object.get("repositories") {
            None => Map::new(),
            Some(value) => value
                .as_object()
                .ok_or_else(|| {
                    SetupError::Schema("Field \"repositories\" is not an object".to_string())
                })?
                .clone(),
        };
        let main = match object.get("main") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(SetupError::Schema(format!(
                    "Unsupported value {other} for field \"main\""
                )));
            }
        };
        Ok(RepositoryConfig { repositories, main })
    }

    pub fn main(&self) -> Option<&str> {
        self.main.as_deref()
    }

    pub fn repository_names(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }

    /// Full entry for a repository (including take-over fields).
    pub fn repo_entry(&self, name: &str) -> Option<&Value> {
        self.repositories.get(name)
    }

    /// The `repository` field of an entry, unresolved.
    pub fn repository_desc(&self, name: &str) -> Option<&Value> {
        self.repo_entry(name)?.get("repository")
    }

    /// Resolve a repository description through alias indirections: a
    /// description that is a string names another repository whose
    /// description is taken instead, to a fixed point. A revisited name is
    /// a cycle.
    pub fn resolve_repo_desc<'a>(
        &'a self,
        desc: &'a Value,
        origin: &str,
    ) -> Result<&'a Value, SetupError> {
        let mut desc = desc;
        let mut visited: HashSet<&str> = HashSet::new();
        while let Some(alias) = desc.as_str() {
            if !visited.insert(alias) {
                return Err(SetupError::Cycle(format!("{origin:?} (via {alias:?})")));
            }
            desc = self
                .repository_desc(alias)
                .ok_or_else(|| SetupError::UnknownRepository(alias.to_string()))?;
        }
        Ok(desc)
    }

    /// The main repository to set up: the explicit override, the
    /// configured `main`, or the lexicographically smallest name.
    pub fn effective_main(&self, override_main: Option<&str>) -> Option<String> {
        override_main
            .map(str::to_string)
            .or_else(|| self.main.clone())
            .or_else(|| self.repositories.keys().next().cloned())
    }

    /// All repositories reachable from `start`: through alias chains,
    /// bindings, take-over roots naming repositories, distdir entry lists
    /// and precomputed-root references.
    pub fn reachable_repositories(&self, start: &str) -> Result<BTreeSet<String>, SetupError> {
        let mut reachable = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start.to_string());
        while let Some(name) = queue.pop_front() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            let entry = self
                .repo_entry(&name)
                .ok_or_else(|| SetupError::UnknownRepository(name.clone()))?;
            let mut found: Vec<String> = Vec::new();
            if let Some(bindings) = entry.get("bindings").and_then(Value::as_object) {
                found.extend(
                    bindings
                        .values()
                        .filter_map(Value::as_str)
                        .map(str::to_string),
                );
            }
            for field in ALT_DIR_FIELDS {
                if let Some(root) = entry.get(field).and_then(Value::as_str) {
                    found.push(root.to_string());
                }
            }
            if let Some(desc) = entry.get("repository") {
                if let Some(alias) = desc.as_str() {
                    found.push(alias.to_string());
                }
                let resolved = self.resolve_repo_desc(desc, &name)?;
                match resolved.get("type").and_then(Value::as_str) {
                    Some("distdir") => {
                        if let Some(list) = resolved.get("repositories").and_then(Value::as_array) {
                            found.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
                        }
                    }
                    Some("computed") | Some("tree structure") => {
                        if let Some(target) = resolved.get("repo").and_then(Value::as_str) {
                            found.push(target.to_string());
                        }
                    }
                    _ => {}
                }
            }
            for next in found {
                if !reachable.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(reachable)
    }
}
