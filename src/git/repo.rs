//! Bare Git cache repository.
//!
//! `GitCache` owns one bare repository directory used as the shared cache
//! for all materialized workspace roots. Local writes are loose objects
//! (zlib-deflated frames); refs are plain files. Anything involving remote
//! transport or packed objects shells out to the `git` binary, since pack
//! plumbing is outside this crate.
//!
//! Callers must serialize mutations per repository path through the
//! critical-op map; this type itself takes no locks.

use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::Command,
};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use crate::{
    errors::SetupError,
    git::object::{
        ObjectId, ObjectKind, TreeItem, TreeItemMode, commit_payload, hash_object, loose_frame,
        parse_frame, parse_tree, tree_payload,
    },
};

pub struct GitCache {
    root: PathBuf,
}

impl GitCache {
    /// Open the bare repository at `root`, initializing it if absent.
    /// Idempotent.
    pub fn open_or_init(root: impl Into<PathBuf>) -> Result<Self, SetupError> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs").join("heads"))?;
        fs::create_dir_all(root.join("refs").join("tags"))?;
        let head = root.join("HEAD");
        if !head.exists() {
            fs::write(&head, "ref: refs/heads/master\n")?;
        }
        let config = root.join("config");
        if !config.exists() {
            fs::write(
                &config,
                "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n",
            )?;
        }
        Ok(GitCache { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.hex();
        let (shard, rest) = hex.split_at(2);
        self.root.join("objects").join(shard).join(rest)
    }

    /// Whether `id` exists as a loose object.
    pub fn contains_object(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    /// Write a loose object; returns its id. Idempotent.
    pub fn write_object(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId, SetupError> {
        let id = hash_object(kind, payload);
        let target = self.object_path(&id);
        if target.is_file() {
            return Ok(id);
        }
        fs::create_dir_all(target.parent().expect("object path has a parent"))?;
        let mut staged = tempfile::NamedTempFile::new_in(self.root.join("objects"))?;
        {
            let mut encoder = ZlibEncoder::new(&mut staged, Compression::default());
            encoder.write_all(&loose_frame(kind, payload))?;
            encoder.finish()?;
        }
        match staged.persist(&target) {
            Ok(_) => Ok(id),
            Err(err) if target.is_file() => {
                drop(err);
                Ok(id)
            }
            Err(err) => Err(SetupError::Io(err.error)),
        }
    }

    /// Read a loose object back.
    pub fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>), SetupError> {
        let compressed = fs::read(self.object_path(id))?;
        let mut framed = Vec::new();
        ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut framed)?;
        parse_frame(&framed)
    }

    pub fn put_blob(&self, data: &[u8]) -> Result<ObjectId, SetupError> {
        self.write_object(ObjectKind::Blob, data)
    }

    pub fn put_tree(&self, items: Vec<TreeItem>) -> Result<ObjectId, SetupError> {
        self.write_object(ObjectKind::Tree, &tree_payload(items))
    }

    /// Create the anchoring root commit for `tree_id`. Deterministic: the
    /// commit id is a function of the tree and message alone.
    pub fn commit_tree(&self, tree_id: &ObjectId, message: &str) -> Result<ObjectId, SetupError> {
        self.write_object(ObjectKind::Commit, &commit_payload(tree_id, message))
    }

    /// Write `refs/tags/keep-<id>` pointing at `id`, anchoring it against
    /// garbage collection.
    pub fn keep_tag(&self, id: &ObjectId) -> Result<String, SetupError> {
        let name = format!("refs/tags/keep-{}", id.hex());
        self.write_ref(&name, id)?;
        Ok(name)
    }

    pub fn write_ref(&self, name: &str, id: &ObjectId) -> Result<(), SetupError> {
        let path = self.root.join(name);
        fs::create_dir_all(path.parent().expect("ref path has a parent"))?;
        fs::write(path, format!("{}\n", id.hex()))?;
        Ok(())
    }

    pub fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, SetupError> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(content.trim().parse()?))
    }

    /// Resolve HEAD to an object id, if the pointed-to branch exists.
    pub fn head_id(&self) -> Result<Option<ObjectId>, SetupError> {
        let head = fs::read_to_string(self.root.join("HEAD"))?;
        let head = head.trim();
        if let Some(refname) = head.strip_prefix("ref: ") {
            return self.read_ref(refname.trim());
        }
        Ok(Some(head.parse()?))
    }

    /// Full refname of a local branch, if it exists.
    pub fn branch_refname(&self, branch: &str) -> Result<Option<String>, SetupError> {
        let refname = format!("refs/heads/{branch}");
        if self.root.join(&refname).is_file() {
            Ok(Some(refname))
        } else {
            Ok(None)
        }
    }

    /// Import a directory as a tree object, recursively. Symlinks become
    /// link entries; with `ignore_special` they (and any other non-regular
    /// entries) are silently skipped instead.
    pub fn import_directory(
        &self,
        dir: &Path,
        ignore_special: bool,
    ) -> Result<ObjectId, SetupError> {
        let mut items = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let file_type = entry.file_type()?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|name| SetupError::Schema(format!("Non-UTF8 file name {name:?}")))?;
            if file_type.is_dir() {
                let id = self.import_directory(&entry.path(), ignore_special)?;
                items.push(TreeItem { mode: TreeItemMode::Tree, name, id });
            } else if file_type.is_symlink() {
                if ignore_special {
                    continue;
                }
                let target = fs::read_link(entry.path())?;
                let id = self.put_blob(target.to_string_lossy().as_bytes())?;
                items.push(TreeItem { mode: TreeItemMode::Link, name, id });
            } else if file_type.is_file() {
                let data = fs::read(entry.path())?;
                let id = self.put_blob(&data)?;
                let mode = if is_executable(&entry.path())? {
                    TreeItemMode::BlobExecutable
                } else {
                    TreeItemMode::Blob
                };
                items.push(TreeItem { mode, name, id });
            } else if !ignore_special {
                return Err(SetupError::Schema(format!(
                    "Unsupported special file {:?}",
                    entry.path()
                )));
            }
        }
        self.put_tree(items)
    }

    /// Descend from a tree id along `subdir` components to a subtree id.
    pub fn resolve_subtree(&self, root: &ObjectId, subdir: &str) -> Result<ObjectId, SetupError> {
        let mut current = *root;
        for component in subdir.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            let (kind, payload) = self.read_object(&current)?;
            if kind != ObjectKind::Tree {
                return Err(SetupError::Schema(format!(
                    "Path component {component:?} does not name a tree"
                )));
            }
            let items = parse_tree(&payload)?;
            let item = items
                .iter()
                .find(|item| item.name == component && item.mode == TreeItemMode::Tree)
                .ok_or_else(|| {
                    SetupError::Schema(format!("Subdir component {component:?} not found"))
                })?;
            current = item.id;
        }
        Ok(current)
    }

    // --- operations that go through the git binary ---

    fn git_cli(&self, git_bin: &str, args: &[&str]) -> Result<String, SetupError> {
        let output = Command::new(git_bin)
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()?;
        if !output.status.success() {
            return Err(SetupError::Op(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Fetch `branch` (or everything, if `None`) from `url` into the cache.
    /// A non-empty `inherit_env` restricts the subprocess environment to
    /// the listed variables (plus PATH and HOME).
    pub fn fetch(
        &self,
        git_bin: &str,
        url: &str,
        branch: Option<&str>,
        inherit_env: &[String],
    ) -> Result<(), SetupError> {
        let mut command = Command::new(git_bin);
        command
            .arg("-C")
            .arg(&self.root)
            .args(["fetch", "--no-auto-gc", "--no-write-fetch-head"])
            .arg(url);
        if let Some(branch) = branch {
            command.arg(branch);
        }
        if !inherit_env.is_empty() {
            command.env_clear();
            for name in ["PATH", "HOME"].iter().map(|s| s.to_string()).chain(inherit_env.iter().cloned()) {
                if let Ok(value) = std::env::var(&name) {
                    command.env(&name, value);
                }
            }
        }
        let output = command.output()?;
        if !output.status.success() {
            return Err(SetupError::Op(format!(
                "git fetch {url} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Whether `spec` resolves to an object, loose or packed.
    pub fn object_exists(&self, git_bin: &str, spec: &str) -> bool {
        self.git_cli(git_bin, &["cat-file", "-e", spec]).is_ok()
    }

    /// Tree id of `commit:subdir`, via rev-parse (works on packed objects).
    pub fn commit_subtree(
        &self,
        git_bin: &str,
        commit: &str,
        subdir: &str,
    ) -> Result<String, SetupError> {
        let spec = if subdir.is_empty() || subdir == "." {
            format!("{commit}^{{tree}}")
        } else {
            format!("{commit}:{subdir}")
        };
        self.git_cli(git_bin, &["rev-parse", &spec])
    }

    /// Tag `commit` with a keep tag through git itself; used after fetches
    /// where the commit may only exist in a pack.
    pub fn keep_tag_cli(&self, git_bin: &str, commit: &str) -> Result<(), SetupError> {
        self.git_cli(
            git_bin,
            &["tag", "-f", &format!("keep-{commit}"), commit],
        )
        .map(|_| ())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Result<bool, SetupError> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> Result<bool, SetupError> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_cache() -> (tempfile::TempDir, GitCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = GitCache::open_or_init(dir.path().join("git")).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("git");
        GitCache::open_or_init(&root).unwrap();
        let cache = GitCache::open_or_init(&root).unwrap();
        assert!(cache.root().join("HEAD").is_file());
        assert!(cache.head_id().unwrap().is_none());
    }

    #[test]
    fn test_loose_object_round_trip() {
        let (_dir, cache) = scratch_cache();
        let id = cache.put_blob(b"contents").unwrap();
        assert!(cache.contains_object(&id));
        let (kind, payload) = cache.read_object(&id).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(payload, b"contents");
    }

    #[test]
    fn test_import_directory_and_resolve_subtree() {
        let (dir, cache) = scratch_cache();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("top.txt"), "top").unwrap();
        fs::write(src.join("nested").join("inner.txt"), "inner").unwrap();

        let root = cache.import_directory(&src, false).unwrap();
        let nested = cache.resolve_subtree(&root, "nested").unwrap();
        let (_, payload) = cache.read_object(&nested).unwrap();
        let items = parse_tree(&payload).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "inner.txt");

        // importing the same directory again yields the same tree
        assert_eq!(cache.import_directory(&src, false).unwrap(), root);
    }

    #[cfg(unix)]
    #[test]
    fn test_import_symlink_modes() {
        use std::os::unix::fs::symlink;

        let (dir, cache) = scratch_cache();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("plain.txt"), "plain").unwrap();
        symlink("plain.txt", src.join("link")).unwrap();

        let kept = cache.import_directory(&src, false).unwrap();
        let (_, payload) = cache.read_object(&kept).unwrap();
        let items = parse_tree(&payload).unwrap();
        assert!(items.iter().any(|i| i.mode == TreeItemMode::Link));

        let ignored = cache.import_directory(&src, true).unwrap();
        let (_, payload) = cache.read_object(&ignored).unwrap();
        let items = parse_tree(&payload).unwrap();
        assert!(items.iter().all(|i| i.mode != TreeItemMode::Link));
        assert_ne!(kept, ignored);
    }

    #[test]
    fn test_keep_tag_and_refs() {
        let (_dir, cache) = scratch_cache();
        let tree = cache.put_tree(Vec::new()).unwrap();
        let commit = cache.commit_tree(&tree, "anchor tree").unwrap();
        let refname = cache.keep_tag(&commit).unwrap();
        assert_eq!(cache.read_ref(&refname).unwrap(), Some(commit));

        cache.write_ref("refs/heads/main", &commit).unwrap();
        assert_eq!(
            cache.branch_refname("main").unwrap().as_deref(),
            Some("refs/heads/main")
        );
        assert_eq!(cache.branch_refname("absent").unwrap(), None);
    }
}
