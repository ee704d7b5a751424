//! Loose Git object model: ids, tree entries, commit serialization.
//!
//! Objects are framed as `"<type> <len>\0" || payload` and addressed by the
//! SHA-1 of the frame, which is exactly how Git stores loose objects. Only
//! the object kinds this crate writes are modeled; pack files are not.

use std::{fmt::Display, str::FromStr};

use sha1::{Digest, Sha1};

use crate::errors::SetupError;

/// SHA-1 object id of the Git cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub [u8; 20]);

impl ObjectId {
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}

impl FromStr for ObjectId {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(SetupError::Schema(format!("Invalid object id {s:?}")));
        }
        let bytes = hex::decode(s).map_err(|e| SetupError::Schema(e.to_string()))?;
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(ObjectId(id))
    }
}

/// Object kinds written by the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    pub fn from_header(s: &str) -> Result<Self, SetupError> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(SetupError::Schema(format!(
                "The `{other}` is not a supported git object type."
            ))),
        }
    }
}

/// Frame a payload the way loose objects are stored.
pub fn loose_frame(kind: ObjectKind, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 16);
    framed.extend(kind.as_str().as_bytes());
    framed.push(b' ');
    framed.extend(payload.len().to_string().as_bytes());
    framed.push(0);
    framed.extend(payload);
    framed
}

/// Id of a framed object.
pub fn hash_object(kind: ObjectKind, payload: &[u8]) -> ObjectId {
    let digest = Sha1::digest(loose_frame(kind, payload));
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest);
    ObjectId(id)
}

/// Entry modes occurring in cache trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeItemMode {
    Blob,
    BlobExecutable,
    Link,
    Tree,
}

impl TreeItemMode {
    /// Octal mode string as serialized into tree payloads (no leading zero).
    pub const fn as_bytes(&self) -> &'static [u8] {
        match self {
            TreeItemMode::Blob => b"100644",
            TreeItemMode::BlobExecutable => b"100755",
            TreeItemMode::Link => b"120000",
            TreeItemMode::Tree => b"40000",
        }
    }
}

/// One entry of a tree object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeItem {
    pub mode: TreeItemMode,
    pub name: String,
    pub id: ObjectId,
}

/// Serialize tree entries into the canonical tree payload.
///
/// Git sorts entries by name bytes, with directories compared as if their
/// name carried a trailing `/`.
pub fn tree_payload(mut items: Vec<TreeItem>) -> Vec<u8> {
    items.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    let mut payload = Vec::new();
    for item in &items {
        payload.extend(item.mode.as_bytes());
        payload.push(b' ');
        payload.extend(item.name.as_bytes());
        payload.push(0);
        payload.extend(item.id.0);
    }
    payload
}

fn sort_key(item: &TreeItem) -> Vec<u8> {
    let mut key = item.name.as_bytes().to_vec();
    if item.mode == TreeItemMode::Tree {
        key.push(b'/');
    }
    key
}

/// Serialize a root commit for `tree_id` with a fixed signature.
///
/// The cache only ever writes anchoring commits whose identity must be a
/// function of the tree alone, so author and committer carry the epoch
/// timestamp.
pub fn commit_payload(tree_id: &ObjectId, message: &str) -> Vec<u8> {
    let signature = "repoforge <setup@repoforge.invalid> 0 +0000";
    let mut payload = Vec::new();
    payload.extend(format!("tree {}\n", tree_id.hex()).as_bytes());
    payload.extend(format!("author {signature}\n").as_bytes());
    payload.extend(format!("committer {signature}\n").as_bytes());
    payload.push(b'\n');
    payload.extend(message.as_bytes());
    if !message.ends_with('\n') {
        payload.push(b'\n');
    }
    payload
}

/// Parse a loose frame back into kind and payload.
pub fn parse_frame(framed: &[u8]) -> Result<(ObjectKind, Vec<u8>), SetupError> {
    let nul = framed
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| SetupError::Schema("Loose object header missing NUL".to_string()))?;
    let header = std::str::from_utf8(&framed[..nul])
        .map_err(|e| SetupError::Schema(e.to_string()))?;
    let (kind, len) = header
        .split_once(' ')
        .ok_or_else(|| SetupError::Schema(format!("Malformed loose header {header:?}")))?;
    let kind = ObjectKind::from_header(kind)?;
    let len: usize = len
        .parse()
        .map_err(|_| SetupError::Schema(format!("Malformed loose length {len:?}")))?;
    let payload = framed[nul + 1..].to_vec();
    if payload.len() != len {
        return Err(SetupError::Schema(format!(
            "Loose object length mismatch: header {len}, payload {}",
            payload.len()
        )));
    }
    Ok((kind, payload))
}

/// Iterate the entries of a tree payload.
pub fn parse_tree(payload: &[u8]) -> Result<Vec<TreeItem>, SetupError> {
    let mut items = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| SetupError::Schema("Not a valid git tree object.".to_string()))?;
        let mode = match &rest[..space] {
            b"100644" => TreeItemMode::Blob,
            b"100755" => TreeItemMode::BlobExecutable,
            b"120000" => TreeItemMode::Link,
            b"40000" | b"040000" => TreeItemMode::Tree,
            other => {
                return Err(SetupError::Schema(format!(
                    "The `{}` is not a valid git tree item mode.",
                    String::from_utf8_lossy(other)
                )));
            }
        };
        rest = &rest[space + 1..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| SetupError::Schema("Not a valid git tree object.".to_string()))?;
        let name = String::from_utf8(rest[..nul].to_vec())
            .map_err(|e| SetupError::Schema(e.to_string()))?;
        rest = &rest[nul + 1..];
        if rest.len() < 20 {
            return Err(SetupError::Schema("Truncated git tree entry.".to_string()));
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&rest[..20]);
        rest = &rest[20..];
        items.push(TreeItem { mode, name, id: ObjectId(id) });
    }
    Ok(items)
}
