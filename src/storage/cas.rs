//! Local content-addressed store for raw blobs.
//!
//! Blobs are keyed by the hex git-blob SHA-1 of their contents and live in
//! a two-level sharded directory layout (`ab/cdef…`). Writes are
//! idempotent: content is staged to a temporary file in the store root and
//! renamed into place only after the digest has been verified, so a
//! half-written blob is never visible under its final name and concurrent
//! writers of the same content are harmless.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::{
    errors::SetupError,
    hash::{compute_hash, is_hex_hash},
    storage::chunker,
};

pub struct LocalCas {
    root: PathBuf,
}

impl LocalCas {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SetupError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalCas { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sharded location of a content hash; rejects anything that is not a
    /// 40-digit hex git-blob hash.
    fn object_path(&self, content: &str) -> Result<PathBuf, SetupError> {
        if content.len() != 40 {
            return Err(SetupError::Internal(format!(
                "Content hash {content:?} has wrong width"
            )));
        }
        is_hex_hash(content).map_err(SetupError::Internal)?;
        let (shard, rest) = content.split_at(2);
        Ok(self.root.join(shard).join(rest))
    }

    /// Whether a verified blob with this content hash is present.
    pub fn contains(&self, content: &str) -> bool {
        self.object_path(content)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Path of a stored blob, if present.
    pub fn blob_path(&self, content: &str) -> Option<PathBuf> {
        let path = self.object_path(content).ok()?;
        path.is_file().then_some(path)
    }

    /// Store `data`, returning its content hash.
    pub fn put(&self, data: &[u8]) -> Result<String, SetupError> {
        let content = compute_hash(data);
        self.install(data, &content)?;
        Ok(content)
    }

    /// Store `data` under `expected`, verifying the digest bit-exactly
    /// before the blob becomes visible.
    pub fn put_verified(&self, data: &[u8], expected: &str) -> Result<(), SetupError> {
        let actual = compute_hash(data);
        if actual != expected {
            return Err(SetupError::Verify {
                source_name: "blob".to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        self.install(data, expected)
    }

    fn install(&self, data: &[u8], content: &str) -> Result<(), SetupError> {
        let target = self.object_path(content)?;
        if target.is_file() {
            return Ok(());
        }
        fs::create_dir_all(target.parent().expect("sharded path has a parent"))?;
        let mut staged = NamedTempFile::new_in(&self.root)?;
        staged.write_all(data)?;
        staged.flush()?;
        match staged.persist(&target) {
            Ok(_) => Ok(()),
            // A concurrent writer won the rename; contents are identical.
            Err(err) if target.is_file() => {
                drop(err);
                Ok(())
            }
            Err(err) => Err(SetupError::Io(err.error)),
        }
    }

    /// Read a stored blob.
    pub fn read(&self, content: &str) -> Result<Vec<u8>, SetupError> {
        Ok(fs::read(self.object_path(content)?)?)
    }

    /// Split a stored blob into FastCDC chunks, storing each chunk as its
    /// own CAS entry, and return the chunk hashes in order. Consumers
    /// reassemble the blob by concatenating the chunk blobs.
    pub fn split_blob(
        &self,
        content: &str,
        average_chunk_size: usize,
    ) -> Result<Vec<String>, SetupError> {
        let file = fs::File::open(self.object_path(content)?)?;
        let mut file_chunker =
            chunker::FileChunker::with_average_size(std::io::BufReader::new(file), average_chunk_size);
        let mut chunk_ids = Vec::new();
        while let Some(chunk) = file_chunker.next_chunk()? {
            chunk_ids.push(self.put(&chunk)?);
        }
        Ok(chunk_ids)
    }
}
