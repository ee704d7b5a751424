//! Map ensuring archive contents are present in the local CAS.
//!
//! For a content hash, the sources are consulted in order: the CAS itself,
//! configured distdirs, the serve endpoint, then the fetch URL and its
//! mirrors. The first verified source wins; every stored blob is verified
//! bit-exactly against the content hash (and the optional `sha256` /
//! `sha512` checksums) before it becomes visible.

use std::{
    hash::{Hash, Hasher},
    path::PathBuf,
    sync::Arc,
};

use crate::{
    consumer::AsyncMapConsumer,
    fetch::{Fetcher, distfile_name},
    hash::{HashType, compute_hash, one_shot, sha512_hex},
    serve::ServeApi,
    storage::{
        cas::LocalCas,
        operation_cache::{Operation, OperationCache},
    },
};

/// Everything needed to obtain one archive blob. Equality and hashing are
/// by `content_hash` alone; the remaining fields are advisory fetch hints.
#[derive(Clone, Debug)]
pub struct ArchiveContent {
    pub content_hash: String,
    pub distfile: Option<String>,
    pub fetch_url: String,
    pub mirrors: Vec<String>,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    /// Repository this work is done for; used in diagnostics.
    pub origin: String,
}

impl PartialEq for ArchiveContent {
    fn eq(&self, other: &Self) -> bool {
        self.content_hash == other.content_hash
    }
}

impl Eq for ArchiveContent {}

impl Hash for ArchiveContent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content_hash.hash(state);
    }
}

pub struct ContentCasContext {
    pub cas: Arc<LocalCas>,
    pub fetcher: Arc<Fetcher>,
    pub distdirs: Vec<PathBuf>,
    pub additional_mirrors: Vec<String>,
    pub serve: Option<Arc<dyn ServeApi>>,
    pub operations: Arc<OperationCache>,
}

impl ContentCasContext {
    /// Verify candidate bytes against all advertised digests and store
    /// them. Returns an error message on any mismatch.
    fn verify_and_store(
        &self,
        key: &ArchiveContent,
        source_name: &str,
        data: &[u8],
    ) -> Result<(), String> {
        let actual = compute_hash(data);
        if actual != key.content_hash {
            return Err(format!(
                "Hash mismatch for {source_name}: expected {}, got {actual}",
                key.content_hash
            ));
        }
        if let Some(expected) = &key.sha256 {
            let actual = one_shot(HashType::Sha256, data).hex();
            if actual != *expected {
                return Err(format!(
                    "SHA256 mismatch for {source_name}: expected {expected}, got {actual}"
                ));
            }
        }
        if let Some(expected) = &key.sha512 {
            let actual = sha512_hex(data);
            if actual != *expected {
                return Err(format!(
                    "SHA512 mismatch for {source_name}: expected {expected}, got {actual}"
                ));
            }
        }
        self.cas
            .put_verified(data, &key.content_hash)
            .map_err(|e| e.to_string())
    }

    /// Look for the distfile in the configured distdirs; a present but
    /// mismatching file is skipped (it may belong to another archive).
    fn from_distdirs(&self, key: &ArchiveContent) -> Option<Vec<u8>> {
        let name = distfile_name(key.distfile.as_deref(), &key.fetch_url)?;
        for distdir in &self.distdirs {
            let candidate = distdir.join(&name);
            if !candidate.is_file() {
                continue;
            }
            match std::fs::read(&candidate) {
                Ok(data) if compute_hash(&data) == key.content_hash => return Some(data),
                Ok(_) => {
                    tracing::debug!("distfile {candidate:?} does not match {}", key.content_hash);
                }
                Err(err) => tracing::warn!("reading distfile {candidate:?}: {err}"),
            }
        }
        None
    }
}

/// Fetched contents carry no payload; resolving the key is the guarantee
/// that the blob is in the local CAS.
pub type ContentCasMap = AsyncMapConsumer<ArchiveContent, ()>;

pub fn create_content_cas_map(context: Arc<ContentCasContext>) -> ContentCasMap {
    AsyncMapConsumer::new(move |_pool, setter, logger, _subcaller, key: &ArchiveContent| {
        // 1. already in CAS
        if context.cas.contains(&key.content_hash) {
            setter.set(());
            return;
        }
        let operation_name = format!("fetch:{}", key.content_hash);
        context
            .operations
            .set(&operation_name, Operation::started(key.fetch_url.as_str()));
        // 2. local distdirs
        if let Some(data) = context.from_distdirs(key) {
            match context.verify_and_store(key, "distfile", &data) {
                Ok(()) => {
                    context.operations.finish(&operation_name);
                    setter.set(());
                }
                Err(msg) => logger(&msg, true),
            }
            return;
        }
        // 3. serve endpoint
        if let Some(serve) = &context.serve {
            if let Some(data) = serve.provide_content(&key.content_hash) {
                match context.verify_and_store(key, "serve endpoint", &data) {
                    Ok(()) => {
                        context.operations.finish(&operation_name);
                        setter.set(());
                    }
                    Err(msg) => logger(&msg, true),
                }
                return;
            }
        }
        // 4. fetch URL, then mirrors
        let urls: Vec<&str> = std::iter::once(key.fetch_url.as_str())
            .chain(key.mirrors.iter().map(String::as_str))
            .chain(context.additional_mirrors.iter().map(String::as_str))
            .collect();
        match context.fetcher.download_any(urls) {
            Ok(data) => match context.verify_and_store(key, &key.fetch_url, &data) {
                Ok(()) => {
                    context.operations.finish(&operation_name);
                    setter.set(());
                }
                Err(msg) => logger(&msg, true),
            },
            Err(failures) => logger(
                &format!(
                    "While fetching content {} for repository {:?}: no source succeeded:\n{failures}",
                    key.content_hash, key.origin
                ),
                true,
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        consumer::{make_logger, tracing_logger},
        pool::TaskPool,
        serve::NullServe,
    };

    pub(crate) fn archive_key(data: &[u8], origin: &str) -> ArchiveContent {
        ArchiveContent {
            content_hash: compute_hash(data),
            distfile: None,
            fetch_url: format!("https://unreachable.invalid/{origin}.tar"),
            mirrors: Vec::new(),
            sha256: None,
            sha512: None,
            origin: origin.to_string(),
        }
    }

    fn test_context(dir: &std::path::Path) -> ContentCasContext {
        ContentCasContext {
            cas: Arc::new(LocalCas::open(dir.join("cas")).unwrap()),
            fetcher: Arc::new(Fetcher::new(Some(std::time::Duration::from_millis(200))).unwrap()),
            distdirs: vec![dir.join("distdir")],
            additional_mirrors: Vec::new(),
            serve: None,
            operations: Arc::new(OperationCache::new()),
        }
    }

    #[test]
    fn test_cache_hit_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());
        let key = archive_key(b"cached bytes", "r");
        context.cas.put(b"cached bytes").unwrap();
        let cas_map = create_content_cas_map(Arc::new(context));

        let pool = Arc::new(TaskPool::new(2));
        let done = Arc::new(AtomicUsize::new(0));
        {
            let done = done.clone();
            cas_map.consume_after_keys_ready(&pool, vec![key], move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            }, tracing_logger());
        }
        pool.join();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distdir_source_verified_and_stored() {
        let dir = tempfile::tempdir().unwrap();
        let context = test_context(dir.path());
        std::fs::create_dir_all(dir.path().join("distdir")).unwrap();
        std::fs::write(dir.path().join("distdir/pkg.tar"), b"dist contents").unwrap();

        let mut key = archive_key(b"dist contents", "r");
        key.distfile = Some("pkg.tar".to_string());
        let content_hash = key.content_hash.clone();
        let cas = context.cas.clone();
        let cas_map = create_content_cas_map(Arc::new(context));

        let pool = Arc::new(TaskPool::new(2));
        cas_map.consume_after_keys_ready(&pool, vec![key], |_| {}, tracing_logger());
        pool.join();
        assert!(cas.contains(&content_hash));
        assert_eq!(cas.read(&content_hash).unwrap(), b"dist contents");
    }

    /// A serve endpoint feeding wrong bytes is a fatal verification error,
    /// never silently recovered.
    #[test]
    fn test_corrupt_serve_content_is_fatal() {
        struct LyingServe;
        impl ServeApi for LyingServe {
            fn tree_known(&self, _t: &str) -> bool {
                false
            }
            fn commit_tree_id(&self, _c: &str, _s: &str) -> Option<String> {
                None
            }
            fn provide_content(&self, _h: &str) -> Option<Vec<u8>> {
                Some(b"tampered".to_vec())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut context = test_context(dir.path());
        context.serve = Some(Arc::new(LyingServe));
        let cas = context.cas.clone();
        let key = archive_key(b"authentic", "r");
        let content_hash = key.content_hash.clone();
        let cas_map = create_content_cas_map(Arc::new(context));

        let pool = Arc::new(TaskPool::new(2));
        let sink = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = sink.clone();
            cas_map.consume_after_keys_ready(
                &pool,
                vec![key],
                |_| panic!("must not resolve"),
                make_logger(move |msg, fatal| {
                    sink.lock().unwrap().push((msg.to_string(), fatal));
                }),
            );
        }
        pool.join();
        assert!(!cas.contains(&content_hash));
        let sink = sink.lock().unwrap();
        assert!(sink.iter().any(|(msg, fatal)| *fatal && msg.contains("mismatch")));
    }

    /// Two repositories referencing the same content share one fetch.
    #[test]
    fn test_concurrent_same_content_fetches_once() {
        static PROVIDED: AtomicUsize = AtomicUsize::new(0);
        struct CountingServe;
        impl ServeApi for CountingServe {
            fn tree_known(&self, _t: &str) -> bool {
                false
            }
            fn commit_tree_id(&self, _c: &str, _s: &str) -> Option<String> {
                None
            }
            fn provide_content(&self, _h: &str) -> Option<Vec<u8>> {
                PROVIDED.fetch_add(1, Ordering::SeqCst);
                Some(b"shared payload".to_vec())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut context = test_context(dir.path());
        context.serve = Some(Arc::new(CountingServe));
        let cas_map = create_content_cas_map(Arc::new(context));

        let pool = Arc::new(TaskPool::new(8));
        let done = Arc::new(AtomicUsize::new(0));
        for origin in ["first", "second", "third"] {
            let key = archive_key(b"shared payload", origin);
            let done = done.clone();
            cas_map.consume_after_keys_ready(&pool, vec![key], move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            }, tracing_logger());
        }
        pool.join();
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(PROVIDED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_null_serve_is_inert() {
        assert!(NullServe.provide_content("abc").is_none());
        assert!(!NullServe.tree_known("abc"));
    }
}
