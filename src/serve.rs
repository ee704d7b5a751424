//! Narrow query interface of a cooperating serve endpoint.
//!
//! When configured, a serve endpoint can attest trees for absent roots and
//! hand out blob contents so that archives need not be fetched from their
//! upstream URLs. Only the queries consumed by the setup core are modeled;
//! the transport behind them is out of scope.

pub trait ServeApi: Send + Sync {
    /// Whether the remote side knows the given git tree, making an absent
    /// root usable without local materialization.
    fn tree_known(&self, tree_id: &str) -> bool;

    /// Tree id of a commit the remote knows, if any.
    fn commit_tree_id(&self, commit: &str, subdir: &str) -> Option<String>;

    /// Blob contents by content hash, if the remote can provide them.
    fn provide_content(&self, content_hash: &str) -> Option<Vec<u8>>;
}

/// A serve endpoint that knows nothing; useful as a test double base.
pub struct NullServe;

impl ServeApi for NullServe {
    fn tree_known(&self, _tree_id: &str) -> bool {
        false
    }

    fn commit_tree_id(&self, _commit: &str, _subdir: &str) -> Option<String> {
        None
    }

    fn provide_content(&self, _content_hash: &str) -> Option<Vec<u8>> {
        None
    }
}
