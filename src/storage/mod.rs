//! Persistent storage surfaces: the content-addressed blob store, the
//! FastCDC chunker used to split stored blobs, and the bounded cache of
//! long-running operation records.

pub mod cas;
pub mod chunker;
pub mod operation_cache;
