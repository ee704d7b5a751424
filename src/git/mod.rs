//! Minimal Git cache layer: loose object encoding for blobs, trees,
//! commits, and a bare-repository store used to materialize workspace
//! roots. Network fetches and packed-object reads go through the `git`
//! binary; everything written locally is a plain loose object.

pub mod object;
pub mod ops;
pub mod repo;
