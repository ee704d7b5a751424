//! Consumer maps for the preconditions of workspace roots: serialized
//! critical Git operations, content fetching into the CAS, directory
//! imports into the Git cache, and generic git-tree fetch commands.

pub mod content_cas;
pub mod critical_git_op;
pub mod git_tree_fetch;
pub mod import_to_git;
