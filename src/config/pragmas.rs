//! Per-repository modifier flags and the checkout-type dispatch table.

use serde_json::Value;

/// Value of `pragma.special`: how symlinks and other special entries are
/// treated when a root is materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PragmaSpecial {
    /// Drop special entries from the imported tree.
    Ignore,
    /// Resolve symlinks that stay inside the tree; reject upward ones.
    ResolvePartially,
    /// Resolve symlinks transitively; anything escaping the tree is an
    /// error.
    ResolveCompletely,
}

impl PragmaSpecial {
    /// The configuration keyword, also used in durable cache keys.
    pub const fn keyword(&self) -> &'static str {
        match self {
            PragmaSpecial::Ignore => "ignore",
            PragmaSpecial::ResolvePartially => "resolve-partially",
            PragmaSpecial::ResolveCompletely => "resolve-completely",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "ignore" => Some(PragmaSpecial::Ignore),
            "resolve-partially" => Some(PragmaSpecial::ResolvePartially),
            "resolve-completely" => Some(PragmaSpecial::ResolveCompletely),
            _ => None,
        }
    }
}

/// The checkout family a repository `type` string dispatches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutType {
    Git,
    Archive,
    ForeignFile,
    File,
    Distdir,
    GitTree,
    Computed,
    TreeStructure,
}

/// Map a `type` string onto its checkout family. `archive` and `zip`
/// share one family; the original string decides the unpack format.
pub fn checkout_type(type_str: &str) -> Option<CheckoutType> {
    match type_str {
        "git" => Some(CheckoutType::Git),
        "archive" | "zip" => Some(CheckoutType::Archive),
        "foreign file" => Some(CheckoutType::ForeignFile),
        "file" => Some(CheckoutType::File),
        "distdir" => Some(CheckoutType::Distdir),
        "git tree" => Some(CheckoutType::GitTree),
        "computed" => Some(CheckoutType::Computed),
        "tree structure" => Some(CheckoutType::TreeStructure),
        _ => None,
    }
}

/// Read `pragma.special` out of a repository description, tolerating an
/// absent or non-map pragma (both mean "no pragma").
pub fn pragma_special(repo_desc: &Value) -> Option<PragmaSpecial> {
    repo_desc
        .get("pragma")
        .and_then(Value::as_object)
        .and_then(|pragma| pragma.get("special"))
        .and_then(Value::as_str)
        .and_then(PragmaSpecial::from_keyword)
}

/// Read a boolean pragma (`absent`, `to_git`); absent or non-bool is false.
pub fn pragma_flag(repo_desc: &Value, flag: &str) -> bool {
    repo_desc
        .get("pragma")
        .and_then(Value::as_object)
        .and_then(|pragma| pragma.get(flag))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
