//! Ref classification and the refname ⇄ directory-name mapping.
//!
//! A ref is either a branch name or a pinned commit written as
//! `<hashprefix><hex>` (prefix configurable, `commit/` by default). On disk a
//! pinned commit lives in a dot-prefixed directory named after its hex, so
//! `commit/deadbeef` maps to `.deadbeef` and back.

use std::sync::LazyLock;

use regex::Regex;

static DIRNAME_COMMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\.([^.]+)").expect("commit dirname regex"));

/// Maps between declared ref names and clone directory names.
#[derive(Debug, Clone)]
pub struct RefMapper {
    hashprefix: String,
    commit: Regex,
}

impl RefMapper {
    pub fn new(hashprefix: &str) -> Self {
        // The prefix is matched case-insensitively, as is the hex.
        let pattern = format!("(?i)^{}([0-9a-f]+)", regex::escape(hashprefix));
        RefMapper {
            hashprefix: hashprefix.to_string(),
            commit: Regex::new(&pattern).expect("pinned commit regex"),
        }
    }

    /// The hex of a pinned-commit ref, in its original case. `None` for
    /// branch names.
    pub fn commit_hex<'a>(&self, refname: &'a str) -> Option<&'a str> {
        self.commit
            .captures(refname)
            .map(|captures| captures.get(1).expect("capture group").as_str())
    }

    pub fn is_commit(&self, refname: &str) -> bool {
        self.commit.is_match(refname)
    }

    /// Pinned-commit refs compare case-insensitively; lowercase them so
    /// de-duplication works. Branch names are case-sensitive and untouched.
    pub fn canonicalize(&self, refname: &str) -> String {
        if self.is_commit(refname) {
            refname.to_lowercase()
        } else {
            refname.to_string()
        }
    }

    pub fn refname_to_dirname(&self, refname: &str) -> String {
        match self.commit_hex(refname) {
            Some(hex) => format!(".{hex}"),
            None => refname.to_string(),
        }
    }

    pub fn dirname_to_refname(&self, dirname: &str) -> String {
        match DIRNAME_COMMIT.captures(dirname) {
            Some(captures) => format!("{}{}", self.hashprefix, &captures[1]),
            None => dirname.to_string(),
        }
    }
}
