//! Canonicalization and de-duplication of user-supplied scan roots.

use tracing::warn;

/// Lexically canonicalize a folder-relative path: `/` separators, no empty
/// or `.` segments, `..` resolved without escaping the root. Returns `None`
/// for paths that would climb out of the folder.
pub fn canonicalize(name: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            seg => parts.push(seg),
        }
    }
    Some(parts.join("/"))
}

fn parent_of(name: &str) -> &str {
    match name.rfind('/') {
        Some(idx) => &name[..idx],
        None => "",
    }
}

pub(crate) fn is_descendant(name: &str, ancestor: &str) -> bool {
    name.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Reduce `subs` to a canonical, de-duplicated, parent-covering set of scan
/// roots: no element is a prefix of another, and every element starts from a
/// path the index knows (unknown ancestors are promoted so the scanner never
/// starts inside an untracked directory). An empty return means "whole
/// folder".
pub fn normalize_subtrees(
    mut subs: Vec<String>,
    exists: &dyn Fn(&str) -> bool,
) -> Vec<String> {
    if subs.is_empty() {
        return Vec::new();
    }
    subs.sort();
    if matches!(subs[0].as_str(), "" | "." | "/" | "\\") {
        return Vec::new();
    }

    let mut promoted: Vec<String> = Vec::new();
    for sub in subs {
        let Some(clean) = canonicalize(&sub) else {
            warn!(target: "folder::scan", path = %sub, "dropping invalid scan root");
            continue;
        };
        if clean.is_empty() {
            return Vec::new();
        }

        // Start the scan from the highest ancestor the index does not know,
        // so deletions of whole subtrees are picked up from a tracked base.
        let mut root = clean;
        loop {
            let parent = parent_of(&root);
            if parent.is_empty() || exists(parent) {
                break;
            }
            root = parent.to_string();
        }
        promoted.push(root);
    }

    promoted.sort();
    let mut result: Vec<String> = Vec::new();
    for root in promoted {
        match result.last() {
            Some(prev) if *prev == root || is_descendant(&root, prev) => {}
            _ => result.push(root),
        }
    }
    result
}
