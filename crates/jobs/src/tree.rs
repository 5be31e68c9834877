use std::collections::BTreeMap;

use codebus_core::models::{Change, ChangeType};
use codebus_github::Tree;

use crate::error::JobError;

/// Aggregate configuration object stored next to the synchronized files.
pub const CONFIG_FILE: &str = "helix-config.json";
/// Marker recording the last synchronized commit.
pub const CHECKPOINT_FILE: &str = ".sha";

/// Whether a stored path is bookkeeping rather than a mirrored file.
pub fn is_internal(path: &str) -> bool { path == CONFIG_FILE || path == CHECKPOINT_FILE }

/// Compute the change set between the upstream tree at `commit` and the paths
/// already stored for the branch.
///
/// Every blob of the tree is `added`, unless it is also stored, in which case it is
/// `modified`. Stored paths missing from the tree are `deleted`. The result is
/// ordered by path.
pub fn diff_tree<'a, I>(tree: &Tree, stored: I, commit: &str) -> Result<Vec<Change>, JobError>
where I: IntoIterator<Item = &'a str> {
    if tree.truncated {
        return Err(JobError::fatal(format!("tree {} is truncated", tree.sha)));
    }
    let mut changes = BTreeMap::<&str, Change>::new();
    for entry in tree.entries.iter().filter(|e| e.is_blob()) {
        changes.insert(&entry.path, Change::added(&entry.path, commit));
    }
    let (mut added, mut modified, mut deleted) = (changes.len(), 0usize, 0usize);
    for path in stored.into_iter().filter(|p| !is_internal(p)) {
        match changes.get_mut(path) {
            Some(change) => {
                if change.kind == ChangeType::Added {
                    change.kind = ChangeType::Modified;
                    added -= 1;
                    modified += 1;
                }
            }
            None => {
                changes.insert(path, Change::deleted(path));
                deleted += 1;
            }
        }
    }
    tracing::debug!(added, modified, deleted, "Computed tree diff");
    Ok(changes.into_values().collect())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use codebus_github::TreeEntry;

    use super::*;

    fn tree(paths: &[&str]) -> Tree {
        let mut entries = paths
            .iter()
            .map(|p| TreeEntry {
                path: p.to_string(),
                kind: "blob".to_string(),
                sha: format!("blob-{p}"),
                size: Some(1),
            })
            .collect::<Vec<_>>();
        entries.push(TreeEntry {
            path: "dir".to_string(),
            kind: "tree".to_string(),
            sha: "tree-dir".to_string(),
            size: None,
        });
        Tree { sha: "c1".to_string(), truncated: false, entries }
    }

    #[test]
    fn test_diff_classification() {
        let tree = tree(&["a.md", "dir/b.js", "new.css"]);
        let stored = ["a.md", "dir/b.js", "gone.md", "helix-config.json", ".sha"];
        let changes = diff_tree(&tree, stored, "c1").unwrap();
        assert_eq!(changes, vec![
            Change::modified("a.md", "c1"),
            Change::modified("dir/b.js", "c1"),
            Change::deleted("gone.md"),
            Change::added("new.css", "c1"),
        ]);
    }

    #[test]
    fn test_diff_completeness() {
        let new = ["a", "b", "c", "d/e", "d/f"];
        let old = ["b", "d/f", "g", "h/i"];
        let changes = diff_tree(&tree(&new), old, "c1").unwrap();

        let paths = changes.iter().map(|c| c.path.as_str()).collect::<Vec<_>>();
        let unique = paths.iter().copied().collect::<BTreeSet<_>>();
        assert_eq!(paths.len(), unique.len());

        let new = new.into_iter().collect::<BTreeSet<_>>();
        let old = old.into_iter().collect::<BTreeSet<_>>();
        for change in &changes {
            let path = change.path.as_str();
            let expected = match (new.contains(path), old.contains(path)) {
                (true, false) => ChangeType::Added,
                (true, true) => ChangeType::Modified,
                (false, true) => ChangeType::Deleted,
                (false, false) => unreachable!(),
            };
            assert_eq!(change.kind, expected, "{path}");
        }
        assert_eq!(unique, new.union(&old).copied().collect());
        assert!(changes.iter().filter(|c| c.is_deleted()).all(|c| c.commit.is_none()));
    }

    #[test]
    fn test_truncated_tree_rejected() {
        let mut tree = tree(&["a.md"]);
        tree.truncated = true;
        let err = diff_tree(&tree, [], "c1").unwrap_err();
        assert!(!err.is_rate_limited());
        assert!(err.to_string().contains("truncated"));
    }
}
