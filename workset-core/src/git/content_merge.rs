//! Detect branches whose content already landed in a base branch
//!
//! Ancestry alone misses squash merges, rebases and cherry-picks. The
//! detector answers "is everything this branch changed already in base?" in
//! three tiers, cheapest first:
//!
//! 1. the branch tree equals the base tree;
//! 2. for some merge base, every change from the merge base to the branch is
//!    already present in base at the same path with the same id and mode;
//! 3. some commit in base's history since the merge bases has exactly the
//!    branch tree.

use std::path::Path;

use tracing::{debug, warn};

use super::{CallContext, ChangeKind, ObjectId, TreeChange, TreeEntry, TreeReader};
use crate::{Error, Result};

/// Three-tier content-merge check over any [`TreeReader`]
pub struct ContentMergeDetector<'a, R: TreeReader + ?Sized> {
    reader: &'a R,
}

impl<'a, R: TreeReader + ?Sized> ContentMergeDetector<'a, R> {
    /// Create a detector reading trees through `reader`
    pub fn new(reader: &'a R) -> Self {
        Self { reader }
    }

    /// True when the content of `branch` is already contained in `base`
    ///
    /// Tier 2 failures for one merge base do not stop the others or tier 3.
    /// An error is returned only if every merge base failed and tier 3 did
    /// not find the tree.
    pub fn is_content_merged(
        &self,
        ctx: &CallContext,
        repo: &Path,
        branch: &str,
        base: &str,
    ) -> Result<bool> {
        ctx.check()?;

        let branch_tree = self.reader.tree_id(ctx, repo, branch)?;
        let base_tree = self.reader.tree_id(ctx, repo, base)?;
        if branch_tree == base_tree {
            debug!(branch, base, "Trees identical");
            return Ok(true);
        }

        let merge_bases = self.reader.merge_bases(ctx, repo, branch, base)?;
        if merge_bases.is_empty() {
            debug!(branch, base, "No merge base");
            return Ok(false);
        }

        let mut first_err: Option<Error> = None;
        let mut clean_negative = false;

        for merge_base in &merge_bases {
            match self.changes_present_in_base(ctx, repo, merge_base, branch, base) {
                Ok(true) => {
                    debug!(branch, base, merge_base = %merge_base, "Branch changes present in base");
                    return Ok(true);
                }
                Ok(false) => clean_negative = true,
                Err(e @ (Error::Cancelled | Error::TimedOut(_))) => return Err(e),
                Err(e) => {
                    warn!(branch, base, merge_base = %merge_base, error = %e, "Change comparison failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        match self
            .reader
            .tree_in_history(ctx, repo, base, &branch_tree, &merge_bases)
        {
            Ok(true) => {
                debug!(branch, base, "Branch tree found in base history");
                return Ok(true);
            }
            Ok(false) => {}
            Err(e @ (Error::Cancelled | Error::TimedOut(_))) => return Err(e),
            Err(e) => {
                warn!(branch, base, error = %e, "History walk failed");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) if !clean_negative => Err(e),
            _ => Ok(false),
        }
    }

    /// Tier 2 for a single merge base
    fn changes_present_in_base(
        &self,
        ctx: &CallContext,
        repo: &Path,
        merge_base: &ObjectId,
        branch: &str,
        base: &str,
    ) -> Result<bool> {
        let changes = self
            .reader
            .diff_trees(ctx, repo, merge_base.as_str(), branch)?;
        if changes.is_empty() {
            return Ok(true);
        }

        let mut paths: Vec<String> = changes
            .iter()
            .flat_map(|c| [c.old.as_ref(), c.new.as_ref()])
            .flatten()
            .map(|side| side.path.clone())
            .collect();
        paths.sort();
        paths.dedup();

        let in_base = self.reader.tree_entries(ctx, repo, base, &paths)?;
        let holds = |path: &str, expected: &TreeEntry| in_base.get(path) == Some(expected);

        for change in &changes {
            if !change_holds(change, &holds, &|path| in_base.contains_key(path)) {
                debug!(branch, base, change = ?change.kind, path = ?change_path(change), "Change missing from base");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Whether base already reflects one change
fn change_holds(
    change: &TreeChange,
    holds: &dyn Fn(&str, &TreeEntry) -> bool,
    present: &dyn Fn(&str) -> bool,
) -> bool {
    match change.kind {
        ChangeKind::Added | ChangeKind::Modified | ChangeKind::TypeChanged | ChangeKind::Copied => {
            match &change.new {
                Some(new) => holds(&new.path, &new.entry),
                None => false,
            }
        }
        ChangeKind::Deleted => match &change.old {
            Some(old) => !present(&old.path),
            None => false,
        },
        ChangeKind::Renamed => match (&change.old, &change.new) {
            (Some(old), Some(new)) => holds(&new.path, &new.entry) && !holds(&old.path, &old.entry),
            _ => false,
        },
    }
}

fn change_path(change: &TreeChange) -> Option<&str> {
    change
        .new
        .as_ref()
        .or(change.old.as_ref())
        .map(|side| side.path.as_str())
}
