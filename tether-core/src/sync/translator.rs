//! Git status translator: candidate paths to change records

use std::collections::{BTreeSet, HashSet};

use tokio_util::sync::CancellationToken;

use super::paths::is_metadata_path;
use super::ChangeRecord;
use crate::git::{StatusEntry, StatusScope, WorkTree};
use crate::Result;

/// Derive the changes on `source` that `opposite` still needs
///
/// Paths git does not report (clean tracked files, removed untracked files)
/// are settled by existence and tracking checks. Paths ignored on either
/// side never produce a record. Deletes sort before renames, renames before
/// modifies.
pub async fn translate(
    source: &dyn WorkTree,
    opposite: &dyn WorkTree,
    scope: StatusScope<'_>,
    cancel: &CancellationToken,
) -> Result<Vec<ChangeRecord>> {
    let entries = source.status(scope, cancel).await?;

    let mut reported: HashSet<String> = HashSet::new();
    let mut records = Vec::new();
    for entry in &entries {
        reported.insert(entry.path.clone());
        if let Some(orig) = &entry.orig_path {
            reported.insert(orig.clone());
        }
        records.extend(records_for(entry));
    }

    let fallback: Vec<String> = match scope {
        StatusScope::Paths(candidates) => candidates
            .iter()
            .filter(|p| !is_metadata_path(p) && !reported.contains(*p))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        StatusScope::WholeTree => Vec::new(),
    };

    records.retain(|r| !involves_metadata(r));

    // One ignore query per side covers both the reported and fallback paths
    let candidates: Vec<String> = records
        .iter()
        .flat_map(|r| std::iter::once(r.path.clone()).chain(r.old_path.clone()))
        .chain(fallback.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut ignored = HashSet::new();
    if !candidates.is_empty() {
        ignored.extend(source.ignored(&candidates, cancel).await?);
        ignored.extend(opposite.ignored(&candidates, cancel).await?);
    }

    let mut records = drop_ignored(records, &ignored);

    let fallback: Vec<String> = fallback
        .into_iter()
        .filter(|p| !ignored.contains(p))
        .collect();
    if !fallback.is_empty() {
        records.extend(settle_unreported(source, opposite, &fallback, cancel).await?);
    }

    records.sort_by(|a, b| (a.kind, &a.path, &a.old_path).cmp(&(b.kind, &b.path, &b.old_path)));
    records.dedup();
    Ok(records)
}

fn records_for(entry: &StatusEntry) -> Vec<ChangeRecord> {
    if entry.has('R') {
        return match (&entry.orig_path, entry.has('D')) {
            // Renamed in the index, then deleted from the worktree
            (Some(orig), true) => vec![
                ChangeRecord::delete(orig.clone()),
                ChangeRecord::delete(entry.path.clone()),
            ],
            (Some(orig), false) => vec![ChangeRecord::rename(orig.clone(), entry.path.clone())],
            (None, true) => vec![ChangeRecord::delete(entry.path.clone())],
            (None, false) => vec![ChangeRecord::modify(entry.path.clone())],
        };
    }
    if entry.has('D') {
        return vec![ChangeRecord::delete(entry.path.clone())];
    }
    vec![ChangeRecord::modify(entry.path.clone())]
}

fn involves_metadata(record: &ChangeRecord) -> bool {
    is_metadata_path(&record.path) || record.old_path.as_deref().is_some_and(is_metadata_path)
}

fn drop_ignored(records: Vec<ChangeRecord>, ignored: &HashSet<String>) -> Vec<ChangeRecord> {
    records
        .into_iter()
        .filter_map(|record| {
            let Some(old) = record.old_path.clone() else {
                return (!ignored.contains(&record.path)).then_some(record);
            };
            // A rename across an ignore boundary keeps only its visible half
            match (ignored.contains(&old), ignored.contains(&record.path)) {
                (false, false) => Some(record),
                (false, true) => Some(ChangeRecord::delete(old)),
                (true, false) => Some(ChangeRecord::modify(record.path)),
                (true, true) => None,
            }
        })
        .collect()
}

async fn settle_unreported(
    source: &dyn WorkTree,
    opposite: &dyn WorkTree,
    paths: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<ChangeRecord>> {
    let on_source = source.existing(paths, cancel).await?;
    let tracked = source.tracked(paths, cancel).await?;
    let on_opposite = opposite.existing(paths, cancel).await?;

    let mut records = Vec::new();
    for path in paths {
        if on_source.contains(path) {
            // Clean on the source but possibly stale on the other side
            if tracked.contains(path) {
                records.push(ChangeRecord::modify(path.clone()));
            }
        } else if on_opposite.contains(path) {
            records.push(ChangeRecord::delete(path.clone()));
        }
    }
    Ok(records)
}
