//! Target expressions: the selection language for jobs.
//!
//! An expression is one or more whitespace-separated tokens, unioned. A
//! token is a job id (`7`), an inclusive id range (`3-9`), an offset range
//! (`3+4`, meaning 3..=7), a folder path, or a shell-style glob matched per
//! path segment. Folder names are never all digits, so numeric tokens are
//! unambiguously id selectors.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use glob::Pattern;

use crate::model::{FolderId, JobId};
use crate::store::{ROOT_ID, State};

/// Outcome of resolving one expression. Tokens that matched nothing are
/// reported individually; the rest of the expression still resolves.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Matched job ids, sorted and deduplicated.
    pub jobs: Vec<JobId>,
    /// Tokens that matched no job id, path, or glob.
    pub unresolved: Vec<String>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Parses a purely numeric token into an inclusive id range, without
/// consulting the store or materializing the ids. `None` means the token is
/// not numeric and must be a path or glob; an `A+K` whose upper end does not
/// fit in the id type also yields `None`. An inverted `A-B` parses to an
/// empty range.
pub fn parse_id_range(token: &str) -> Option<RangeInclusive<JobId>> {
    if let Ok(id) = token.parse::<JobId>() {
        return Some(id..=id);
    }
    if let Some((a, b)) = token.split_once('-')
        && let (Ok(a), Ok(b)) = (a.parse::<JobId>(), b.parse::<JobId>())
    {
        return Some(a..=b);
    }
    if let Some((a, k)) = token.split_once('+')
        && let (Ok(a), Ok(k)) = (a.parse::<JobId>(), k.parse::<JobId>())
    {
        return a.checked_add(k).map(|end| a..=end);
    }
    None
}

fn is_glob(token: &str) -> bool {
    token.contains(['*', '?', '['])
}

/// Matches a glob against the folder tree one path segment at a time,
/// returning every folder the pattern reaches.
fn glob_folders(state: &State, cwd: FolderId, pattern: &str) -> Vec<FolderId> {
    let mut current: Vec<FolderId> = if pattern.starts_with('/') {
        vec![ROOT_ID]
    } else {
        vec![cwd]
    };

    for segment in pattern.split('/').filter(|s| !s.is_empty()) {
        let mut next = BTreeSet::new();
        match segment {
            "." => {
                next.extend(current.iter().copied());
            }
            ".." => {
                for id in &current {
                    if let Ok(folder) = state.folder(*id) {
                        next.insert(folder.parent.unwrap_or(*id));
                    }
                }
            }
            _ => {
                let Ok(matcher) = Pattern::new(segment) else {
                    return Vec::new();
                };
                for id in &current {
                    for child in state.children(*id) {
                        if matcher.matches(&child.name) {
                            next.insert(child.id);
                        }
                    }
                }
            }
        }
        current = next.into_iter().collect();
        if current.is_empty() {
            break;
        }
    }
    current
}

/// Resolves a full expression against the store. With `recursive`, folder
/// and glob tokens include jobs in all subfolders.
pub fn resolve(state: &State, cwd: FolderId, expr: &str, recursive: bool) -> Resolution {
    let mut matched = BTreeSet::new();
    let mut unresolved = Vec::new();

    for token in expr.split_whitespace() {
        let resolved = if let Some(range) = parse_id_range(token) {
            if range.is_empty() {
                false
            } else {
                // Intersect with the stored ids; a range like 1-4000000000
                // only ever visits jobs that exist.
                let existing: Vec<JobId> = state.job_ids_in(range).collect();
                let any = !existing.is_empty();
                matched.extend(existing);
                any
            }
        } else if is_glob(token) {
            let folders = glob_folders(state, cwd, token);
            for folder in &folders {
                if let Ok(ids) = state.job_ids_under(*folder, recursive) {
                    matched.extend(ids);
                }
            }
            // A glob that reached folders is resolved even if they are empty.
            !folders.is_empty()
        } else if let Ok(folder) = state.find_by_path(cwd, token) {
            if let Ok(ids) = state.job_ids_under(folder.id, recursive) {
                matched.extend(ids);
            }
            true
        } else {
            false
        };

        if !resolved {
            unresolved.push(token.to_string());
        }
    }

    Resolution {
        jobs: matched.into_iter().collect(),
        unresolved,
    }
}
