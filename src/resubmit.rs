//! Resubmits jobs whose current status matches a filter.
//!
//! Resubmission preserves the audit trail: the original job keeps its id,
//! command and history, gaining only a `superseded_by` annotation. Each
//! qualifying original produces one fresh job copying its command and
//! configuration, submitted through the same driver, with a back-reference
//! in `resubmitted_from`.

use crate::cache::StatusCache;
use crate::config::KongConfig;
use crate::driver::DriverRegistry;
use crate::error::Result;
use crate::model::{JobId, SubJobStatus};
use crate::ops;
use crate::recover::UNKNOWN_COMMAND;
use crate::store::Store;

/// What a resubmission run did.
#[derive(Debug, Default)]
pub struct ResubmitOutcome {
    /// `(original, replacement)` pairs, in submission order.
    pub resubmitted: Vec<(JobId, JobId)>,
    /// Jobs whose statuses did not match the filter.
    pub unmatched: Vec<JobId>,
    /// Jobs that cannot be resubmitted (recovered records with an unknown
    /// command).
    pub skipped: Vec<JobId>,
}

/// Resubmits every job in `job_ids` that has at least one subjob whose
/// status is in `filter`. Statuses are read through the cache; `force`
/// bypasses its TTL.
pub fn resubmit(
    store: &Store,
    cache: &StatusCache,
    registry: &DriverRegistry,
    config: &KongConfig,
    job_ids: &[JobId],
    filter: &[SubJobStatus],
    force: bool,
) -> Result<ResubmitOutcome> {
    let statuses = ops::statuses_for(store, cache, registry, job_ids, force)?;

    let mut outcome = ResubmitOutcome::default();
    for &original in job_ids {
        let matches = statuses
            .get(&original)
            .is_some_and(|s| s.iter().any(|status| filter.contains(status)));
        if !matches {
            outcome.unmatched.push(original);
            continue;
        }

        let replacement = store.transaction(|state| {
            let job = state.job(original)?.clone();
            if job.command == UNKNOWN_COMMAND {
                return Ok(None);
            }
            let new_id = state.create_job(
                job.folder,
                &job.command,
                &job.driver,
                job.resources.clone(),
                job.array_size,
            )?;
            state.job_mut(new_id)?.resubmitted_from = Some(original);
            state.job_mut(original)?.superseded_by = Some(new_id);
            Ok(Some(new_id))
        })?;

        match replacement {
            Some(new_id) => {
                ops::submit_job(store, registry, config, new_id)?;
                outcome.resubmitted.push((original, new_id));
            }
            None => outcome.skipped.push(original),
        }
    }
    Ok(outcome)
}
