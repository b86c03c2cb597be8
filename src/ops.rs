//! Job lifecycle operations: submit, status, kill, peek, delete.
//!
//! These tie the store, the status cache and the driver registry together.
//! Mutations of the shared state run inside store transactions; status
//! reads go through the cache and batch one backend call per driver.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;

use crate::cache::StatusCache;
use crate::config::KongConfig;
use crate::driver::{DriverRegistry, JobEnv, JobSpec, OutputStream};
use crate::error::{KongError, Result};
use crate::model::{Job, JobId, SubJobStatus};
use crate::store::Store;

/// Submits a job through its driver. The external id is assigned exactly
/// once: a job that already holds one fails `AlreadySubmitted`. The check,
/// the backend call and the recording happen under one transaction, so two
/// racing invocations cannot both submit.
pub fn submit_job(
    store: &Store,
    registry: &DriverRegistry,
    config: &KongConfig,
    job_id: JobId,
) -> Result<Job> {
    store.transaction(|state| {
        let job = state.job(job_id)?.clone();
        if let Some(external_id) = &job.external_id {
            return Err(KongError::AlreadySubmitted {
                id: job_id,
                external_id: external_id.clone(),
            });
        }

        let driver = registry.get(&job.driver)?;
        let resources = state.resolve_resources(&job, &config.defaults)?;
        let spec = JobSpec {
            job_id,
            command: job.command.clone(),
            env: JobEnv::compute(job_id, resources.cores, config),
            array_size: job.array_size,
            resources,
        };
        let external_id = driver.submit(&spec)?;

        let job = state.job_mut(job_id)?;
        job.external_id = Some(external_id);
        job.submitted_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(job.clone())
    })
}

/// Per-subjob statuses for a set of jobs. Unsubmitted jobs report `Created`
/// without a backend call; submitted ones go through the cache, grouped so
/// each driver is queried at most once.
pub fn statuses_for(
    store: &Store,
    cache: &StatusCache,
    registry: &DriverRegistry,
    job_ids: &[JobId],
    force: bool,
) -> Result<BTreeMap<JobId, Vec<SubJobStatus>>> {
    let state = store.load()?;
    let mut result = BTreeMap::new();
    let mut by_driver: HashMap<String, Vec<(JobId, String)>> = HashMap::new();

    for &id in job_ids {
        let job = state.job(id)?;
        match &job.external_id {
            Some(external_id) => by_driver
                .entry(job.driver.clone())
                .or_default()
                .push((id, external_id.clone())),
            None => {
                result.insert(id, vec![SubJobStatus::Created; job.array_size as usize]);
            }
        }
    }

    for (driver_name, jobs) in by_driver {
        let driver = registry.get(&driver_name)?;
        let external_ids: Vec<String> = jobs.iter().map(|(_, e)| e.clone()).collect();
        let mut statuses = cache.statuses(driver, &external_ids, force)?;
        for (id, external_id) in jobs {
            let job_statuses = statuses
                .remove(&external_id)
                .unwrap_or_else(|| {
                    vec![SubJobStatus::Unknown; state.job(id).map(|j| j.array_size).unwrap_or(1) as usize]
                });
            result.insert(id, job_statuses);
        }
    }
    Ok(result)
}

/// Asks the backend to kill a submitted job. Best effort and asynchronous;
/// the cache entry is dropped so the next status read sees the effect.
pub fn kill_job(
    store: &Store,
    cache: &StatusCache,
    registry: &DriverRegistry,
    job_id: JobId,
) -> Result<()> {
    let state = store.load()?;
    let job = state.job(job_id)?;
    let external_id = job.external_id.clone().ok_or_else(|| {
        KongError::NotAvailable(format!("job {job_id} was never submitted"))
    })?;

    registry.get(&job.driver)?.kill(&external_id)?;
    cache.invalidate(std::slice::from_ref(&external_id))
}

/// Reads one subjob's captured output stream.
pub fn peek_job(
    store: &Store,
    registry: &DriverRegistry,
    job_id: JobId,
    subjob: usize,
    stream: OutputStream,
) -> Result<String> {
    let state = store.load()?;
    let job = state.job(job_id)?;
    let external_id = job.external_id.as_deref().ok_or_else(|| {
        KongError::NotAvailable(format!("job {job_id} was never submitted"))
    })?;
    registry.get(&job.driver)?.peek(external_id, subjob, stream)
}

/// Removes job records and their on-disk artifacts. Submitted jobs are
/// killed first so nothing keeps writing into directories being removed.
pub fn delete_jobs(
    store: &Store,
    cache: &StatusCache,
    registry: &DriverRegistry,
    config: &KongConfig,
    job_ids: &[JobId],
) -> Result<()> {
    let removed = store.transaction(|state| {
        let mut removed = Vec::with_capacity(job_ids.len());
        for &id in job_ids {
            removed.push(state.delete_job(id)?);
        }
        Ok(removed)
    })?;

    cleanup_removed_jobs(cache, registry, config, &removed)
}

/// Backend kill, cache invalidation and artifact removal for jobs whose
/// records are already gone. Best effort: a failure on one job never stops
/// cleanup of the rest; the failures are reported together at the end.
pub fn cleanup_removed_jobs(
    cache: &StatusCache,
    registry: &DriverRegistry,
    config: &KongConfig,
    removed: &[Job],
) -> Result<()> {
    let mut failures = Vec::new();
    for job in removed {
        if let Some(external_id) = &job.external_id {
            // The record is already gone; a dead backend cannot hold it up.
            let _ = registry.get(&job.driver).and_then(|d| d.kill(external_id));
            if let Err(err) = cache.invalidate(std::slice::from_ref(external_id)) {
                failures.push(format!("job {} cache entry: {err}", job.id));
            }
        }
        if let Err(err) = JobEnv::compute(job.id, 1, config).remove_artifacts() {
            failures.push(format!("job {} artifacts: {err}", job.id));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(KongError::TransientError(format!(
            "cleanup incomplete: {}",
            failures.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceRequest;
    use crate::store::ROOT_ID;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (KongConfig, Store, StatusCache, DriverRegistry) {
        let config = KongConfig::with_data_dir(dir.path());
        let store = Store::new(&config);
        let cache = StatusCache::new(&config);
        let registry = DriverRegistry::standard(&config);
        (config, store, cache, registry)
    }

    fn create_job(store: &Store, command: &str, array_size: u32) -> JobId {
        store
            .transaction(|state| {
                state.create_job(ROOT_ID, command, "local", ResourceRequest::default(), array_size)
            })
            .unwrap()
    }

    fn wait_for_terminal(
        store: &Store,
        cache: &StatusCache,
        registry: &DriverRegistry,
        job_id: JobId,
    ) -> Vec<SubJobStatus> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let statuses = statuses_for(store, cache, registry, &[job_id], true)
                .unwrap()
                .remove(&job_id)
                .unwrap();
            if statuses.iter().all(|s| s.is_terminal()) || Instant::now() > deadline {
                return statuses;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn submit_assigns_external_id_exactly_once() {
        let dir = TempDir::new().unwrap();
        let (config, store, _cache, registry) = setup(&dir);
        let id = create_job(&store, "true", 1);

        let job = submit_job(&store, &registry, &config, id).unwrap();
        assert!(job.is_submitted());
        assert!(job.submitted_at.is_some());

        let err = submit_job(&store, &registry, &config, id).unwrap_err();
        match err {
            KongError::AlreadySubmitted { id: j, external_id } => {
                assert_eq!(j, id);
                assert_eq!(Some(external_id), job.external_id);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unsubmitted_jobs_report_created_without_backend() {
        let dir = TempDir::new().unwrap();
        let (_config, store, cache, registry) = setup(&dir);
        let id = create_job(&store, "true", 3);

        let statuses = statuses_for(&store, &cache, &registry, &[id], false).unwrap();
        assert_eq!(statuses[&id], vec![SubJobStatus::Created; 3]);
    }

    #[test]
    fn end_to_end_submit_query_delete() {
        let dir = TempDir::new().unwrap();
        let (config, store, cache, registry) = setup(&dir);

        let id = store
            .transaction(|state| {
                let folder = state.create_folder_path(ROOT_ID, "/exp/run1")?;
                state.create_job(folder, "echo done", "local", ResourceRequest::default(), 3)
            })
            .unwrap();

        submit_job(&store, &registry, &config, id).unwrap();
        let statuses = wait_for_terminal(&store, &cache, &registry, id);
        assert_eq!(statuses, vec![SubJobStatus::Done; 3]);

        let out = peek_job(&store, &registry, id, 0, OutputStream::Stdout).unwrap();
        assert_eq!(out.trim(), "done");

        delete_jobs(&store, &cache, &registry, &config, &[id]).unwrap();

        let state = store.load().unwrap();
        assert!(!state.has_job(id));
        let run1 = state.find_by_path(ROOT_ID, "/exp/run1").unwrap();
        let (folders, jobs) = state.list(run1.id, true).unwrap();
        assert!(folders.is_empty());
        assert!(jobs.is_empty());

        // Artifacts are gone with the record.
        assert!(!JobEnv::compute(id, 1, &config).log_dir.exists());
        assert!(!JobEnv::compute(id, 1, &config).output_dir.exists());
    }

    #[test]
    fn delete_cleanup_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let (config, store, cache, registry) = setup(&dir);

        let first = create_job(&store, "true", 1);
        let second = create_job(&store, "true", 1);
        for id in [first, second] {
            submit_job(&store, &registry, &config, id).unwrap();
            wait_for_terminal(&store, &cache, &registry, id);
        }

        // Wedge the cache lock: a directory at the lock path makes every
        // invalidation fail.
        let lock_path = config.cache_file().with_extension("lock");
        let _ = std::fs::remove_file(&lock_path);
        std::fs::create_dir(&lock_path).unwrap();

        let err = delete_jobs(&store, &cache, &registry, &config, &[first, second])
            .unwrap_err();
        assert!(matches!(err, KongError::TransientError(_)));

        // The failure did not stop the rest of the cleanup: both records and
        // both jobs' artifacts are gone.
        let state = store.load().unwrap();
        for id in [first, second] {
            assert!(!state.has_job(id));
            assert!(!JobEnv::compute(id, 1, &config).log_dir.exists());
            assert!(!JobEnv::compute(id, 1, &config).output_dir.exists());
        }
    }

    #[test]
    fn kill_invalidates_and_reaches_terminal() {
        let dir = TempDir::new().unwrap();
        let (config, store, cache, registry) = setup(&dir);
        let id = create_job(&store, "sleep 30", 1);

        submit_job(&store, &registry, &config, id).unwrap();
        kill_job(&store, &cache, &registry, id).unwrap();

        let statuses = wait_for_terminal(&store, &cache, &registry, id);
        assert_eq!(statuses, vec![SubJobStatus::Killed]);
    }

    #[test]
    fn kill_of_unsubmitted_job_is_not_available() {
        let dir = TempDir::new().unwrap();
        let (_config, store, cache, registry) = setup(&dir);
        let id = create_job(&store, "true", 1);

        let err = kill_job(&store, &cache, &registry, id).unwrap_err();
        assert!(matches!(err, KongError::NotAvailable(_)));
    }

    #[test]
    fn peek_of_unsubmitted_job_is_not_available() {
        let dir = TempDir::new().unwrap();
        let (_config, store, _cache, registry) = setup(&dir);
        let id = create_job(&store, "true", 1);

        let err = peek_job(&store, &registry, id, 0, OutputStream::Stdout).unwrap_err();
        assert!(matches!(err, KongError::NotAvailable(_)));
    }

    #[test]
    fn status_of_unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (_config, store, cache, registry) = setup(&dir);
        let err = statuses_for(&store, &cache, &registry, &[99], false).unwrap_err();
        assert!(matches!(err, KongError::NotFound(_)));
    }
}
