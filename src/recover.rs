//! Rebuilds job records that exist on the backend but not locally.
//!
//! A lost record can only be rebuilt if the job's driver has a deterministic
//! mapping from local job id to backend external id (for the batch driver,
//! the id is encoded in the backend job name). The rebuilt record lands in a
//! fixed `/recovered` folder since the original placement is gone, with the
//! command marked unknown; the backend's statuses seed the cache so the next
//! status read is free.

use chrono::Utc;

use crate::cache::StatusCache;
use crate::driver::DriverRegistry;
use crate::error::{KongError, Result};
use crate::model::{Job, JobId, Provenance, ResourceRequest};
use crate::store::Store;

/// Placeholder command on a recovered job; the original is unrecoverable.
pub const UNKNOWN_COMMAND: &str = "<unknown>";

/// Folder that collects recovered jobs.
pub const RECOVERED_PATH: &str = "/recovered";

/// Recovers `job_id` through `driver_name`'s backend. Idempotent: an id
/// that already has a local record fails `AlreadyExists`.
pub fn recover_job(
    store: &Store,
    cache: &StatusCache,
    registry: &DriverRegistry,
    job_id: JobId,
    driver_name: &str,
) -> Result<Job> {
    let driver = registry.get(driver_name)?;
    let external_id = driver.external_id_for(job_id).ok_or_else(|| {
        KongError::NotAvailable(format!(
            "driver '{driver_name}' has no recovery mapping for job ids"
        ))
    })?;

    // Check before the backend round trip; checked again inside the
    // transaction since another invocation may have won the race.
    if store.load()?.has_job(job_id) {
        return Err(KongError::AlreadyExists(format!("job {job_id}")));
    }

    let recovered = driver.recover(&external_id)?;

    let job = store.transaction(|state| {
        let folder = state.create_folder_path(crate::store::ROOT_ID, RECOVERED_PATH)?;
        let now = Utc::now();
        let job = Job {
            id: job_id,
            folder,
            command: UNKNOWN_COMMAND.to_string(),
            driver: driver_name.to_string(),
            external_id: Some(external_id.clone()),
            submitted_at: None,
            resources: ResourceRequest::default(),
            array_size: recovered.array_size.max(1),
            provenance: Provenance::Recovered,
            resubmitted_from: None,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        };
        let id = state.insert_recovered_job(job)?;
        Ok(state.job(id)?.clone())
    })?;

    cache.seed(&external_id, recovered.statuses)?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KongConfig;
    use crate::driver::{Driver, JobSpec, OutputStream, RecoveredJob};
    use crate::model::SubJobStatus;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Backend stub that "remembers" one job under the standard name
    /// encoding, as a scheduler would after local state loss.
    struct RememberingDriver {
        known: String,
    }

    impl Driver for RememberingDriver {
        fn name(&self) -> &'static str {
            "batch"
        }

        fn submit(&self, _spec: &JobSpec) -> Result<String> {
            unimplemented!()
        }

        fn query_status(
            &self,
            external_ids: &[String],
        ) -> Result<HashMap<String, Vec<SubJobStatus>>> {
            Ok(external_ids
                .iter()
                .map(|id| (id.clone(), vec![SubJobStatus::Unknown]))
                .collect())
        }

        fn kill(&self, _external_id: &str) -> Result<()> {
            unimplemented!()
        }

        fn peek(
            &self,
            _external_id: &str,
            _subjob: usize,
            _stream: OutputStream,
        ) -> Result<String> {
            unimplemented!()
        }

        fn recover(&self, external_id: &str) -> Result<RecoveredJob> {
            if external_id == self.known {
                Ok(RecoveredJob {
                    statuses: vec![SubJobStatus::Done, SubJobStatus::Failed],
                    array_size: 2,
                    command: None,
                })
            } else {
                Err(KongError::NotFound(format!(
                    "scheduler has no record of {external_id}"
                )))
            }
        }

        fn external_id_for(&self, job_id: JobId) -> Option<String> {
            Some(format!("kong_{job_id:05}"))
        }
    }

    fn setup(dir: &TempDir) -> (KongConfig, Store, StatusCache, DriverRegistry) {
        let config = KongConfig::with_data_dir(dir.path());
        let store = Store::new(&config);
        let cache = StatusCache::new(&config);
        let mut registry = DriverRegistry::new();
        registry.register(Box::new(RememberingDriver {
            known: "kong_00042".to_string(),
        }));
        (config, store, cache, registry)
    }

    #[test]
    fn rebuilds_a_lost_record_into_the_recovered_folder() {
        let dir = TempDir::new().unwrap();
        let (_config, store, cache, registry) = setup(&dir);

        let job = recover_job(&store, &cache, &registry, 42, "batch").unwrap();
        assert_eq!(job.id, 42);
        assert_eq!(job.command, UNKNOWN_COMMAND);
        assert_eq!(job.provenance, Provenance::Recovered);
        assert_eq!(job.array_size, 2);
        assert_eq!(job.external_id.as_deref(), Some("kong_00042"));

        let state = store.load().unwrap();
        let folder = state.find_by_path(crate::store::ROOT_ID, RECOVERED_PATH).unwrap();
        assert_eq!(state.job(42).unwrap().folder, folder.id);
    }

    #[test]
    fn recovery_seeds_the_status_cache() {
        let dir = TempDir::new().unwrap();
        let (_config, store, cache, registry) = setup(&dir);

        recover_job(&store, &cache, &registry, 42, "batch").unwrap();

        // Served from the seeded cache, never from query_status (which
        // would report unknown).
        let driver = registry.get("batch").unwrap();
        let statuses = cache
            .statuses(driver, &["kong_00042".to_string()], false)
            .unwrap();
        assert_eq!(
            statuses["kong_00042"],
            vec![SubJobStatus::Done, SubJobStatus::Failed]
        );
    }

    #[test]
    fn recovering_twice_fails_already_exists() {
        let dir = TempDir::new().unwrap();
        let (_config, store, cache, registry) = setup(&dir);

        recover_job(&store, &cache, &registry, 42, "batch").unwrap();
        let err = recover_job(&store, &cache, &registry, 42, "batch").unwrap_err();
        assert!(matches!(err, KongError::AlreadyExists(_)));
    }

    #[test]
    fn unknown_backend_record_surfaces_not_found() {
        let dir = TempDir::new().unwrap();
        let (_config, store, cache, registry) = setup(&dir);

        let err = recover_job(&store, &cache, &registry, 7, "batch").unwrap_err();
        assert!(matches!(err, KongError::NotFound(_)));
        assert!(!store.load().unwrap().has_job(7));
    }

    #[test]
    fn fresh_ids_never_collide_with_a_recovered_id() {
        let dir = TempDir::new().unwrap();
        let (_config, store, cache, registry) = setup(&dir);

        recover_job(&store, &cache, &registry, 42, "batch").unwrap();
        let new_id = store
            .transaction(|state| {
                let folder = state.create_folder(crate::store::ROOT_ID, "work")?;
                state.create_job(folder, "true", "local", ResourceRequest::default(), 1)
            })
            .unwrap();
        assert!(new_id > 42);
    }
}
