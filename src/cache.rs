//! Persisted TTL cache for backend status queries.
//!
//! Status queries against a real scheduler are slow and rate limited, so
//! results are cached on disk keyed by external id. Entries younger than the
//! TTL are served without touching the backend; stale or missing entries are
//! fetched in one batched call per lookup. Entries whose subjobs are all
//! terminal never expire. `force` bypasses freshness but still records the
//! fresh result.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::KongConfig;
use crate::driver::Driver;
use crate::error::Result;
use crate::lock::LockGuard;
use crate::model::SubJobStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    statuses: Vec<SubJobStatus>,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheData {
    entries: HashMap<String, CacheEntry>,
}

pub struct StatusCache {
    cache_file: PathBuf,
    lock_file: PathBuf,
    ttl: chrono::Duration,
    lock_timeout: std::time::Duration,
}

impl StatusCache {
    pub fn new(config: &KongConfig) -> Self {
        let cache_file = config.cache_file();
        Self {
            lock_file: cache_file.with_extension("lock"),
            cache_file,
            ttl: chrono::Duration::from_std(config.cache_ttl())
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            lock_timeout: config.lock_timeout(),
        }
    }

    fn load(&self) -> Result<CacheData> {
        if !self.cache_file.exists() {
            return Ok(CacheData::default());
        }
        let contents = std::fs::read_to_string(&self.cache_file)?;
        // A corrupt cache is not fatal; it only costs a backend round trip.
        Ok(serde_json::from_str(&contents).unwrap_or_default())
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        // Terminal statuses never change without a resubmission, so those
        // entries stay fresh forever.
        let settled =
            !entry.statuses.is_empty() && entry.statuses.iter().all(|s| s.is_terminal());
        settled || now - entry.fetched_at < self.ttl
    }

    /// Merges `updates` into the persisted cache under the cache lock, so
    /// concurrent refreshes never clobber each other's entries.
    fn merge_and_persist(&self, updates: &HashMap<String, Vec<SubJobStatus>>) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_file, self.lock_timeout)?;
        let mut data = self.load()?;
        let now = Utc::now();
        for (id, statuses) in updates {
            data.entries.insert(
                id.clone(),
                CacheEntry {
                    statuses: statuses.clone(),
                    fetched_at: now,
                },
            );
        }
        self.persist(&data)
    }

    fn persist(&self, data: &CacheData) -> Result<()> {
        if let Some(parent) = self.cache_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.cache_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, &self.cache_file)?;
        Ok(())
    }

    /// Per-subjob statuses for `external_ids`, served from cache where fresh.
    /// At most one backend call is made, covering every stale id.
    pub fn statuses(
        &self,
        driver: &dyn Driver,
        external_ids: &[String],
        force: bool,
    ) -> Result<HashMap<String, Vec<SubJobStatus>>> {
        let data = self.load()?;
        let now = Utc::now();

        let mut result = HashMap::with_capacity(external_ids.len());
        let mut stale = Vec::new();
        for id in external_ids {
            match data.entries.get(id) {
                Some(entry) if !force && self.is_fresh(entry, now) => {
                    result.insert(id.clone(), entry.statuses.clone());
                }
                _ => stale.push(id.clone()),
            }
        }

        if !stale.is_empty() {
            let fetched = driver.query_status(&stale)?;
            self.merge_and_persist(&fetched)?;
            result.extend(fetched);
        }
        Ok(result)
    }

    /// Records statuses obtained outside the usual query path, e.g. during
    /// recovery, so the next lookup does not hit the backend again.
    pub fn seed(&self, external_id: &str, statuses: Vec<SubJobStatus>) -> Result<()> {
        let mut updates = HashMap::new();
        updates.insert(external_id.to_string(), statuses);
        self.merge_and_persist(&updates)
    }

    /// Drops entries, forcing the next lookup to requery. Used after kill
    /// and resubmit, where the cached picture is known to be wrong.
    pub fn invalidate(&self, external_ids: &[String]) -> Result<()> {
        let _guard = LockGuard::acquire(&self.lock_file, self.lock_timeout)?;
        let mut data = self.load()?;
        for id in external_ids {
            data.entries.remove(id);
        }
        self.persist(&data)
    }
}
