//! Execution backends ("drivers").
//!
//! Every backend satisfies the same five-operation contract; callers pick an
//! implementation by the name stored on the job, dispatched through
//! [`DriverRegistry`]. Nothing in the core depends on a specific backend's
//! textual protocol.

mod batch;
mod local;

use std::collections::HashMap;
use std::path::PathBuf;

pub use batch::BatchDriver;
pub use local::LocalDriver;

use crate::config::KongConfig;
use crate::error::{KongError, Result};
use crate::model::{JobId, ResolvedResources, SubJobStatus};

/// Which output stream `peek` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Everything a driver needs to launch one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: JobId,
    pub command: String,
    pub resources: ResolvedResources,
    pub array_size: u32,
    pub env: JobEnv,
}

/// Partial job fields a driver can reconstruct from backend state alone.
#[derive(Debug, Clone)]
pub struct RecoveredJob {
    /// Per-subjob statuses, indexed by subjob.
    pub statuses: Vec<SubJobStatus>,
    pub array_size: u32,
    /// The command is usually lost; `None` means unknown.
    pub command: Option<String>,
}

/// The fixed per-job runtime environment, a deterministic function of the
/// job id and the configured base directories. Recomputed for every job id,
/// so a resubmitted job (which has a new id) never reuses directories.
#[derive(Debug, Clone)]
pub struct JobEnv {
    pub job_id: JobId,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub nproc: u32,
    pub scratch_dir: PathBuf,
}

/// Splits a zero-padded job id into `ab/cd/abcdef` to keep directory fanout
/// bounded as job counts grow.
fn split_id(job_id: JobId) -> PathBuf {
    let s = format!("{job_id:06}");
    let head = s.len() - 6;
    let (a, rest) = s.split_at(head + 2);
    let (b, _) = rest.split_at(2);
    PathBuf::from(a).join(b).join(&s)
}

impl JobEnv {
    pub fn compute(job_id: JobId, nproc: u32, config: &KongConfig) -> Self {
        let leaf = split_id(job_id);
        Self {
            job_id,
            output_dir: config.output_base().join(&leaf),
            log_dir: config.log_base().join(&leaf),
            nproc,
            scratch_dir: config.scratch_base().join(&leaf),
        }
    }

    /// The variables exported into the executing command's environment.
    pub fn vars(&self) -> Vec<(String, String)> {
        vec![
            ("KONG_JOB_ID".into(), self.job_id.to_string()),
            (
                "KONG_JOB_OUTPUT_DIR".into(),
                self.output_dir.display().to_string(),
            ),
            ("KONG_JOB_LOG_DIR".into(), self.log_dir.display().to_string()),
            ("KONG_JOB_NPROC".into(), self.nproc.to_string()),
            (
                "KONG_JOB_SCRATCHDIR".into(),
                self.scratch_dir.display().to_string(),
            ),
        ]
    }

    /// Creates the output, log and scratch directories.
    pub fn prepare_dirs(&self) -> Result<()> {
        for dir in [&self.output_dir, &self.log_dir, &self.scratch_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Removes all artifacts for this job id. Missing directories are fine.
    pub fn remove_artifacts(&self) -> Result<()> {
        for dir in [&self.output_dir, &self.log_dir, &self.scratch_dir] {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn stdout_file(&self, subjob: usize) -> PathBuf {
        self.log_dir.join(format!("stdout.{subjob}.txt"))
    }

    pub fn stderr_file(&self, subjob: usize) -> PathBuf {
        self.log_dir.join(format!("stderr.{subjob}.txt"))
    }
}

/// The capability contract every backend implements.
///
/// Submission is never retried by the core; `kill` is best effort and
/// asynchronous, so callers poll status afterwards.
pub trait Driver {
    fn name(&self) -> &'static str;

    /// Launches the job, returning the backend's identifier for it.
    fn submit(&self, spec: &JobSpec) -> Result<String>;

    /// Per-subjob statuses for a set of external ids, batched into as few
    /// backend calls as possible. Ids the backend has no record of map to
    /// `Unknown`.
    fn query_status(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, Vec<SubJobStatus>>>;

    fn kill(&self, external_id: &str) -> Result<()>;

    /// Reads produced output; `NotAvailable` before any exists.
    fn peek(&self, external_id: &str, subjob: usize, stream: OutputStream) -> Result<String>;

    /// Best-effort reconstruction of job fields from backend state.
    fn recover(&self, external_id: &str) -> Result<RecoveredJob>;

    /// The backend external id a given local job id would map to, if this
    /// driver supports recovery at all.
    fn external_id_for(&self, _job_id: JobId) -> Option<String> {
        None
    }
}

/// Name-keyed driver dispatch. Selection is by stored name only.
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Box<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// The standard registry with the local and batch drivers.
    pub fn standard(config: &KongConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(LocalDriver::new(config)));
        registry.register(Box::new(BatchDriver::new(config)));
        registry
    }

    pub fn register(&mut self, driver: Box<dyn Driver>) {
        self.drivers.insert(driver.name(), driver);
    }

    pub fn get(&self, name: &str) -> Result<&dyn Driver> {
        self.drivers
            .get(name)
            .map(|d| d.as_ref())
            .ok_or_else(|| KongError::NotFound(format!("driver '{name}'")))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_is_deterministic_per_job_id() {
        let config = KongConfig::with_data_dir("/tmp/kong-env");
        let a = JobEnv::compute(123, 4, &config);
        let b = JobEnv::compute(123, 4, &config);
        assert_eq!(a.output_dir, b.output_dir);
        assert_eq!(a.log_dir, b.log_dir);
        assert_eq!(a.scratch_dir, b.scratch_dir);

        // A different id gets entirely fresh directories.
        let c = JobEnv::compute(124, 4, &config);
        assert_ne!(a.output_dir, c.output_dir);
        assert_ne!(a.log_dir, c.log_dir);
    }

    #[test]
    fn id_split_keeps_fanout_bounded() {
        assert_eq!(split_id(123), PathBuf::from("00/01/000123"));
        assert_eq!(split_id(1), PathBuf::from("00/00/000001"));
        assert_eq!(split_id(999_999), PathBuf::from("99/99/999999"));
        assert_eq!(split_id(1_234_567), PathBuf::from("123/45/1234567"));
    }

    #[test]
    fn env_vars_cover_the_contract() {
        let config = KongConfig::with_data_dir("/tmp/kong-env");
        let env = JobEnv::compute(7, 2, &config);
        let vars = env.vars();
        let names: Vec<&str> = vars.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "KONG_JOB_ID",
                "KONG_JOB_OUTPUT_DIR",
                "KONG_JOB_LOG_DIR",
                "KONG_JOB_NPROC",
                "KONG_JOB_SCRATCHDIR",
            ]
        );
        assert_eq!(vars[0].1, "7");
        assert_eq!(vars[3].1, "2");
    }

    #[test]
    fn registry_dispatches_by_name() {
        let config = KongConfig::with_data_dir("/tmp/kong-reg");
        let registry = DriverRegistry::standard(&config);
        assert_eq!(registry.get("local").unwrap().name(), "local");
        assert_eq!(registry.get("batch").unwrap().name(), "batch");
        assert!(matches!(
            registry.get("nonexistent"),
            Err(KongError::NotFound(_))
        ));
    }
}
