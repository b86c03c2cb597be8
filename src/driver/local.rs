//! Driver that runs jobs as local subprocesses.
//!
//! Each subjob gets a wrapper script that exports the job environment, runs
//! the command, and records the exit code to a file. Status is derived from
//! that file and from process liveness, so it survives the short-lived CLI
//! process that spawned the job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Driver, JobSpec, OutputStream, RecoveredJob};
use crate::config::KongConfig;
use crate::error::{KongError, Result};
use crate::model::{JobId, SubJobStatus};

const SCRIPT_TEMPLATE: &str = r#"#!/usr/bin/env bash

{exports}

({command}) >> "{stdout}" 2>> "{stderr}"
echo $? > "{exit_file}"
"#;

/// Per-submission bookkeeping, persisted so later invocations can resolve an
/// external id back to pids and artifact paths.
#[derive(Debug, Serialize, Deserialize)]
struct LocalMeta {
    job_id: JobId,
    array_size: u32,
    log_dir: PathBuf,
    pids: Vec<i32>,
}

pub struct LocalDriver {
    meta_dir: PathBuf,
}

impl LocalDriver {
    pub fn new(config: &KongConfig) -> Self {
        Self {
            meta_dir: config.driver_meta_dir("local"),
        }
    }

    fn meta_path(&self, external_id: &str) -> PathBuf {
        self.meta_dir.join(format!("{external_id}.json"))
    }

    fn load_meta(&self, external_id: &str) -> Result<LocalMeta> {
        let path = self.meta_path(external_id);
        if !path.exists() {
            return Err(KongError::NotFound(format!(
                "no local submission record for {external_id}"
            )));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    fn save_meta(&self, external_id: &str, meta: &LocalMeta) -> Result<()> {
        std::fs::create_dir_all(&self.meta_dir)?;
        std::fs::write(self.meta_path(external_id), serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    fn exit_file(meta: &LocalMeta, subjob: usize) -> PathBuf {
        meta.log_dir.join(format!("exit_status.{subjob}.txt"))
    }

    fn kill_marker(meta: &LocalMeta, subjob: usize) -> PathBuf {
        meta.log_dir.join(format!("killed.{subjob}"))
    }

    fn subjob_status(meta: &LocalMeta, subjob: usize) -> SubJobStatus {
        // The exit file is written before the process exits, so it wins
        // over liveness checks and kill markers.
        let exit_file = Self::exit_file(meta, subjob);
        if let Ok(contents) = std::fs::read_to_string(&exit_file) {
            return match contents.trim().parse::<i32>() {
                Ok(0) => SubJobStatus::Done,
                Ok(_) => SubJobStatus::Failed,
                Err(_) => SubJobStatus::Unknown,
            };
        }
        if Self::kill_marker(meta, subjob).exists() {
            return SubJobStatus::Killed;
        }
        match meta.pids.get(subjob) {
            Some(&pid) if pid > 0 && unsafe { libc::kill(pid, 0) } == 0 => {
                SubJobStatus::Running
            }
            _ => SubJobStatus::Unknown,
        }
    }
}

impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&self, spec: &JobSpec) -> Result<String> {
        spec.env.prepare_dirs()?;

        let external_id = Uuid::new_v4().to_string();
        let mut pids = Vec::with_capacity(spec.array_size as usize);

        let exports = spec
            .env
            .vars()
            .into_iter()
            .map(|(key, value)| format!("export {key}=\"{value}\""))
            .collect::<Vec<_>>()
            .join("\n");

        for subjob in 0..spec.array_size as usize {
            // The command is user text and may itself contain placeholder
            // strings, so it must be substituted after every other slot.
            let script = SCRIPT_TEMPLATE
                .replace("{exports}", &exports)
                .replace("{stdout}", &spec.env.stdout_file(subjob).display().to_string())
                .replace("{stderr}", &spec.env.stderr_file(subjob).display().to_string())
                .replace(
                    "{exit_file}",
                    &spec.env.log_dir.join(format!("exit_status.{subjob}.txt")).display().to_string(),
                )
                .replace("{command}", &spec.command);

            let script_path = spec.env.log_dir.join(format!("jobscript.{subjob}.sh"));
            std::fs::write(&script_path, script)?;

            let child = Command::new("/usr/bin/env")
                .arg("bash")
                .arg(&script_path)
                .current_dir(&spec.env.output_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| KongError::SubmissionError(e.to_string()))?;
            pids.push(child.id() as i32);
        }

        self.save_meta(
            &external_id,
            &LocalMeta {
                job_id: spec.job_id,
                array_size: spec.array_size,
                log_dir: spec.env.log_dir.clone(),
                pids,
            },
        )?;
        Ok(external_id)
    }

    fn query_status(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, Vec<SubJobStatus>>> {
        let mut out = HashMap::with_capacity(external_ids.len());
        for id in external_ids {
            let statuses = match self.load_meta(id) {
                Ok(meta) => (0..meta.array_size as usize)
                    .map(|s| Self::subjob_status(&meta, s))
                    .collect(),
                Err(_) => vec![SubJobStatus::Unknown],
            };
            out.insert(id.clone(), statuses);
        }
        Ok(out)
    }

    fn kill(&self, external_id: &str) -> Result<()> {
        let meta = self.load_meta(external_id)?;
        for subjob in 0..meta.array_size as usize {
            if Self::exit_file(&meta, subjob).exists() {
                continue; // already finished
            }
            if let Some(&pid) = meta.pids.get(subjob)
                && pid > 0
            {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
            }
            std::fs::write(Self::kill_marker(&meta, subjob), b"")?;
        }
        Ok(())
    }

    fn peek(&self, external_id: &str, subjob: usize, stream: OutputStream) -> Result<String> {
        let meta = self.load_meta(external_id)?;
        let name = match stream {
            OutputStream::Stdout => format!("stdout.{subjob}.txt"),
            OutputStream::Stderr => format!("stderr.{subjob}.txt"),
        };
        let path = meta.log_dir.join(name);
        if !path.exists() {
            return Err(KongError::NotAvailable(format!(
                "{external_id}[{subjob}] has produced no output yet"
            )));
        }
        Ok(std::fs::read_to_string(path)?)
    }

    fn recover(&self, external_id: &str) -> Result<RecoveredJob> {
        // Local submissions die with the host; there is nothing to rebuild
        // a record from.
        Err(KongError::NotAvailable(format!(
            "local driver cannot recover {external_id}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::JobEnv;
    use crate::model::ResolvedResources;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn spec(config: &KongConfig, job_id: JobId, command: &str, array_size: u32) -> JobSpec {
        JobSpec {
            job_id,
            command: command.to_string(),
            resources: ResolvedResources {
                cores: 1,
                memory_mb: 100,
                queue: "normal".into(),
                wall_time_mins: 1,
            },
            array_size,
            env: JobEnv::compute(job_id, 1, config),
        }
    }

    fn wait_until_terminal(
        driver: &LocalDriver,
        external_id: &str,
    ) -> Vec<SubJobStatus> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let statuses = driver
                .query_status(std::slice::from_ref(&external_id.to_string()))
                .unwrap()
                .remove(external_id)
                .unwrap();
            if statuses.iter().all(|s| s.is_terminal()) || Instant::now() > deadline {
                return statuses;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn submit_runs_command_to_done() {
        let dir = TempDir::new().unwrap();
        let config = KongConfig::with_data_dir(dir.path());
        let driver = LocalDriver::new(&config);

        let ext = driver.submit(&spec(&config, 1, "echo hello", 1)).unwrap();
        let statuses = wait_until_terminal(&driver, &ext);
        assert_eq!(statuses, vec![SubJobStatus::Done]);

        let out = driver.peek(&ext, 0, OutputStream::Stdout).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn command_text_is_never_treated_as_template() {
        let dir = TempDir::new().unwrap();
        let config = KongConfig::with_data_dir(dir.path());
        let driver = LocalDriver::new(&config);

        let ext = driver
            .submit(&spec(&config, 8, "echo '{stdout}'", 1))
            .unwrap();
        let statuses = wait_until_terminal(&driver, &ext);
        assert_eq!(statuses, vec![SubJobStatus::Done]);

        // The literal placeholder comes through, not a substituted path.
        let out = driver.peek(&ext, 0, OutputStream::Stdout).unwrap();
        assert_eq!(out.trim(), "{stdout}");
    }

    #[test]
    fn failing_command_reports_failed() {
        let dir = TempDir::new().unwrap();
        let config = KongConfig::with_data_dir(dir.path());
        let driver = LocalDriver::new(&config);

        let ext = driver.submit(&spec(&config, 2, "exit 3", 1)).unwrap();
        let statuses = wait_until_terminal(&driver, &ext);
        assert_eq!(statuses, vec![SubJobStatus::Failed]);
    }

    #[test]
    fn array_job_runs_each_subjob() {
        let dir = TempDir::new().unwrap();
        let config = KongConfig::with_data_dir(dir.path());
        let driver = LocalDriver::new(&config);

        let ext = driver
            .submit(&spec(&config, 3, "echo sub $KONG_JOB_ID", 3))
            .unwrap();
        let statuses = wait_until_terminal(&driver, &ext);
        assert_eq!(statuses, vec![SubJobStatus::Done; 3]);

        // Each subjob saw the job id in its environment.
        for subjob in 0..3 {
            let out = driver.peek(&ext, subjob, OutputStream::Stdout).unwrap();
            assert_eq!(out.trim(), "sub 3");
        }
    }

    #[test]
    fn kill_marks_unfinished_subjobs_killed() {
        let dir = TempDir::new().unwrap();
        let config = KongConfig::with_data_dir(dir.path());
        let driver = LocalDriver::new(&config);

        let ext = driver.submit(&spec(&config, 4, "sleep 30", 1)).unwrap();
        driver.kill(&ext).unwrap();

        let statuses = wait_until_terminal(&driver, &ext);
        assert_eq!(statuses, vec![SubJobStatus::Killed]);
    }

    #[test]
    fn peek_before_output_is_not_available() {
        let dir = TempDir::new().unwrap();
        let config = KongConfig::with_data_dir(dir.path());
        let driver = LocalDriver::new(&config);

        let err = driver.peek("no-such-id", 0, OutputStream::Stdout).unwrap_err();
        assert!(matches!(err, KongError::NotFound(_)));
    }

    #[test]
    fn unknown_external_id_maps_to_unknown_status() {
        let dir = TempDir::new().unwrap();
        let config = KongConfig::with_data_dir(dir.path());
        let driver = LocalDriver::new(&config);

        let statuses = driver
            .query_status(&["ghost".to_string()])
            .unwrap()
            .remove("ghost")
            .unwrap();
        assert_eq!(statuses, vec![SubJobStatus::Unknown]);
    }

    #[test]
    fn recover_is_not_supported() {
        let dir = TempDir::new().unwrap();
        let config = KongConfig::with_data_dir(dir.path());
        let driver = LocalDriver::new(&config);
        assert!(matches!(
            driver.recover("anything"),
            Err(KongError::NotAvailable(_))
        ));
        assert_eq!(driver.external_id_for(5), None);
    }
}
