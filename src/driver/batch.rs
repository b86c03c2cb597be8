//! Driver for an LSF-style batch scheduler.
//!
//! All interaction goes through three configurable external commands
//! (submit, query, kill) speaking the usual textual protocol: submission
//! prints `Job <id> ...`, the query command prints one `id[index] STATUS`
//! line per subjob. Job names encode the kong job id so records lost from
//! the local state can be rebuilt from the scheduler alone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};

use super::{Driver, JobSpec, OutputStream, RecoveredJob};
use crate::config::{BatchConfig, KongConfig};
use crate::error::{KongError, Result};
use crate::model::{JobId, SubJobStatus};

const SCRIPT_TEMPLATE: &str = r#"#!/usr/bin/env bash

{exports}

cd "$KONG_JOB_OUTPUT_DIR"
{command}
"#;

/// Submission bookkeeping kept outside the shared state, so `peek` can find
/// artifact paths from an external id alone.
#[derive(Debug, Serialize, Deserialize)]
struct BatchMeta {
    job_id: JobId,
    array_size: u32,
    log_dir: PathBuf,
}

pub struct BatchDriver {
    commands: BatchConfig,
    meta_dir: PathBuf,
}

impl BatchDriver {
    pub fn new(config: &KongConfig) -> Self {
        Self {
            commands: config.batch.clone(),
            meta_dir: config.driver_meta_dir("batch"),
        }
    }

    /// Backend job name encoding the kong job id, e.g. `kong_00042`.
    fn job_name(&self, job_id: JobId) -> String {
        format!("{}_{:05}", self.commands.job_name_prefix, job_id)
    }

    fn meta_path(&self, external_id: &str) -> PathBuf {
        self.meta_dir.join(format!("{external_id}.json"))
    }

    fn load_meta(&self, external_id: &str) -> Result<BatchMeta> {
        let path = self.meta_path(external_id);
        if !path.exists() {
            return Err(KongError::NotFound(format!(
                "no batch submission record for {external_id}"
            )));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    fn save_meta(&self, external_id: &str, meta: &BatchMeta) -> Result<()> {
        std::fs::create_dir_all(&self.meta_dir)?;
        std::fs::write(self.meta_path(external_id), serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    fn run_query(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.commands.query_cmd)
            .args(args)
            .output()
            .map_err(|e| {
                KongError::TransientError(format!(
                    "failed to run {}: {e}",
                    self.commands.query_cmd
                ))
            })?;
        if !output.status.success() {
            return Err(KongError::TransientError(format!(
                "{} exited with {}: {}",
                self.commands.query_cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Extracts the scheduler's job id from submission output shaped like
/// `Job <1234> is submitted to queue <normal>.`
fn parse_submit_output(stdout: &str) -> Option<String> {
    let start = stdout.find('<')? + 1;
    let end = stdout[start..].find('>')? + start;
    let id = stdout[start..end].trim();
    if id.is_empty() { None } else { Some(id.to_string()) }
}

/// Maps a scheduler status word to a subjob status. Suspended flavors count
/// as pending; anything unrecognized is unknown rather than an error.
fn parse_status_word(word: &str) -> SubJobStatus {
    match word {
        "PEND" | "PSUSP" | "SSUSP" | "USUSP" | "WAIT" | "PROV" => SubJobStatus::Pending,
        "RUN" => SubJobStatus::Running,
        "DONE" => SubJobStatus::Done,
        "EXIT" => SubJobStatus::Failed,
        "KILL" | "ZOMBI" => SubJobStatus::Killed,
        _ => SubJobStatus::Unknown,
    }
}

/// Parses query output lines of the form `extid STATUS` or
/// `extid[index] STATUS`, grouping per external id.
fn parse_query_output(text: &str) -> HashMap<String, Vec<(usize, SubJobStatus)>> {
    let mut out: HashMap<String, Vec<(usize, SubJobStatus)>> = HashMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(id_field), Some(status_field)) = (fields.next(), fields.next()) else {
            continue;
        };
        let (id, index) = match id_field.find('[') {
            Some(open) if id_field.ends_with(']') => {
                let index = id_field[open + 1..id_field.len() - 1]
                    .parse::<usize>()
                    .unwrap_or(0);
                (&id_field[..open], index)
            }
            _ => (id_field, 0),
        };
        // Skip header lines like `JOBID STAT`.
        if id.chars().next().is_some_and(|c| !c.is_ascii_digit()) {
            continue;
        }
        out.entry(id.to_string())
            .or_default()
            .push((index, parse_status_word(status_field)));
    }
    out
}

/// Collapses indexed entries into a dense vector, padding gaps with
/// `Unknown`.
fn to_status_vec(entries: &[(usize, SubJobStatus)], min_len: usize) -> Vec<SubJobStatus> {
    let len = entries
        .iter()
        .map(|(i, _)| i + 1)
        .max()
        .unwrap_or(0)
        .max(min_len);
    let mut statuses = vec![SubJobStatus::Unknown; len];
    for &(index, status) in entries {
        if index < len {
            statuses[index] = status;
        }
    }
    statuses
}

impl Driver for BatchDriver {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn submit(&self, spec: &JobSpec) -> Result<String> {
        spec.env.prepare_dirs()?;

        let exports = spec
            .env
            .vars()
            .into_iter()
            .map(|(key, value)| format!("export {key}=\"{value}\""))
            .collect::<Vec<_>>()
            .join("\n");
        let script = SCRIPT_TEMPLATE
            .replace("{exports}", &exports)
            .replace("{command}", &spec.command);
        let script_path = spec.env.log_dir.join("jobscript.sh");
        std::fs::write(&script_path, script)?;

        // Array submissions use the scheduler's `name[0-N]` convention; the
        // %I placeholder routes each subjob's streams to its own files.
        let name = if spec.array_size > 1 {
            format!("{}[0-{}]", self.job_name(spec.job_id), spec.array_size - 1)
        } else {
            self.job_name(spec.job_id)
        };
        let stdout_pattern = spec.env.log_dir.join("stdout.%I.txt");
        let stderr_pattern = spec.env.log_dir.join("stderr.%I.txt");

        let output = Command::new(&self.commands.submit_cmd)
            .arg("-J")
            .arg(&name)
            .arg("-q")
            .arg(&spec.resources.queue)
            .arg("-n")
            .arg(spec.resources.cores.to_string())
            .arg("-M")
            .arg(spec.resources.memory_mb.to_string())
            .arg("-W")
            .arg(spec.resources.wall_time_mins.to_string())
            .arg("-o")
            .arg(&stdout_pattern)
            .arg("-e")
            .arg(&stderr_pattern)
            .arg(&script_path)
            .output()
            .map_err(|e| {
                KongError::SubmissionError(format!(
                    "failed to run {}: {e}",
                    self.commands.submit_cmd
                ))
            })?;

        if !output.status.success() {
            return Err(KongError::SubmissionError(format!(
                "{} exited with {}: {}",
                self.commands.submit_cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let external_id = parse_submit_output(&stdout).ok_or_else(|| {
            KongError::SubmissionError(format!(
                "could not find a job id in submission output: {}",
                stdout.trim()
            ))
        })?;

        self.save_meta(
            &external_id,
            &BatchMeta {
                job_id: spec.job_id,
                array_size: spec.array_size,
                log_dir: spec.env.log_dir.clone(),
            },
        )?;
        Ok(external_id)
    }

    fn query_status(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, Vec<SubJobStatus>>> {
        if external_ids.is_empty() {
            return Ok(HashMap::new());
        }
        // One scheduler invocation for the whole batch.
        let stdout = self.run_query(external_ids)?;
        let mut parsed = parse_query_output(&stdout);

        let mut out = HashMap::with_capacity(external_ids.len());
        for id in external_ids {
            let min_len = self.load_meta(id).map(|m| m.array_size as usize).unwrap_or(1);
            let statuses = match parsed.remove(id) {
                Some(entries) => to_status_vec(&entries, min_len),
                None => vec![SubJobStatus::Unknown; min_len],
            };
            out.insert(id.clone(), statuses);
        }
        Ok(out)
    }

    fn kill(&self, external_id: &str) -> Result<()> {
        // Kill is asynchronous on the scheduler side; a nonzero exit usually
        // means the job already finished, so only a failed spawn is an error.
        Command::new(&self.commands.kill_cmd)
            .arg(external_id)
            .output()
            .map_err(|e| {
                KongError::TransientError(format!(
                    "failed to run {}: {e}",
                    self.commands.kill_cmd
                ))
            })?;
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
        let stdout = self.run_query(&[external_id.to_string()])?;
        let parsed = parse_query_output(&stdout);
        let Some(entries) = parsed.get(external_id) else {
            return Err(KongError::NotFound(format!(
                "scheduler has no record of {external_id}"
            )));
        };
        let statuses = to_status_vec(entries, 1);
        Ok(RecoveredJob {
            array_size: statuses.len() as u32,
            statuses,
            command: None,
        })
    }

    fn external_id_for(&self, job_id: JobId) -> Option<String> {
        Some(self.job_name(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::JobEnv;
    use crate::model::ResolvedResources;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Writes an executable stub script and returns its path as a string.
    fn stub(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/usr/bin/env bash\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.display().to_string()
    }

    fn config_with_stubs(dir: &TempDir, submit: &str, query: &str, kill: &str) -> KongConfig {
        let mut config = KongConfig::with_data_dir(dir.path().join("data"));
        config.batch.submit_cmd = submit.to_string();
        config.batch.query_cmd = query.to_string();
        config.batch.kill_cmd = kill.to_string();
        config
    }

    fn spec(config: &KongConfig, job_id: JobId, array_size: u32) -> JobSpec {
        JobSpec {
            job_id,
            command: "echo hi".to_string(),
            resources: ResolvedResources {
                cores: 2,
                memory_mb: 500,
                queue: "short".into(),
                wall_time_mins: 10,
            },
            array_size,
            env: JobEnv::compute(job_id, 2, config),
        }
    }

    #[test]
    fn submit_parses_scheduler_job_id() {
        let dir = TempDir::new().unwrap();
        let submit = stub(&dir, "submit", r#"echo "Job <4242> is submitted to queue <short>.""#);
        let config = config_with_stubs(&dir, &submit, "true", "true");
        let driver = BatchDriver::new(&config);

        let ext = driver.submit(&spec(&config, 42, 1)).unwrap();
        assert_eq!(ext, "4242");

        // The job script landed in the log dir.
        let env = JobEnv::compute(42, 2, &config);
        let script = std::fs::read_to_string(env.log_dir.join("jobscript.sh")).unwrap();
        assert!(script.contains("export KONG_JOB_ID=\"42\""));
        assert!(script.contains("echo hi"));
    }

    #[test]
    fn failed_submission_surfaces_stderr() {
        let dir = TempDir::new().unwrap();
        let submit = stub(&dir, "submit", "echo 'queue does not exist' >&2; exit 1");
        let config = config_with_stubs(&dir, &submit, "true", "true");
        let driver = BatchDriver::new(&config);

        let err = driver.submit(&spec(&config, 1, 1)).unwrap_err();
        match err {
            KongError::SubmissionError(msg) => assert!(msg.contains("queue does not exist")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn query_maps_status_words() {
        let dir = TempDir::new().unwrap();
        let query = stub(
            &dir,
            "query",
            r#"echo "JOBID STAT"
echo "100 RUN"
echo "200 DONE"
echo "300 EXIT"
echo "400 PEND""#,
        );
        let config = config_with_stubs(&dir, "true", &query, "true");
        let driver = BatchDriver::new(&config);

        let ids: Vec<String> = ["100", "200", "300", "400"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let statuses = driver.query_status(&ids).unwrap();
        assert_eq!(statuses["100"], vec![SubJobStatus::Running]);
        assert_eq!(statuses["200"], vec![SubJobStatus::Done]);
        assert_eq!(statuses["300"], vec![SubJobStatus::Failed]);
        assert_eq!(statuses["400"], vec![SubJobStatus::Pending]);
    }

    #[test]
    fn query_groups_array_subjobs() {
        let dir = TempDir::new().unwrap();
        let query = stub(
            &dir,
            "query",
            r#"echo "100[0] DONE"
echo "100[1] RUN"
echo "100[2] PEND""#,
        );
        let config = config_with_stubs(&dir, "true", &query, "true");
        let driver = BatchDriver::new(&config);

        let statuses = driver.query_status(&["100".to_string()]).unwrap();
        assert_eq!(
            statuses["100"],
            vec![
                SubJobStatus::Done,
                SubJobStatus::Running,
                SubJobStatus::Pending,
            ]
        );
    }

    #[test]
    fn absent_ids_report_unknown() {
        let dir = TempDir::new().unwrap();
        let query = stub(&dir, "query", "true");
        let config = config_with_stubs(&dir, "true", &query, "true");
        let driver = BatchDriver::new(&config);

        let statuses = driver.query_status(&["555".to_string()]).unwrap();
        assert_eq!(statuses["555"], vec![SubJobStatus::Unknown]);
    }

    #[test]
    fn unreachable_scheduler_is_transient() {
        let dir = TempDir::new().unwrap();
        let query = stub(&dir, "query", "echo 'cannot connect' >&2; exit 255");
        let config = config_with_stubs(&dir, "true", &query, "true");
        let driver = BatchDriver::new(&config);

        let err = driver.query_status(&["1".to_string()]).unwrap_err();
        assert!(matches!(err, KongError::TransientError(_)));
    }

    #[test]
    fn recover_rebuilds_statuses_from_query() {
        let dir = TempDir::new().unwrap();
        let query = stub(
            &dir,
            "query",
            r#"echo "777[0] DONE"
echo "777[1] EXIT""#,
        );
        let config = config_with_stubs(&dir, "true", &query, "true");
        let driver = BatchDriver::new(&config);

        let recovered = driver.recover("777").unwrap();
        assert_eq!(recovered.array_size, 2);
        assert_eq!(
            recovered.statuses,
            vec![SubJobStatus::Done, SubJobStatus::Failed]
        );
        assert!(recovered.command.is_none());

        assert!(matches!(
            driver.recover("888"),
            Err(KongError::NotFound(_))
        ));
    }

    #[test]
    fn job_name_encodes_the_job_id() {
        let dir = TempDir::new().unwrap();
        let config = config_with_stubs(&dir, "true", "true", "true");
        let driver = BatchDriver::new(&config);
        assert_eq!(driver.external_id_for(42), Some("kong_00042".to_string()));
        assert_eq!(driver.external_id_for(123_456), Some("kong_123456".to_string()));
    }

    #[test]
    fn submit_output_parsing() {
        assert_eq!(
            parse_submit_output("Job <99> is submitted to queue <normal>."),
            Some("99".to_string())
        );
        assert_eq!(parse_submit_output("no id here"), None);
        assert_eq!(parse_submit_output("Job <> oops"), None);
    }
}
