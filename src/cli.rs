//! clap-based command-line interface.
//!
//! Defines the [`Cli`] struct with its subcommands and global flags. Target
//! arguments accept the full expression grammar: job ids, `A-B` and `A+K`
//! ranges, folder paths and globs.

use clap::{Parser, Subcommand};

use crate::model::SubJobStatus;

/// Parses a `--status` filter value. Only outcome statuses and the two
/// in-flight ones qualify a job for resubmission; `created`, `submitted`
/// and `unknown` are rejected up front.
fn resubmit_status(s: &str) -> Result<SubJobStatus, String> {
    let status = s.parse::<SubJobStatus>()?;
    match status {
        SubJobStatus::Created | SubJobStatus::Submitted | SubJobStatus::Unknown => Err(
            format!("'{status}' is not a resubmittable status (expected done, failed, killed, pending or running)"),
        ),
        _ => Ok(status),
    }
}

/// kong — batch-compute job tracker.
#[derive(Debug, Parser)]
#[command(name = "kong", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Bypass the status cache TTL and query the backend directly.
    #[arg(long, short, global = true, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a folder, including missing parents.
    Mkdir {
        /// Folder path, e.g. /exp/run1.
        path: String,

        /// Default CPU cores for jobs in this folder.
        #[arg(long)]
        cores: Option<u32>,

        /// Default memory in MB for jobs in this folder.
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Default queue for jobs in this folder.
        #[arg(long)]
        queue: Option<String>,

        /// Default wall time in minutes for jobs in this folder.
        #[arg(long)]
        wall_time_mins: Option<u32>,
    },

    /// List a folder's subfolders and jobs.
    Ls {
        /// Folder path; defaults to the root.
        #[arg(default_value = "/")]
        path: String,

        /// Descend into subfolders.
        #[arg(long, short = 'R')]
        recursive: bool,

        /// Also fetch and show per-job status summaries.
        #[arg(long)]
        status: bool,
    },

    /// Create a job in a folder.
    Create {
        /// Folder to place the job in.
        path: String,

        /// Command line the job will run.
        command: String,

        /// Driver to submit through.
        #[arg(long)]
        driver: Option<String>,

        /// Number of array subjobs.
        #[arg(long, default_value_t = 1)]
        array_size: u32,

        /// CPU cores per subjob.
        #[arg(long)]
        cores: Option<u32>,

        /// Memory per subjob in MB.
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Backend queue name.
        #[arg(long)]
        queue: Option<String>,

        /// Wall time limit in minutes.
        #[arg(long)]
        wall_time_mins: Option<u32>,
    },

    /// Submit jobs matched by a target expression.
    Submit {
        /// Target tokens: ids, ranges, paths, globs.
        #[arg(required = true)]
        targets: Vec<String>,

        /// Include jobs in subfolders of matched folders.
        #[arg(long, short = 'R')]
        recursive: bool,
    },

    /// Show per-subjob statuses for matched jobs.
    Status {
        #[arg(required = true)]
        targets: Vec<String>,

        #[arg(long, short = 'R')]
        recursive: bool,
    },

    /// Kill matched jobs on their backends.
    Kill {
        #[arg(required = true)]
        targets: Vec<String>,

        #[arg(long, short = 'R')]
        recursive: bool,
    },

    /// Read captured output of one subjob.
    Peek {
        job_id: u64,

        /// Array index to read.
        #[arg(long, default_value_t = 0)]
        subjob: usize,

        /// Read stderr instead of stdout.
        #[arg(long)]
        stderr: bool,

        /// Show only the last N lines.
        #[arg(long)]
        tail: Option<usize>,
    },

    /// Delete matched jobs and their output artifacts.
    Rm {
        #[arg(required = true)]
        targets: Vec<String>,

        #[arg(long, short = 'R')]
        recursive: bool,
    },

    /// Delete a folder.
    Rmdir {
        path: String,

        /// Also delete contained folders and jobs.
        #[arg(long, short)]
        recursive: bool,
    },

    /// Move a job or folder into another folder.
    Mv {
        /// Job id or folder path.
        source: String,

        /// Destination folder path.
        dest: String,
    },

    /// Resubmit matched jobs whose status matches the filter.
    Resubmit {
        #[arg(required = true)]
        targets: Vec<String>,

        /// Statuses that qualify a job for resubmission.
        #[arg(
            long,
            value_delimiter = ',',
            value_parser = resubmit_status,
            default_values_t = [SubJobStatus::Failed]
        )]
        status: Vec<SubJobStatus>,

        #[arg(long, short = 'R')]
        recursive: bool,
    },

    /// Rebuild a lost job record from backend state.
    Recover {
        job_id: u64,

        /// Driver whose backend still knows the job.
        #[arg(long, default_value = "batch")]
        driver: String,
    },
}
