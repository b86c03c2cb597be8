use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::folder::FolderId;
use crate::config::ResourceDefaults;

pub type JobId = u64;

/// Status of one element of a job's array.
///
/// `Created` precedes submission; `Unknown` is reported when the backend is
/// unreachable or has no record of the subjob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubJobStatus {
    Created,
    Submitted,
    Pending,
    Running,
    Done,
    Failed,
    Killed,
    Unknown,
}

impl SubJobStatus {
    /// Terminal statuses never change without a resubmission.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for SubJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SubJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "submitted" => Ok(Self::Submitted),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Whether a job record was created normally or rebuilt from backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Normal,
    Recovered,
}

/// Partial resource request. Unset fields inherit from the folder chain and
/// finally from the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub queue: Option<String>,
    pub wall_time_mins: Option<u32>,
}

impl ResourceRequest {
    pub fn is_empty(&self) -> bool {
        self.cores.is_none()
            && self.memory_mb.is_none()
            && self.queue.is_none()
            && self.wall_time_mins.is_none()
    }

    /// Fills unset fields from `other`, keeping existing values.
    pub fn or(&self, other: &ResourceRequest) -> ResourceRequest {
        ResourceRequest {
            cores: self.cores.or(other.cores),
            memory_mb: self.memory_mb.or(other.memory_mb),
            queue: self.queue.clone().or_else(|| other.queue.clone()),
            wall_time_mins: self.wall_time_mins.or(other.wall_time_mins),
        }
    }

    /// Resolves against the global default tier, producing concrete values.
    pub fn resolve(&self, defaults: &ResourceDefaults) -> ResolvedResources {
        ResolvedResources {
            cores: self.cores.unwrap_or(defaults.cores),
            memory_mb: self.memory_mb.unwrap_or(defaults.memory_mb),
            queue: self.queue.clone().unwrap_or_else(|| defaults.queue.clone()),
            wall_time_mins: self.wall_time_mins.unwrap_or(defaults.wall_time_mins),
        }
    }
}

/// Fully resolved resource configuration handed to a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResources {
    pub cores: u32,
    pub memory_mb: u64,
    pub queue: String,
    pub wall_time_mins: u32,
}

/// A unit of submitted work, possibly an array of subjobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub folder: FolderId,
    pub command: String,
    /// Registry name of the driver this job was created with.
    pub driver: String,
    /// The backend's own identifier, absent until submission.
    pub external_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: ResourceRequest,
    pub array_size: u32,
    pub provenance: Provenance,
    /// Set on a job created by resubmission, pointing at the original.
    pub resubmitted_from: Option<JobId>,
    /// The only mutation resubmission makes on an original job.
    pub superseded_by: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: JobId,
        folder: FolderId,
        command: impl Into<String>,
        driver: impl Into<String>,
        resources: ResourceRequest,
        array_size: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            folder,
            command: command.into(),
            driver: driver.into(),
            external_id: None,
            submitted_at: None,
            resources,
            array_size: array_size.max(1),
            provenance: Provenance::Normal,
            resubmitted_from: None,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.external_id.is_some()
    }
}
