use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::ResourceRequest;
use crate::error::{KongError, Result};

pub type FolderId = u64;

/// A node in the virtual job-organization tree.
///
/// The parent is stored as an id reference; children are derived by scanning
/// for that id, never embedded, so the tree cannot form reference cycles by
/// construction. Cycle checks still guard `move`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    /// `None` only for the root folder.
    pub parent: Option<FolderId>,
    /// Folder-level resource defaults, the middle tier of the precedence
    /// job > folder > global.
    #[serde(default)]
    pub resources: ResourceRequest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Folder {
    pub fn new(id: FolderId, name: impl Into<String>, parent: FolderId) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            parent: Some(parent),
            resources: ResourceRequest::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The single parentless folder created at first initialization.
    pub fn root(id: FolderId) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: "/".to_string(),
            parent: None,
            resources: ResourceRequest::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Checks a candidate folder name. All-digit names are rejected because they
/// would be indistinguishable from job ids in target expressions.
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.chars().all(|c| c.is_ascii_digit());
    if bad {
        return Err(KongError::InvalidName(name.to_string()));
    }
    Ok(())
}
