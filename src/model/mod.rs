mod folder;
mod job;

pub use folder::{Folder, FolderId, validate_name};
pub use job::{
    Job, JobId, Provenance, ResolvedResources, ResourceRequest, SubJobStatus,
};
