//! Persisted hierarchy of folders and jobs.
//!
//! The tree is an arena keyed by id: a folder stores its parent id and
//! children are derived by scanning, so parent/child object cycles cannot
//! exist; `move` validates against cycles explicitly. All mutations run
//! through [`Store::transaction`], which serializes concurrent invocations
//! behind a file lock and replaces the state file atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::KongConfig;
use crate::error::{KongError, Result};
use crate::lock::LockGuard;
use crate::model::{
    Folder, FolderId, Job, JobId, Provenance, ResolvedResources, ResourceRequest, validate_name,
};

pub const ROOT_ID: FolderId = 1;

/// In-memory image of the persisted hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    folders: BTreeMap<FolderId, Folder>,
    jobs: BTreeMap<JobId, Job>,
    next_folder_id: FolderId,
    next_job_id: JobId,
}

impl Default for State {
    fn default() -> Self {
        let mut folders = BTreeMap::new();
        folders.insert(ROOT_ID, Folder::root(ROOT_ID));
        Self {
            folders,
            jobs: BTreeMap::new(),
            next_folder_id: ROOT_ID + 1,
            next_job_id: 1,
        }
    }
}

impl State {
    pub fn folder(&self, id: FolderId) -> Result<&Folder> {
        self.folders
            .get(&id)
            .ok_or_else(|| KongError::NotFound(format!("folder {id}")))
    }

    pub fn job(&self, id: JobId) -> Result<&Job> {
        self.jobs
            .get(&id)
            .ok_or_else(|| KongError::NotFound(format!("job {id}")))
    }

    pub fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| KongError::NotFound(format!("job {id}")))
    }

    pub fn has_job(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Ids of existing jobs inside an id range, in order, without ever
    /// materializing the range itself. The range must not be empty.
    pub fn job_ids_in(
        &self,
        range: std::ops::RangeInclusive<JobId>,
    ) -> impl Iterator<Item = JobId> + '_ {
        self.jobs.range(range).map(|(id, _)| *id)
    }

    /// Direct child folders, sorted by name.
    pub fn children(&self, parent: FolderId) -> Vec<&Folder> {
        let mut out: Vec<&Folder> = self
            .folders
            .values()
            .filter(|f| f.parent == Some(parent))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Jobs directly contained in a folder, in id order.
    pub fn jobs_in(&self, folder: FolderId) -> Vec<&Job> {
        self.jobs.values().filter(|j| j.folder == folder).collect()
    }

    /// The derived `/`-separated path of a folder.
    pub fn path_of(&self, id: FolderId) -> Result<String> {
        let mut segments = Vec::new();
        let mut cur = self.folder(id)?;
        while let Some(parent) = cur.parent {
            segments.push(cur.name.clone());
            cur = self.folder(parent)?;
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Resolves a `/`-separated path, segment by segment, case-sensitively.
    /// Absolute paths start from the root; `cwd` anchors relative ones.
    pub fn find_by_path(&self, cwd: FolderId, path: &str) -> Result<&Folder> {
        let mut cur = if path.starts_with('/') {
            ROOT_ID
        } else {
            cwd
        };
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if segment == ".." {
                cur = self.folder(cur)?.parent.unwrap_or(ROOT_ID);
                continue;
            }
            cur = self
                .children(cur)
                .into_iter()
                .find(|f| f.name == segment)
                .ok_or_else(|| KongError::NotFound(path.to_string()))?
                .id;
        }
        self.folder(cur)
    }

    /// Creates a subfolder, failing `DuplicateName` on a sibling collision.
    pub fn create_folder(&mut self, parent: FolderId, name: &str) -> Result<FolderId> {
        validate_name(name)?;
        self.folder(parent)?;
        if self.children(parent).iter().any(|f| f.name == name) {
            return Err(KongError::DuplicateName {
                parent: self.path_of(parent)?,
                name: name.to_string(),
            });
        }
        let id = self.next_folder_id;
        self.next_folder_id += 1;
        self.folders.insert(id, Folder::new(id, name, parent));
        Ok(id)
    }

    /// Resolves `path`, creating missing intermediate folders along the way.
    pub fn create_folder_path(&mut self, cwd: FolderId, path: &str) -> Result<FolderId> {
        let mut cur = if path.starts_with('/') { ROOT_ID } else { cwd };
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            cur = match self.children(cur).into_iter().find(|f| f.name == segment) {
                Some(existing) => existing.id,
                None => self.create_folder(cur, segment)?,
            };
        }
        Ok(cur)
    }

    /// Creates a job in `Created` state with a freshly allocated id.
    pub fn create_job(
        &mut self,
        folder: FolderId,
        command: &str,
        driver: &str,
        resources: ResourceRequest,
        array_size: u32,
    ) -> Result<JobId> {
        if command.is_empty() {
            return Err(KongError::InvalidName("empty command".into()));
        }
        self.folder(folder)?;
        let id = self.next_job_id;
        self.next_job_id += 1;
        self.jobs
            .insert(id, Job::new(id, folder, command, driver, resources, array_size));
        Ok(id)
    }

    /// Inserts a job rebuilt by the recovery engine under its original id.
    pub fn insert_recovered_job(&mut self, mut job: Job) -> Result<JobId> {
        if self.jobs.contains_key(&job.id) {
            return Err(KongError::AlreadyExists(format!("job {}", job.id)));
        }
        job.provenance = Provenance::Recovered;
        self.next_job_id = self.next_job_id.max(job.id + 1);
        let id = job.id;
        self.jobs.insert(id, job);
        Ok(id)
    }

    /// Folders and jobs under `folder`. With `recursive`, descends the whole
    /// subtree in depth-first order.
    pub fn list(&self, folder: FolderId, recursive: bool) -> Result<(Vec<&Folder>, Vec<&Job>)> {
        self.folder(folder)?;
        let mut folders = Vec::new();
        let mut jobs = self.jobs_in(folder);
        let mut stack: Vec<FolderId> = self.children(folder).iter().map(|f| f.id).collect();
        stack.reverse();
        while let Some(id) = stack.pop() {
            folders.push(&self.folders[&id]);
            if recursive {
                jobs.extend(self.jobs_in(id));
                let mut kids: Vec<FolderId> = self.children(id).iter().map(|f| f.id).collect();
                kids.reverse();
                stack.extend(kids);
            }
        }
        Ok((folders, jobs))
    }

    /// Job ids contained in a folder, optionally recursively.
    pub fn job_ids_under(&self, folder: FolderId, recursive: bool) -> Result<Vec<JobId>> {
        let (_, jobs) = self.list(folder, recursive)?;
        Ok(jobs.iter().map(|j| j.id).collect())
    }

    fn is_descendant(&self, candidate: FolderId, ancestor: FolderId) -> bool {
        let mut cur = Some(candidate);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.folders.get(&id).and_then(|f| f.parent);
        }
        false
    }

    /// Moves a folder under a new parent, rejecting moves into the folder's
    /// own subtree (or itself) with `CyclicMove`.
    pub fn move_folder(&mut self, folder: FolderId, new_parent: FolderId) -> Result<()> {
        let name = self.folder(folder)?.name.clone();
        if self.folder(folder)?.is_root() {
            return Err(KongError::CyclicMove {
                node: "/".into(),
                dest: self.path_of(new_parent)?,
            });
        }
        if self.is_descendant(new_parent, folder) {
            return Err(KongError::CyclicMove {
                node: self.path_of(folder)?,
                dest: self.path_of(new_parent)?,
            });
        }
        if self
            .children(new_parent)
            .iter()
            .any(|f| f.name == name && f.id != folder)
        {
            return Err(KongError::DuplicateName {
                parent: self.path_of(new_parent)?,
                name,
            });
        }
        let f = self.folders.get_mut(&folder).expect("checked above");
        f.parent = Some(new_parent);
        f.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Sets a folder's resource defaults, the middle tier of the resource
    /// precedence. The root cannot carry them; that is what the global
    /// defaults are for.
    pub fn set_folder_resources(
        &mut self,
        id: FolderId,
        resources: ResourceRequest,
    ) -> Result<()> {
        if self.folder(id)?.is_root() {
            return Err(KongError::InvalidName(
                "cannot set resources on the root folder".into(),
            ));
        }
        let folder = self.folders.get_mut(&id).expect("checked above");
        folder.resources = resources;
        folder.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Reassigns a job to another folder.
    pub fn move_job(&mut self, job: JobId, new_folder: FolderId) -> Result<()> {
        self.folder(new_folder)?;
        let j = self.job_mut(job)?;
        j.folder = new_folder;
        j.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Removes a job record, returning it so the caller can delete artifacts.
    pub fn delete_job(&mut self, id: JobId) -> Result<Job> {
        self.jobs
            .remove(&id)
            .ok_or_else(|| KongError::NotFound(format!("job {id}")))
    }

    /// Removes a folder. A non-empty folder requires `recursive`; the root
    /// cannot be deleted. Returns the job records removed with the subtree.
    pub fn delete_folder(&mut self, id: FolderId, recursive: bool) -> Result<Vec<Job>> {
        let folder = self.folder(id)?;
        if folder.is_root() {
            return Err(KongError::NotEmpty("/".into()));
        }
        let (subfolders, jobs) = self.list(id, true)?;
        if !recursive && (!subfolders.is_empty() || !jobs.is_empty()) {
            return Err(KongError::NotEmpty(self.path_of(id)?));
        }
        let folder_ids: Vec<FolderId> = subfolders.iter().map(|f| f.id).collect();
        let job_ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();

        let mut removed = Vec::with_capacity(job_ids.len());
        for jid in job_ids {
            removed.push(self.jobs.remove(&jid).expect("listed above"));
        }
        for fid in folder_ids {
            self.folders.remove(&fid);
        }
        self.folders.remove(&id);
        Ok(removed)
    }

    /// Resolves a job's resources through the precedence chain:
    /// job-level, then each folder walking up to the root, then `defaults`.
    pub fn resolve_resources(
        &self,
        job: &Job,
        defaults: &crate::config::ResourceDefaults,
    ) -> Result<ResolvedResources> {
        let mut merged = job.resources.clone();
        let mut cur = Some(job.folder);
        while let Some(id) = cur {
            let folder = self.folder(id)?;
            merged = merged.or(&folder.resources);
            cur = folder.parent;
        }
        Ok(merged.resolve(defaults))
    }
}

/// Handle on the persisted hierarchy.
pub struct Store {
    state_file: PathBuf,
    lock_file: PathBuf,
    lock_timeout: std::time::Duration,
}

impl Store {
    pub fn new(config: &KongConfig) -> Self {
        Self {
            state_file: config.state_file(),
            lock_file: config.lock_file(),
            lock_timeout: config.lock_timeout(),
        }
    }

    /// Loads the current state without taking the lock. Readers tolerate
    /// slightly stale data instead of blocking.
    pub fn load(&self) -> Result<State> {
        Self::read_state(&self.state_file)
    }

    fn read_state(path: &PathBuf) -> Result<State> {
        if !path.exists() {
            return Ok(State::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Runs `f` on the current state under the exclusive file lock and
    /// persists the result atomically (write to a sibling, then rename).
    /// The lock is released on every exit path, including errors.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let _guard = LockGuard::acquire(&self.lock_file, self.lock_timeout)?;
        let mut state = Self::read_state(&self.state_file)?;
        let value = f(&mut state)?;
        self.persist(&state)?;
        Ok(value)
    }

    fn persist(&self, state: &State) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.state_file)?;
        Ok(())
    }
}
