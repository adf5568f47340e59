use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use rmake_data::{JobId, JobStatus};
use tokio::{fs, sync::Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{packager::archive_file_name, workspace::Workspace, Error, Result};

struct JobEntry {
    workspace: Workspace,
    status: JobStatus,
    archive: Option<PathBuf>,
    finished_at: Option<Instant>,
}

impl JobEntry {
    /// finished long enough ago, and holding no bundle anymore
    fn expired(&self, retention: Duration) -> bool {
        self.archive.is_none()
            && self
                .finished_at
                .map_or(false, |finished| finished.elapsed() >= retention)
    }
}

/// Book keeping of all jobs of this service instance, and the owner of every
/// artifact bundle until it has been retrieved.
///
/// Finished jobs are forgotten once they are older than the retention period,
/// unless their bundle is still waiting for retrieval.
pub struct JobRegistry {
    output_dir: PathBuf,
    retention: Duration,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
}

impl JobRegistry {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            retention: Duration::from_secs(3600),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// track a new job as running, forgetting expired finished jobs
    pub async fn register(&self, workspace: Workspace) {
        let entry = JobEntry {
            workspace: workspace.clone(),
            status: JobStatus::Running,
            archive: None,
            finished_at: None,
        };
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, entry| !entry.expired(self.retention));
        if jobs.len() < before {
            info!("forgot {} expired jobs", before - jobs.len());
        }
        jobs.insert(workspace.id, entry);
    }

    /// drop a job whose build never started, its id is never handed out
    pub async fn forget(&self, id: &JobId) {
        self.jobs.lock().await.remove(id);
    }

    pub async fn mark_succeeded(&self, id: &JobId, archive: PathBuf) {
        self.finish(id, JobStatus::Succeeded, Some(archive)).await
    }

    pub async fn mark_failed(&self, id: &JobId, exit_code: Option<i32>) {
        self.finish(id, JobStatus::Failed { exit_code }, None).await
    }

    pub async fn mark_packaging_failed(&self, id: &JobId, msg: String) {
        self.finish(id, JobStatus::PackagingFailed { msg }, None).await
    }

    /// a job leaves Running exactly once
    async fn finish(&self, id: &JobId, status: JobStatus, archive: Option<PathBuf>) {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(id) {
            Some(entry) if entry.status == JobStatus::Running => {
                info!(job = %id, "job finished: {:?}", status);
                entry.status = status;
                entry.archive = archive;
                entry.finished_at = Some(Instant::now());
            }
            Some(entry) => warn!(
                job = %id,
                "ignoring transition to {:?}, job is already {:?}", status, entry.status
            ),
            None => warn!(job = %id, "ignoring transition of unknown job to {:?}", status),
        }
    }

    pub async fn workspace(&self, id: &JobId) -> Option<Workspace> {
        let jobs = self.jobs.lock().await;
        jobs.get(id).map(|entry| entry.workspace.clone())
    }

    /// Status of job `id`, None if it never existed.
    ///
    /// Bundles left over from an earlier instance of the service count as
    /// succeeded jobs.
    pub async fn status(&self, id: &JobId) -> Option<JobStatus> {
        if let Some(entry) = self.jobs.lock().await.get(id) {
            return Some(entry.status.clone());
        }
        if is_file(&self.output_dir.join(archive_file_name(id))).await {
            Some(JobStatus::Succeeded)
        } else {
            None
        }
    }

    /// location of the unretrieved bundle of job `id`
    pub async fn resolve(&self, id: &JobId) -> Option<PathBuf> {
        if let Some(entry) = self.jobs.lock().await.get(id) {
            return entry.archive.clone();
        }
        let path = self.output_dir.join(archive_file_name(id));
        if is_file(&path).await {
            Some(path)
        } else {
            None
        }
    }

    /// Returns the bundle of job `id` and deletes it.
    ///
    /// Succeeds at most once per job, also under concurrent calls: the bundle
    /// is first renamed to a name private to this call, only the caller whose
    /// rename succeeds gets to read it.
    #[instrument(skip(self))]
    pub async fn consume(&self, id: &JobId) -> Result<Vec<u8>> {
        let path = self
            .resolve(id)
            .await
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let claimed = claim_path(&path);
        if let Err(err) = fs::rename(&path, &claimed).await {
            if err.kind() != io::ErrorKind::NotFound {
                error!("could not claim {}: {}", path.display(), err);
            }
            return Err(Error::NotFound(id.clone()));
        }
        let bytes = match fs::read(&claimed).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("could not read {}: {}", claimed.display(), err);
                // hand the bundle back so a later attempt can succeed
                if let Err(err) = fs::rename(&claimed, &path).await {
                    error!("could not restore {}: {}", path.display(), err);
                }
                return Err(Error::NotFound(id.clone()));
            }
        };
        if let Err(err) = fs::remove_file(&claimed).await {
            warn!("could not delete retrieved bundle {}: {}", claimed.display(), err);
        }
        if let Some(entry) = self.jobs.lock().await.get_mut(id) {
            entry.status = JobStatus::Retrieved;
            entry.archive = None;
        }
        info!("handed out {} bytes", bytes.len());
        Ok(bytes)
    }
}

fn claim_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.claimed", name, Uuid::new_v4().simple()))
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
