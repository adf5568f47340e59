use std::{sync::Arc, time::Duration};

use rmake_data::{BuildTrailer, JobId, JobStatus};
use tokio::{
    fs,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        OwnedSemaphorePermit, Semaphore,
    },
};
use tracing::{error, info, instrument};

use crate::{
    executor::{BuildEvent, BuildExecutor, BuildOutcome, BuildRun},
    packager::ArtifactPackager,
    registry::JobRegistry,
    workspace::{Workspace, WorkspaceManager},
    Error, Result, ServiceConfig, Submission,
};

struct Inner {
    config: ServiceConfig,
    workspaces: WorkspaceManager,
    executor: BuildExecutor,
    packager: ArtifactPackager,
    registry: JobRegistry,
    build_slots: Option<Arc<Semaphore>>,
}

/// Runs submitted builds and hands out their results.
///
/// Cloning is cheap, all clones share the same jobs.
#[derive(Clone)]
pub struct BuildService {
    inner: Arc<Inner>,
}

impl BuildService {
    pub fn new(config: ServiceConfig) -> Self {
        let inner = Inner {
            workspaces: WorkspaceManager::new(&config.workspace_dir),
            executor: BuildExecutor::new(&config.build_program, config.build_args.clone()),
            packager: ArtifactPackager::new(&config.output_dir),
            registry: JobRegistry::new(&config.output_dir)
                .with_retention(Duration::from_secs(config.finished_job_retention_secs)),
            build_slots: config
                .max_concurrent_builds
                .map(|slots| Arc::new(Semaphore::new(slots.max(1)))),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// create the storage directories up front so a broken setup shows at startup
    pub async fn prepare(&self) -> Result<()> {
        let config = &self.inner.config;
        for dir in [&config.workspace_dir, &config.output_dir, &config.upload_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| Error::Allocation {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Stages `submission` into a new workspace and starts its build.
    ///
    /// Errors are returned before any output is produced and mean no job id
    /// was issued. Otherwise the returned stream carries the build output and
    /// ends with a [`BuildTrailer`], which names the job id only if the build
    /// and its packaging succeeded.
    #[instrument(skip_all)]
    pub async fn submit(&self, submission: Submission) -> Result<BuildStream> {
        let inner = &self.inner;
        let id = JobId::generate();
        info!(job = %id, "accepted submission with {} source files", submission.sources().len());
        let workspace = match inner.workspaces.create_workspace(&id).await {
            Ok(workspace) => workspace,
            Err(err) => {
                submission.discard().await;
                return Err(err);
            }
        };
        if let Err(err) = inner
            .workspaces
            .stage(&workspace, submission.recipe(), submission.sources())
            .await
        {
            submission.discard().await;
            self.discard(&workspace).await;
            return Err(err);
        }

        let permit = match &inner.build_slots {
            Some(slots) => {
                info!(job = %id, "waiting for a build slot");
                slots.clone().acquire_owned().await.ok()
            }
            None => None,
        };

        inner.registry.register(workspace.clone()).await;
        let run = match inner.executor.run(&workspace, submission.build_args()).await {
            Ok(run) => run,
            Err(err) => {
                inner.registry.forget(&id).await;
                self.discard(&workspace).await;
                return Err(err);
            }
        };

        let (lines_tx, lines_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(self.clone().drive(workspace, run, lines_tx, permit));
        Ok(BuildStream {
            id,
            lines: lines_rx,
        })
    }

    /// forwards build output, then packages and records the outcome
    /// keeps going if nobody listens anymore, builds are never cancelled
    async fn drive(
        self,
        workspace: Workspace,
        mut run: BuildRun,
        lines: UnboundedSender<String>,
        _permit: Option<OwnedSemaphorePermit>,
    ) {
        let inner = &self.inner;
        let id = workspace.id.clone();
        info!(job = %id, pid = ?run.pid(), "forwarding build output");
        let mut outcome = None;
        while let Some(event) = run.next().await {
            match event {
                BuildEvent::Output(line) => {
                    let _ = lines.send(line);
                }
                BuildEvent::Finished(finished) => outcome = Some(finished),
            }
        }

        let trailer = match outcome {
            Some(BuildOutcome::Succeeded) => match inner.packager.package(&workspace).await {
                Ok(archive) => {
                    inner.registry.mark_succeeded(&id, archive).await;
                    Some(BuildTrailer::Succeeded(id.clone()))
                }
                Err(err) => {
                    let msg = err.to_string();
                    inner.registry.mark_packaging_failed(&id, msg.clone()).await;
                    self.discard(&workspace).await;
                    Some(BuildTrailer::PackagingFailed(msg))
                }
            },
            // the executor already reported the exit code
            Some(BuildOutcome::Failed { exit_code }) => {
                inner.registry.mark_failed(&id, exit_code).await;
                self.discard(&workspace).await;
                None
            }
            None => {
                error!(job = %id, "build ended without an outcome");
                inner.registry.mark_failed(&id, None).await;
                Some(BuildTrailer::Failed { exit_code: None })
            }
        };
        if let Some(trailer) = trailer {
            let _ = lines.send(trailer.line());
        }
    }

    /// Hands out the bundle of job `id` and deletes it, see
    /// [`JobRegistry::consume`].
    pub async fn retrieve(&self, id: &JobId) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let bytes = inner.registry.consume(id).await?;
        if !inner.config.keep_workspaces {
            if let Some(workspace) = inner.registry.workspace(id).await {
                inner.workspaces.remove(&workspace).await;
            }
        }
        Ok(bytes)
    }

    pub async fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.inner.registry.status(id).await
    }

    async fn discard(&self, workspace: &Workspace) {
        if !self.inner.config.keep_workspaces {
            self.inner.workspaces.remove(workspace).await;
        }
    }
}

/// Output of one build, line by line, closed by a [`BuildTrailer`] line.
pub struct BuildStream {
    id: JobId,
    lines: UnboundedReceiver<String>,
}

impl BuildStream {
    /// Id of the job, for logging on the service side.
    ///
    /// It must not be shown to the submitter, who learns it from the trailer
    /// of a successful build only.
    pub fn job_id(&self) -> &JobId {
        &self.id
    }

    pub async fn next(&mut self) -> Option<String> {
        self.lines.recv().await
    }
}
