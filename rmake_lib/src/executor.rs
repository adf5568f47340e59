use std::process::Stdio;

use rmake_data::{BuildTrailer, JobId};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{workspace::Workspace, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded,
    /// exit code is None if the process was killed by a signal
    Failed { exit_code: Option<i32> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildEvent {
    /// one line of stdout or stderr, always newline terminated
    Output(String),
    /// last event of every run
    Finished(BuildOutcome),
}

/// Runs the build program inside a workspace.
pub struct BuildExecutor {
    program: String,
    base_args: Vec<String>,
}

impl BuildExecutor {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// spawn the build program in `workspace` with `build_args` appended
    /// the arguments are passed as an argument vector, no shell is involved
    /// output is available from the returned run while the process is still running
    #[instrument(skip(self, workspace), fields(job = %workspace.id))]
    pub async fn run(&self, workspace: &Workspace, build_args: &[String]) -> Result<BuildRun> {
        info!("try to spawn {} in {}", self.program, workspace.path.display());
        let process = Command::new(&self.program)
            .args(&self.base_args)
            .args(build_args)
            .current_dir(&workspace.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                error!("build process could not be spawned: {}", source);
                Error::Execution {
                    program: self.program.clone(),
                    source,
                }
            })?;
        let pid = process.id();
        info!("build process spawned, pid: {:?}", pid);
        // TODO: unbounded channel buffers everything a build prints if the consumer stalls
        let (events_tx, events_rx) = mpsc::unbounded_channel::<BuildEvent>();
        tokio::spawn(manage_process(workspace.id.clone(), process, events_tx));
        Ok(BuildRun {
            pid,
            events: events_rx,
        })
    }
}

/// A running build, a finite sequence of output lines closed by its outcome.
pub struct BuildRun {
    pid: Option<u32>,
    events: UnboundedReceiver<BuildEvent>,
}

impl BuildRun {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// None once the `Finished` event has been received
    pub async fn next(&mut self) -> Option<BuildEvent> {
        self.events.recv().await
    }
}

async fn manage_process(job: JobId, mut process: Child, events: UnboundedSender<BuildEvent>) {
    // continously read from stdout/stderr in background
    let stdout_handle = process
        .stdout
        .take()
        .map(|stdout| tokio::spawn(forward_lines(stdout, events.clone())));
    let stderr_handle = process
        .stderr
        .take()
        .map(|stderr| tokio::spawn(forward_lines(stderr, events.clone())));

    let exit = process.wait().await;

    // all output has to be sent before the outcome
    for handle in [stdout_handle, stderr_handle].into_iter().flatten() {
        if let Err(join_error) = handle.await {
            error!(%job, "unexpected error when joining output reader: {}", join_error);
        }
    }

    let outcome = match exit {
        Ok(status) if status.success() => BuildOutcome::Succeeded,
        Ok(status) => BuildOutcome::Failed {
            exit_code: status.code(),
        },
        Err(io_error) => {
            error!(%job, "unexpected io error when waiting for build process: {}", io_error);
            BuildOutcome::Failed { exit_code: None }
        }
    };
    info!(%job, "build process finished: {:?}", outcome);

    if let BuildOutcome::Failed { exit_code } = outcome {
        let _ = events.send(BuildEvent::Output(BuildTrailer::Failed { exit_code }.line()));
    }
    if events.send(BuildEvent::Finished(outcome)).is_err() {
        warn!(%job, "build outcome dropped, nobody is listening");
    }
}

async fn forward_lines<A: AsyncRead + Unpin>(stream: A, events: UnboundedSender<BuildEvent>) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(io_error) => {
                warn!("unexpected io error when reading build output: {}", io_error);
                break;
            }
        }
        let mut line = String::from_utf8_lossy(&buf).into_owned();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        // keep draining even without a receiver so the build never blocks on a full pipe
        if events.send(BuildEvent::Output(line)).is_err() {
            debug!("build output line dropped");
        }
    }
}
