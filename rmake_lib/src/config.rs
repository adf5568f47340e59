use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Settings of the build service.
///
/// Every field has a default, so an empty configuration source yields a
/// service that runs `make` below the current directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// one subdirectory per job is created here
    pub workspace_dir: PathBuf,
    /// artifact bundles waiting for retrieval
    pub output_dir: PathBuf,
    /// spool for incoming uploads before they are staged
    pub upload_dir: PathBuf,
    pub build_program: String,
    /// passed to the build program before the submission's own arguments
    pub build_args: Vec<String>,
    /// no limit if unset
    pub max_concurrent_builds: Option<usize>,
    /// keep workspaces of failed and retrieved jobs for diagnostics
    pub keep_workspaces: bool,
    /// seconds a finished job stays known to the status query
    pub finished_job_retention_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("workspace"),
            output_dir: PathBuf::from("outputs"),
            upload_dir: PathBuf::from("uploads"),
            build_program: "make".to_string(),
            build_args: Vec::new(),
            max_concurrent_builds: None,
            keep_workspaces: true,
            finished_job_retention_secs: 3600,
        }
    }
}

impl ServiceConfig {
    /// all directories relative to `root`, for tests and ad hoc instances
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            workspace_dir: root.join("workspace"),
            output_dir: root.join("outputs"),
            upload_dir: root.join("uploads"),
            ..Self::default()
        }
    }
}
