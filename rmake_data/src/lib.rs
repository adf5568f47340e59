use serde::{Deserialize, Serialize};

mod job_id;
mod trailer;

pub use job_id::{InvalidJobId, JobId};
pub use trailer::BuildTrailer;

/// file name the recipe is staged under, and the one file never packaged
pub const RECIPE_FILE_NAME: &str = "Makefile";

/// file name suggested to clients downloading an artifact bundle
pub const ARCHIVE_DOWNLOAD_NAME: &str = "compiled_output.tar.gz";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Succeeded,
    /// exit code is None if the build process was killed by a signal
    Failed { exit_code: Option<i32> },
    /// build succeeded but no artifact bundle could be written
    PackagingFailed { msg: String },
    /// artifact bundle was downloaded and deleted
    Retrieved,
}

#[cfg(test)]
mod test {
    use super::JobStatus;

    #[test]
    fn test_status_json() {
        let status = JobStatus::Failed { exit_code: Some(2) };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(r#"{"Failed":{"exit_code":2}}"#, json);
        assert_eq!(r#""Running""#, serde_json::to_string(&JobStatus::Running).unwrap());
    }
}
