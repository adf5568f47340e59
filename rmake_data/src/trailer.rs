use crate::JobId;

const SUCCEEDED_PREFIX: &str = "Build successful. JobId: ";
const FAILED_PREFIX: &str = "Build failed with exit code ";
const SIGNALED_LINE: &str = "Build terminated by signal";
const PACKAGING_FAILED_PREFIX: &str = "Packaging failed: ";

/// The status line closing every build output stream.
///
/// The server writes exactly one of these after the build output, the client
/// scans each received line with [`BuildTrailer::parse`] to learn the outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildTrailer {
    Succeeded(JobId),
    Failed { exit_code: Option<i32> },
    PackagingFailed(String),
}

impl BuildTrailer {
    /// the trailer as a newline terminated stream line
    pub fn line(&self) -> String {
        match self {
            BuildTrailer::Succeeded(id) => format!("{}{}\n", SUCCEEDED_PREFIX, id),
            BuildTrailer::Failed {
                exit_code: Some(code),
            } => format!("{}{}\n", FAILED_PREFIX, code),
            BuildTrailer::Failed { exit_code: None } => format!("{}\n", SIGNALED_LINE),
            // keep the trailer a single line
            BuildTrailer::PackagingFailed(msg) => {
                format!("{}{}\n", PACKAGING_FAILED_PREFIX, msg.replace('\n', " "))
            }
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(SUCCEEDED_PREFIX) {
            return JobId::parse(rest.trim()).ok().map(BuildTrailer::Succeeded);
        }
        if let Some(rest) = line.strip_prefix(FAILED_PREFIX) {
            return rest.trim().parse().ok().map(|code| BuildTrailer::Failed {
                exit_code: Some(code),
            });
        }
        if line == SIGNALED_LINE {
            return Some(BuildTrailer::Failed { exit_code: None });
        }
        line.strip_prefix(PACKAGING_FAILED_PREFIX)
            .map(|msg| BuildTrailer::PackagingFailed(msg.to_string()))
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            BuildTrailer::Succeeded(id) => Some(id),
            _ => None,
        }
    }
}
