use std::{io, path::PathBuf};

use rmake_data::JobId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between accepting a submission and handing
/// out its artifact bundle.
///
/// A build that runs and exits nonzero is not an error, it is reported inline
/// in the build stream.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("could not allocate workspace {}: {source}", .path.display())]
    Allocation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not stage {name}: {source}")]
    Staging {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("could not start {program}: {source}")]
    Execution {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("could not write artifact bundle {}: {source}", .path.display())]
    Packaging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("job {0} not found")]
    NotFound(JobId),
}

impl Error {
    /// errors the submitter caused, as opposed to failures of the service
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidSubmission(_) | Error::NotFound(_))
    }
}
