//! Core of the remote build service.
//!
//! A [`BuildService`] takes a validated [`Submission`], stages it into a fresh
//! workspace, runs the build tool there while streaming its output, packages
//! the results of a successful build and hands the bundle out exactly once.

pub mod config;
pub mod error;
pub mod executor;
pub mod packager;
pub mod registry;
pub mod service;
pub mod submission;
pub mod workspace;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use rmake_data::{BuildTrailer, JobId, JobStatus, RECIPE_FILE_NAME};
pub use service::{BuildService, BuildStream};
pub use submission::{InputFile, Submission};
