use std::path::{Path, PathBuf};

use rmake_data::RECIPE_FILE_NAME;
use rmake_lib::{Error, InputFile, Result, Submission};
use rocket::fs::TempFile;
use tracing::warn;
use uuid::Uuid;

/// multipart body of a build submission
#[derive(FromForm)]
pub struct Upload<'r> {
    pub makefile: Option<TempFile<'r>>,
    #[field(default = Vec::new())]
    pub files: Vec<TempFile<'r>>,
    pub make_args: Option<String>,
}

impl<'r> Upload<'r> {
    /// Moves all uploaded files into `spool` and validates them as a
    /// submission. Nothing is left in the spool if validation fails.
    pub async fn into_submission(self, spool: &Path) -> Result<Submission> {
        let mut makefile = self.makefile.ok_or_else(|| {
            Error::InvalidSubmission(format!("a {} is required", RECIPE_FILE_NAME))
        })?;
        if self.files.is_empty() {
            return Err(Error::InvalidSubmission(
                "at least one source file is required".to_string(),
            ));
        }

        let mut spooled = Vec::new();
        let result = spool_all(&mut makefile, self.files, spool, &mut spooled).await;
        let submission = result.and_then(|(recipe, sources)| {
            Submission::new(recipe, sources, self.make_args.as_deref().unwrap_or_default())
        });
        if submission.is_err() {
            remove_spooled(&spooled).await;
        }
        submission
    }
}

async fn spool_all(
    makefile: &mut TempFile<'_>,
    files: Vec<TempFile<'_>>,
    spool: &Path,
    spooled: &mut Vec<PathBuf>,
) -> Result<(InputFile, Vec<InputFile>)> {
    let recipe = spool_file(makefile, RECIPE_FILE_NAME.to_string(), spool, spooled).await?;
    let mut sources = Vec::with_capacity(files.len());
    for mut file in files {
        let name = file
            .raw_name()
            .map(|name| name.dangerous_unsafe_unsanitized_raw().as_str().to_string())
            .ok_or_else(|| Error::InvalidSubmission("source file without a name".to_string()))?;
        sources.push(spool_file(&mut file, name, spool, spooled).await?);
    }
    Ok((recipe, sources))
}

/// the declared name is only recorded here, it is checked by `Submission::new`
async fn spool_file(
    file: &mut TempFile<'_>,
    name: String,
    spool: &Path,
    spooled: &mut Vec<PathBuf>,
) -> Result<InputFile> {
    let path = spool.join(Uuid::new_v4().simple().to_string());
    file.move_copy_to(&path)
        .await
        .map_err(|source| Error::Staging {
            name: name.clone(),
            source,
        })?;
    spooled.push(path.clone());
    Ok(InputFile::new(name, path))
}

async fn remove_spooled(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!("could not remove spooled upload {}: {}", path.display(), err);
        }
    }
}
