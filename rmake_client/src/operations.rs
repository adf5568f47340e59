use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use reqwest::{
    blocking::{multipart::Form, Client},
    StatusCode,
};
use rmake_data::{BuildTrailer, JobId, JobStatus, RECIPE_FILE_NAME};
use tracing::{debug, info};

/// The files of a project directory that are sent to the server.
#[derive(Debug)]
pub struct Project {
    pub recipe: PathBuf,
    pub sources: Vec<PathBuf>,
}

/// the recipe plus all visible regular files next to it, sorted by name
pub fn collect_project(project_dir: &Path) -> Result<Project> {
    if !project_dir.is_dir() {
        bail!("'{}' is not a valid directory.", project_dir.display());
    }
    let recipe = project_dir.join(RECIPE_FILE_NAME);
    if !recipe.is_file() {
        bail!("No {} found in the project directory.", RECIPE_FILE_NAME);
    }
    let mut sources = Vec::new();
    for entry in fs::read_dir(project_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == RECIPE_FILE_NAME || !entry.file_type()?.is_file() {
            continue;
        }
        sources.push(entry.path());
    }
    if sources.is_empty() {
        bail!("No source files found in {}", project_dir.display());
    }
    sources.sort();
    Ok(Project { recipe, sources })
}

/// upload the project and echo the build output into `out`
/// returns the job id if the build succeeded
pub fn submit(
    client: &Client,
    server: &str,
    project: &Project,
    make_args: &str,
    out: &mut impl Write,
) -> Result<JobId> {
    let mut form = Form::new()
        .file("makefile", &project.recipe)
        .with_context(|| format!("could not read {}", project.recipe.display()))?
        .text("make_args", make_args.to_string());
    for source in &project.sources {
        form = form
            .file("files", source)
            .with_context(|| format!("could not read {}", source.display()))?;
    }
    info!("submitting {} source files", project.sources.len());
    let response = client
        .post(format!("{}/compile", server))
        .multipart(form)
        .send()
        .context("error executing request")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        bail!("server rejected the build ({}): {}", status, body.trim());
    }
    read_build_output(BufReader::new(response), out)
}

/// copies the build stream to `out` and evaluates its closing trailer
pub fn read_build_output(mut reader: impl BufRead, out: &mut impl Write) -> Result<JobId> {
    let mut trailer = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).context("build output interrupted")? == 0 {
            break;
        }
        out.write_all(line.as_bytes())?;
        out.flush()?;
        if let Some(parsed) = BuildTrailer::parse(&line) {
            trailer = Some(parsed);
        }
    }
    match trailer {
        Some(BuildTrailer::Succeeded(id)) => Ok(id),
        Some(BuildTrailer::Failed {
            exit_code: Some(code),
        }) => Err(anyhow!("build failed with exit code {}", code)),
        Some(BuildTrailer::Failed { exit_code: None }) => Err(anyhow!("build was terminated")),
        Some(BuildTrailer::PackagingFailed(msg)) => Err(anyhow!("build artifacts lost: {}", msg)),
        None => Err(anyhow!("Compilation finished but no Job ID received.")),
    }
}

/// fetch the bundle of `job_id` and unpack it into `output`
/// the bundle is gone from the server afterwards, also if unpacking fails
pub fn download(client: &Client, server: &str, job_id: &JobId, output: &Path) -> Result<()> {
    println!("Downloading compiled output for Job ID: {} from {}...", job_id, server);
    let response = client
        .get(format!("{}/download/{}", server, job_id))
        .send()
        .context("error executing request")?;
    match response.status() {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => bail!(
            "no output for job {}, it is still running, failed or was already downloaded",
            job_id
        ),
        status => bail!("unexpected response: {}", status),
    }
    let bytes = response.bytes().context("download interrupted")?;

    fs::create_dir_all(output)
        .with_context(|| format!("could not create {}", output.display()))?;
    let archive = output.join(format!("compiled_output_{}.tar.gz", job_id));
    fs::write(&archive, &bytes)?;
    println!("Download complete. File saved as '{}'", archive.display());

    unpack(&archive, output)?;
    println!("Extraction complete. Files extracted to '{}'", output.display());
    fs::remove_file(&archive)?;
    debug!("removed {}", archive.display());
    Ok(())
}

/// entries that would end up outside `dest` are skipped by `tar`
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .with_context(|| format!("could not extract {}", archive.display()))
}

pub fn status(client: &Client, server: &str, job_id: &JobId) -> Result<JobStatus> {
    let response = client
        .get(format!("{}/jobs/{}/status", server, job_id))
        .send()
        .context("error executing request")?;
    match response.status() {
        StatusCode::OK => response.json().context("malformed status response"),
        StatusCode::NOT_FOUND => bail!("Job not found"),
        status => bail!("unexpected response: {}", status),
    }
}
