use std::{
    ffi::OsStr,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};
use rmake_data::{JobId, RECIPE_FILE_NAME};
use tokio::task;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::{workspace::Workspace, Error, Result};

/// name of the artifact bundle of job `id` inside the output directory
pub fn archive_file_name(id: &JobId) -> String {
    format!("output_{}.tar.gz", id)
}

/// Bundles the results of successful builds into gzipped tarballs.
pub struct ArtifactPackager {
    output_dir: PathBuf,
}

impl ArtifactPackager {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn archive_path(&self, id: &JobId) -> PathBuf {
        self.output_dir.join(archive_file_name(id))
    }

    /// Writes every regular file below the workspace except the recipe into
    /// the job's bundle and returns the bundle's path.
    ///
    /// The bundle only appears under its final name once it is complete. A
    /// build without outputs yields a valid, empty bundle.
    #[instrument(skip_all, fields(job = %workspace.id))]
    pub async fn package(&self, workspace: &Workspace) -> Result<PathBuf> {
        let archive_path = self.archive_path(&workspace.id);
        let source = workspace.path.clone();
        let target = archive_path.clone();
        let written = task::spawn_blocking(move || write_archive(&source, &target))
            .await
            .unwrap_or_else(|join_error| Err(io::Error::new(io::ErrorKind::Other, join_error)));
        match written {
            Ok(count) => {
                info!("packaged {} files into {}", count, archive_path.display());
                Ok(archive_path)
            }
            Err(source) => {
                warn!("packaging failed: {}", source);
                Err(Error::Packaging {
                    path: archive_path,
                    source,
                })
            }
        }
    }
}

fn write_archive(workspace: &Path, target: &Path) -> io::Result<usize> {
    let artifacts = collect_artifacts(workspace)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = target.with_extension("partial");
    if let Err(err) = write_tar_gz(workspace, &artifacts, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }
    fs::rename(&partial, target)?;
    Ok(artifacts.len())
}

fn write_tar_gz(workspace: &Path, artifacts: &[PathBuf], target: &Path) -> io::Result<()> {
    let file = File::create(target)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for relative in artifacts {
        builder.append_path_with_name(workspace.join(relative), relative)?;
    }
    let file = builder.into_inner()?.finish()?;
    file.sync_all()
}

/// relative paths of all regular files below `root`, sorted
/// symlinks are not followed and the top level recipe is left out
fn collect_artifacts(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut artifacts = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.depth() == 1 && entry.file_name() == OsStr::new(RECIPE_FILE_NAME) {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        artifacts.push(relative.to_path_buf());
    }
    artifacts.sort();
    Ok(artifacts)
}

#[cfg(test)]
mod test {
    use std::{fs, path::Path};

    use rmake_data::JobId;
    use tempfile::tempdir;

    use super::{collect_artifacts, ArtifactPackager};
    use crate::{
        testing::{archive_entries, setup, RUNTIME},
        workspace::Workspace,
        Error,
    };

    fn workspace_in(root: &Path) -> Workspace {
        let id = JobId::generate();
        let path = root.join(id.as_str());
        fs::create_dir_all(&path).unwrap();
        Workspace { id, path }
    }

    #[test]
    fn test_collect_skips_recipe_only_at_top_level() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Makefile"), b"all:\n").unwrap();
        fs::write(dir.path().join("out.bin"), b"\x7fELF").unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/Makefile"), b"").unwrap();
        fs::write(dir.path().join("sub/deeper/x.o"), b"").unwrap();
        let artifacts = collect_artifacts(dir.path()).unwrap();
        let names: Vec<String> = artifacts
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        assert_eq!(vec!["out.bin", "sub/Makefile", "sub/deeper/x.o"], names);
    }

    #[cfg(unix)]
    #[test]
    fn test_collect_skips_symlinks() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("link")).unwrap();
        let artifacts = collect_artifacts(dir.path()).unwrap();
        assert_eq!(vec![Path::new("real").to_path_buf()], artifacts);
    }

    #[test]
    fn test_package_contents() {
        setup();
        let root = tempdir().unwrap();
        let workspace = workspace_in(&root.path().join("workspace"));
        fs::write(workspace.path.join("Makefile"), b"all:\n").unwrap();
        fs::write(workspace.path.join("out.bin"), b"binary").unwrap();
        let packager = ArtifactPackager::new(root.path().join("outputs"));
        RUNTIME.block_on(async {
            let archive = packager.package(&workspace).await.unwrap();
            assert_eq!(packager.archive_path(&workspace.id), archive);
            let entries = archive_entries(&archive);
            assert_eq!(vec![("out.bin".to_string(), b"binary".to_vec())], entries);
            // no leftovers next to the bundle
            assert_eq!(1, fs::read_dir(root.path().join("outputs")).unwrap().count());
        });
    }

    #[test]
    fn test_package_empty_build() {
        setup();
        let root = tempdir().unwrap();
        let workspace = workspace_in(root.path());
        fs::write(workspace.path.join("Makefile"), b"all:\n").unwrap();
        let packager = ArtifactPackager::new(root.path().join("outputs"));
        RUNTIME.block_on(async {
            let archive = packager.package(&workspace).await.unwrap();
            assert!(archive.exists());
            assert!(archive_entries(&archive).is_empty());
        });
    }

    #[test]
    fn test_package_missing_workspace() {
        setup();
        let root = tempdir().unwrap();
        let workspace = Workspace {
            id: JobId::generate(),
            path: root.path().join("gone"),
        };
        let packager = ArtifactPackager::new(root.path().join("outputs"));
        RUNTIME.block_on(async {
            let result = packager.package(&workspace).await;
            assert!(matches!(result, Err(Error::Packaging { .. })));
            assert!(!packager.archive_path(&workspace.id).exists());
        });
    }
}
