use std::{
    io,
    path::{Path, PathBuf},
};

use rmake_data::{JobId, RECIPE_FILE_NAME};
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::{submission::check_file_name, Error, InputFile, Result};

/// A job's private directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Workspace {
    pub id: JobId,
    pub path: PathBuf,
}

impl Workspace {
    pub fn recipe_path(&self) -> PathBuf {
        self.path.join(RECIPE_FILE_NAME)
    }
}

/// Hands out one directory per job below a common root.
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// creates the empty directory of job `id`
    /// fails if it already exists, a workspace is never handed out twice
    #[instrument(skip(self))]
    pub async fn create_workspace(&self, id: &JobId) -> Result<Workspace> {
        let path = self.root.join(id.as_str());
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| Error::Allocation {
                path: self.root.clone(),
                source,
            })?;
        fs::create_dir(&path)
            .await
            .map_err(|source| Error::Allocation {
                path: path.clone(),
                source,
            })?;
        info!("created workspace {}", path.display());
        Ok(Workspace {
            id: id.clone(),
            path,
        })
    }

    /// moves the recipe and all sources into the workspace
    /// stops at the first failure, files staged until then are left in place
    #[instrument(skip_all, fields(job = %workspace.id))]
    pub async fn stage(
        &self,
        workspace: &Workspace,
        recipe: &InputFile,
        sources: &[InputFile],
    ) -> Result<()> {
        move_file(&recipe.path, &workspace.recipe_path())
            .await
            .map_err(|source| Error::Staging {
                name: RECIPE_FILE_NAME.to_string(),
                source,
            })?;
        for source_file in sources {
            if let Err(reason) = check_file_name(&source_file.name) {
                return Err(Error::Staging {
                    name: source_file.name.clone(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, reason),
                });
            }
            move_file(&source_file.path, &workspace.path.join(&source_file.name))
                .await
                .map_err(|source| Error::Staging {
                    name: source_file.name.clone(),
                    source,
                })?;
        }
        info!("staged recipe and {} source files", sources.len());
        Ok(())
    }

    #[instrument(skip_all, fields(job = %workspace.id))]
    pub async fn remove(&self, workspace: &Workspace) {
        match fs::remove_dir_all(&workspace.path).await {
            Ok(()) => info!("removed workspace"),
            Err(err) => warn!("could not remove workspace: {}", err),
        }
    }
}

/// rename, or copy and delete if `from` lives on another filesystem
/// both keep contents and permission bits
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    // never overwrite, two inputs must not end up in the same file
    if fs::symlink_metadata(to).await.is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", to.display()),
        ));
    }
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await?;
    fs::remove_file(from).await
}

#[cfg(test)]
mod test {
    use std::fs;

    use rmake_data::JobId;
    use tempfile::tempdir;

    use super::WorkspaceManager;
    use crate::{
        testing::{setup, upload, RUNTIME},
        Error, InputFile,
    };

    #[test]
    fn test_stage_copies_inputs_exactly() {
        setup();
        let spool = tempdir().unwrap();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().join("workspace"));
        RUNTIME.block_on(async {
            let id = JobId::generate();
            let workspace = manager.create_workspace(&id).await.unwrap();
            assert_eq!(0, fs::read_dir(&workspace.path).unwrap().count());

            let recipe = upload(spool.path(), "u0", "whatever", b"all:\n\tcp a.c out\n");
            let sources = vec![
                upload(spool.path(), "u1", "a.c", b"int main() {}\n"),
                upload(spool.path(), "u2", "b.h", &[0, 159, 146, 150]),
            ];
            manager.stage(&workspace, &recipe, &sources).await.unwrap();

            let mut names: Vec<String> = fs::read_dir(&workspace.path)
                .unwrap()
                .map(|e| e.unwrap().file_name().into_string().unwrap())
                .collect();
            names.sort();
            assert_eq!(vec!["Makefile", "a.c", "b.h"], names);
            assert_eq!(b"all:\n\tcp a.c out\n".to_vec(), fs::read(workspace.recipe_path()).unwrap());
            assert_eq!(b"int main() {}\n".to_vec(), fs::read(workspace.path.join("a.c")).unwrap());
            assert_eq!(vec![0, 159, 146, 150], fs::read(workspace.path.join("b.h")).unwrap());
            // uploads were moved, not copied
            assert_eq!(0, fs::read_dir(spool.path()).unwrap().count());
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_stage_keeps_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        setup();
        let spool = tempdir().unwrap();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        RUNTIME.block_on(async {
            let workspace = manager.create_workspace(&JobId::generate()).await.unwrap();
            let recipe = upload(spool.path(), "u0", "Makefile", b"");
            let script = upload(spool.path(), "u1", "gen.sh", b"#!/bin/sh\n");
            fs::set_permissions(&script.path, fs::Permissions::from_mode(0o755)).unwrap();
            manager.stage(&workspace, &recipe, &[script]).await.unwrap();
            let mode = fs::metadata(workspace.path.join("gen.sh")).unwrap().permissions().mode();
            assert_eq!(0o755, mode & 0o777);
        });
    }

    #[test]
    fn test_workspace_never_reused() {
        setup();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        RUNTIME.block_on(async {
            let id = JobId::generate();
            manager.create_workspace(&id).await.unwrap();
            let second = manager.create_workspace(&id).await;
            assert!(matches!(second, Err(Error::Allocation { .. })));
        });
    }

    #[test]
    fn test_allocation_error_on_unusable_root() {
        setup();
        let root = tempdir().unwrap();
        let file = root.path().join("not_a_dir");
        fs::write(&file, b"").unwrap();
        let manager = WorkspaceManager::new(&file);
        RUNTIME.block_on(async {
            match manager.create_workspace(&JobId::generate()).await {
                // the root is at fault, not the job directory below it
                Err(Error::Allocation { path, .. }) => assert_eq!(file, path),
                other => panic!("expected allocation error, got {:?}", other.map(|ws| ws.path)),
            }
        });
    }

    #[test]
    fn test_stage_rejects_recipe_name() {
        setup();
        let spool = tempdir().unwrap();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        RUNTIME.block_on(async {
            let workspace = manager.create_workspace(&JobId::generate()).await.unwrap();
            let recipe = upload(spool.path(), "u0", "Makefile", b"all:\n");
            let sneaky = upload(spool.path(), "u1", "Makefile", b"evil:\n");
            let result = manager.stage(&workspace, &recipe, &[sneaky]).await;
            match result {
                Err(Error::Staging { name, .. }) => assert_eq!("Makefile", name),
                other => panic!("expected staging error, got {:?}", other),
            }
            assert_eq!(b"all:\n".to_vec(), fs::read(workspace.recipe_path()).unwrap());
        });
    }

    #[test]
    fn test_stage_missing_upload() {
        setup();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        RUNTIME.block_on(async {
            let workspace = manager.create_workspace(&JobId::generate()).await.unwrap();
            let recipe = InputFile::new("Makefile", root.path().join("gone"));
            let result = manager.stage(&workspace, &recipe, &[]).await;
            assert!(matches!(result, Err(Error::Staging { .. })));
        });
    }

    #[test]
    fn test_remove() {
        setup();
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        RUNTIME.block_on(async {
            let workspace = manager.create_workspace(&JobId::generate()).await.unwrap();
            fs::write(workspace.path.join("out.bin"), b"x").unwrap();
            manager.remove(&workspace).await;
            assert!(!workspace.path.exists());
        });
    }
}
