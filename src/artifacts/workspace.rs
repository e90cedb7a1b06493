//! Ephemeral per-operation workspace for building a template image.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use tempfile::TempDir;
use tracing::debug;
use zip::ZipArchive;

use crate::error::ArtifactError;

const DOCKERFILE: &str = "Dockerfile";
const CONTEXT_DIR: &str = "context";
const FALLBACK_ARCHIVE_NAME: &str = "template.zip";

/// Archive tools add this directory to zips created on macOS.
const MACOS_METADATA_DIR: &str = "__MACOSX";

/// A temporary directory holding one downloaded template and its unpacked tree.
///
/// The directory and everything in it are removed when the workspace is
/// dropped, whether or not the operation using it succeeded.
#[derive(Debug)]
pub struct TemplateWorkspace {
    dir: TempDir,
    root: Utf8PathBuf,
}

impl TemplateWorkspace {
    /// Create an empty workspace under the system temporary directory.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError::WorkspaceFailed` if the directory cannot be
    /// created or its path is not valid UTF-8.
    pub fn create() -> Result<Self, ArtifactError> {
        let dir = tempfile::Builder::new()
            .prefix("cestx-template-")
            .tempdir()
            .map_err(workspace_failed)?;
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).map_err(|path| {
            ArtifactError::WorkspaceFailed {
                message: format!("workspace path {} is not UTF-8", path.display()),
            }
        })?;
        debug!(workspace = %root, "created template workspace");
        Ok(Self { dir, root })
    }

    /// The workspace directory.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.root
    }

    /// Save the downloaded archive and extract it into the workspace.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError::WorkspaceFailed` when the archive cannot be
    /// written and `ArtifactError::InvalidArchive` when it is not a readable
    /// zip file.
    pub fn unpack(&self, artifact_key: &str, archive: &[u8]) -> Result<(), ArtifactError> {
        let archive_name = Utf8Path::new(artifact_key)
            .file_name()
            .unwrap_or(FALLBACK_ARCHIVE_NAME);
        let workspace = self.open_root()?;
        workspace
            .write(archive_name, archive)
            .map_err(workspace_failed)?;
        workspace
            .create_dir(CONTEXT_DIR)
            .map_err(workspace_failed)?;

        let file = workspace.open(archive_name).map_err(workspace_failed)?;
        let mut zip = ZipArchive::new(file).map_err(invalid_archive)?;
        zip.extract(self.root.join(CONTEXT_DIR).as_std_path())
            .map_err(invalid_archive)?;
        debug!(entries = zip.len(), archive = archive_name, "unpacked template archive");
        Ok(())
    }

    /// Package the unpacked template as a tar build context.
    ///
    /// The context root is the extracted tree when it contains a `Dockerfile`
    /// directly, or its single top-level directory when the archive wrapped
    /// everything in one folder.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError::MissingDockerfile` when no context root with a
    /// `Dockerfile` exists, and `ArtifactError::WorkspaceFailed` when the tree
    /// cannot be read.
    pub fn build_context(&self) -> Result<Vec<u8>, ArtifactError> {
        let context_root = self.context_root()?;
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", context_root.as_std_path())
            .map_err(workspace_failed)?;
        builder.into_inner().map_err(workspace_failed)
    }

    /// Remove the workspace now, reporting any failure.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError::WorkspaceFailed` if the directory cannot be
    /// removed.
    pub fn close(self) -> Result<(), ArtifactError> {
        self.dir.close().map_err(workspace_failed)
    }

    fn open_root(&self) -> Result<Dir, ArtifactError> {
        Dir::open_ambient_dir(&self.root, ambient_authority()).map_err(workspace_failed)
    }

    fn context_root(&self) -> Result<Utf8PathBuf, ArtifactError> {
        let context_path = self.root.join(CONTEXT_DIR);
        let context = self
            .open_root()?
            .open_dir(CONTEXT_DIR)
            .map_err(workspace_failed)?;
        if context.is_file(DOCKERFILE) {
            return Ok(context_path);
        }

        let mut top_level = Vec::new();
        for entry in context.entries().map_err(workspace_failed)? {
            let name = entry
                .and_then(|found| found.file_name())
                .map_err(workspace_failed)?;
            if name != MACOS_METADATA_DIR {
                top_level.push(name);
            }
        }

        match top_level.as_slice() {
            [only] if context.is_dir(only) => {
                let nested = context.open_dir(only).map_err(workspace_failed)?;
                if nested.is_file(DOCKERFILE) {
                    Ok(context_path.join(only))
                } else {
                    Err(ArtifactError::MissingDockerfile)
                }
            }
            _ => Err(ArtifactError::MissingDockerfile),
        }
    }
}

fn workspace_failed(error: std::io::Error) -> ArtifactError {
    ArtifactError::WorkspaceFailed {
        message: error.to_string(),
    }
}

fn invalid_archive(error: zip::result::ZipError) -> ArtifactError {
    ArtifactError::InvalidArchive {
        message: error.to_string(),
    }
}
