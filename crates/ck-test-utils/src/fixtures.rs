// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Stage fixture files into a throwaway working directory.
//!
//! [`setup_dir`] copies files and directory trees into a fresh temporary
//! directory and makes it the process working directory. The returned
//! [`StagedDir`] guard restores the previous working directory and deletes the
//! copy when dropped.
//!
//! The working directory is process-wide, so tests that stage fixtures in
//! parallel race with each other. Wrap such tests in [`crate::run_child`] to
//! give each one its own process.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::StageError;

/// Placeholder in a source path that expands to the project root.
pub const PROJECT_ROOT_PLACEHOLDER: char = '@';

/// Guard over a staged temporary directory.
pub struct StagedDir {
    dir: TempDir,
    previous: PathBuf,
}

impl StagedDir {
    /// Path of the staged directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for StagedDir {
    fn drop(&mut self) {
        if let Err(err) = env::set_current_dir(&self.previous) {
            eprintln!(
                "failed to restore working directory {}: {}",
                self.previous.display(),
                err
            );
        }
    }
}

/// Find the project root by walking up from the current directory.
pub fn find_project_root() -> Result<PathBuf, StageError> {
    let start = env::current_dir().map_err(io_error(Path::new(".")))?;
    find_project_root_from(&start)
}

/// Nearest ancestor of `start` whose `Cargo.toml` declares `[workspace]`,
/// or failing that the nearest ancestor with any `Cargo.toml`.
pub fn find_project_root_from(start: &Path) -> Result<PathBuf, StageError> {
    let mut nearest_package = None;

    for dir in start.ancestors() {
        let manifest = dir.join("Cargo.toml");
        if !manifest.is_file() {
            continue;
        }
        if let Ok(content) = fs::read_to_string(&manifest) {
            if content.contains("[workspace]") {
                return Ok(dir.to_path_buf());
            }
        }
        nearest_package.get_or_insert_with(|| dir.to_path_buf());
    }

    nearest_package.ok_or_else(|| StageError::ProjectRootNotFound {
        start: start.to_path_buf(),
    })
}

/// Copy each `(source, destination)` pair into a new temporary directory and
/// change into it.
///
/// An empty destination keeps the source's file name. Destinations are
/// relative to the staged directory. `@` in a source expands to
/// [`find_project_root`].
pub fn setup_dir<I, S, D>(paths: I) -> Result<StagedDir, StageError>
where
    I: IntoIterator<Item = (S, D)>,
    S: AsRef<str>,
    D: AsRef<str>,
{
    let previous = env::current_dir().map_err(io_error(Path::new(".")))?;
    let dir = tempfile::Builder::new()
        .prefix("ck-staged-")
        .tempdir()
        .map_err(io_error(&env::temp_dir()))?;

    let mut project_root = None;
    for (source, destination) in paths {
        let source = source.as_ref();
        let source_path = if source.contains(PROJECT_ROOT_PLACEHOLDER) {
            let root = match project_root.take() {
                Some(root) => root,
                None => find_project_root()?,
            };
            let expanded = source.replace(PROJECT_ROOT_PLACEHOLDER, &root.to_string_lossy());
            project_root = Some(root);
            PathBuf::from(expanded)
        } else {
            PathBuf::from(source)
        };

        let destination = match destination.as_ref() {
            "" => match source_path.file_name() {
                Some(name) => dir.path().join(name),
                None => dir.path().to_path_buf(),
            },
            relative => dir.path().join(relative),
        };

        debug!(
            source = %source_path.display(),
            destination = %destination.display(),
            "staging fixture"
        );
        copy_path(&source_path, &destination)?;
    }

    env::set_current_dir(dir.path()).map_err(io_error(dir.path()))?;
    Ok(StagedDir { dir, previous })
}

/// Copy a file, or a directory tree recursively.
pub fn copy_path(source: &Path, destination: &Path) -> Result<(), StageError> {
    let metadata = fs::metadata(source).map_err(io_error(source))?;
    if !metadata.is_dir() {
        return copy_file(source, destination);
    }

    for entry in WalkDir::new(source) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_file(source: &Path, destination: &Path) -> Result<(), StageError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    fs::copy(source, destination).map_err(io_error(source))?;
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StageError + '_ {
    move |source| StageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_project_root_prefers_workspace_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let member = tmp.path().join("crates").join("member");
        fs::create_dir_all(member.join("src")).unwrap();
        fs::write(tmp.path().join("Cargo.toml"), "[workspace]\nmembers = []\n").unwrap();
        fs::write(member.join("Cargo.toml"), "[package]\nname = \"member\"\n").unwrap();

        let root = find_project_root_from(&member.join("src")).unwrap();
        assert_eq!(root, tmp.path());
    }

    #[test]
    fn test_find_project_root_falls_back_to_package() {
        let tmp = tempfile::tempdir().unwrap();
        let package = tmp.path().join("package");
        fs::create_dir_all(&package).unwrap();
        fs::write(package.join("Cargo.toml"), "[package]\nname = \"p\"\n").unwrap();

        // Anything above the temp dir may hold a workspace manifest; only
        // check that the package itself is found when nothing closer exists.
        let root = find_project_root_from(&package).unwrap();
        assert!(package.starts_with(&root));
    }

    #[test]
    fn test_copy_path_copies_nested_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("top.txt"), "top").unwrap();
        fs::write(source.join("nested").join("inner.txt"), "inner").unwrap();

        let destination = tmp.path().join("copy");
        copy_path(&source, &destination).unwrap();

        assert_eq!(fs::read_to_string(destination.join("top.txt")).unwrap(), "top");
        assert_eq!(
            fs::read_to_string(destination.join("nested").join("inner.txt")).unwrap(),
            "inner"
        );
    }

    #[test]
    fn test_copy_path_missing_source_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("missing.txt");
        let err = copy_path(&missing, &tmp.path().join("out.txt")).unwrap_err();
        match err {
            StageError::Io { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }
}
