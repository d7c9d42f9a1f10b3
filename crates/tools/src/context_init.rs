/*
 * 5D Labs Agent Platform - Task Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Copy context files from the mounted `ConfigMap` into the workspace
//!
//! `ConfigMap` volumes are read-only; the agent needs to be able to edit what
//! it is given, so files are copied onto the writable workspace volume.
//! A mapping that fails to copy is logged and skipped.

use crate::error::{Result, ToolError};
use crate::Env;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMapping {
    pub key: String,
    pub target_path: PathBuf,
    #[serde(default)]
    pub file_mode: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirMapping {
    pub source_path: PathBuf,
    pub target_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ContextInitConfig {
    pub workspace_dir: PathBuf,
    pub config_map_path: PathBuf,
    pub files: Vec<FileMapping>,
    pub dirs: Vec<DirMapping>,
}

fn parse_list<T: for<'de> Deserialize<'de>>(env: &impl Env, name: &'static str) -> Result<Vec<T>> {
    match env.non_empty(name) {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| ToolError::invalid(name, e.to_string())),
        None => Ok(Vec::new()),
    }
}

impl ContextInitConfig {
    pub fn from_env(env: &impl Env) -> Result<Self> {
        Ok(Self {
            workspace_dir: PathBuf::from(
                env.non_empty("WORKSPACE_DIR")
                    .unwrap_or_else(|| "/workspace".to_string()),
            ),
            config_map_path: PathBuf::from(
                env.non_empty("CONFIGMAP_PATH")
                    .unwrap_or_else(|| "/configmap-files".to_string()),
            ),
            files: parse_list(env, "FILE_MAPPINGS")?,
            dirs: parse_list(env, "DIR_MAPPINGS")?,
        })
    }
}

/// Outcome of a run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub copied: usize,
    pub failed: usize,
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn current_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn current_mode(_metadata: &fs::Metadata) -> u32 {
    0
}

/// Copy one file, creating parent directories, and apply `mode`
pub fn copy_file(source: &Path, target: &Path, mode: Option<u32>) -> Result<()> {
    if fs::metadata(source)?.is_dir() {
        return Err(ToolError::invalid(
            "source",
            format!("{} is a directory", source.display()),
        ));
    }
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, target)?;
    set_mode(target, mode.unwrap_or(DEFAULT_FILE_MODE))?;
    Ok(())
}

/// Recursively copy a directory, following symlinks.
///
/// Entries starting with `..` are the `ConfigMap` volume's internal
/// bookkeeping and are skipped.
pub fn copy_dir(source: &Path, target: &Path) -> Result<usize> {
    if !fs::metadata(source)?.is_dir() {
        return Err(ToolError::invalid(
            "source",
            format!("{} is not a directory", source.display()),
        ));
    }
    fs::create_dir_all(target)?;

    let mut copied = 0;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("..") {
            continue;
        }
        let from = entry.path();
        let to = target.join(&name);
        if fs::metadata(&from)?.is_dir() {
            copied += copy_dir(&from, &to)?;
        } else {
            copy_file(&from, &to, None)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Give the agent write access to everything under `dir`
pub fn make_writable(dir: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(dir)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    let mode = current_mode(&metadata);
    let wanted = if metadata.is_dir() { mode | 0o755 } else { mode | 0o644 };
    if wanted != mode {
        if let Err(e) = set_mode(dir, wanted) {
            warn!(path = %dir.display(), error = %e, "Could not change permissions");
        }
    }

    if metadata.is_dir() {
        for entry in fs::read_dir(dir)? {
            make_writable(&entry?.path())?;
        }
    }
    Ok(())
}

/// `context-init` entry point
pub fn run(config: &ContextInitConfig) -> Result<Summary> {
    info!(
        workspace = %config.workspace_dir.display(),
        config_map = %config.config_map_path.display(),
        files = config.files.len(),
        dirs = config.dirs.len(),
        "Copying context files"
    );
    fs::create_dir_all(&config.workspace_dir)?;

    let mut summary = Summary::default();
    for mapping in &config.files {
        let source = config.config_map_path.join(&mapping.key);
        match copy_file(&source, &mapping.target_path, mapping.file_mode) {
            Ok(()) => {
                info!(
                    key = %mapping.key,
                    target = %mapping.target_path.display(),
                    mode = format!("{:04o}", mapping.file_mode.unwrap_or(DEFAULT_FILE_MODE)),
                    "Copied"
                );
                summary.copied += 1;
            }
            Err(e) => {
                warn!(key = %mapping.key, target = %mapping.target_path.display(), error = %e, "Failed to copy file");
                summary.failed += 1;
            }
        }
    }

    for mapping in &config.dirs {
        match copy_dir(&mapping.source_path, &mapping.target_path) {
            Ok(count) => {
                info!(
                    source = %mapping.source_path.display(),
                    target = %mapping.target_path.display(),
                    count,
                    "Copied directory"
                );
                summary.copied += count;
            }
            Err(e) => {
                warn!(source = %mapping.source_path.display(), error = %e, "Failed to copy directory");
                summary.failed += 1;
            }
        }
    }

    if let Err(e) = make_writable(&config.workspace_dir) {
        warn!(error = %e, "Could not make workspace writable");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_config_from_env() {
        let env = BTreeMap::from([
            (
                "FILE_MAPPINGS".to_string(),
                r#"[{"key":"workspace-task.md","targetPath":"/workspace/task.md"},{"key":"k","targetPath":"/x","fileMode":384}]"#
                    .to_string(),
            ),
            ("WORKSPACE_DIR".to_string(), "/ws".to_string()),
        ]);
        let config = ContextInitConfig::from_env(&env).unwrap();

        assert_eq!(config.workspace_dir, PathBuf::from("/ws"));
        assert_eq!(config.config_map_path, PathBuf::from("/configmap-files"));
        assert_eq!(config.files.len(), 2);
        assert_eq!(config.files[1].file_mode, Some(0o600));
        assert!(config.dirs.is_empty());

        let broken = BTreeMap::from([("DIR_MAPPINGS".to_string(), "nope".to_string())]);
        assert!(ContextInitConfig::from_env(&broken).is_err());
    }

    #[test]
    fn test_files_copied_into_nested_targets() {
        let config_map = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        fs::write(config_map.path().join("workspace-task.md"), "# Task").unwrap();
        fs::write(config_map.path().join("secret"), "s3cret").unwrap();

        let config = ContextInitConfig {
            workspace_dir: workspace.path().to_path_buf(),
            config_map_path: config_map.path().to_path_buf(),
            files: vec![
                FileMapping {
                    key: "workspace-task.md".to_string(),
                    target_path: workspace.path().join("task.md"),
                    file_mode: None,
                },
                FileMapping {
                    key: "secret".to_string(),
                    target_path: workspace.path().join(".config/deep/secret"),
                    file_mode: Some(0o600),
                },
                FileMapping {
                    key: "absent".to_string(),
                    target_path: workspace.path().join("absent"),
                    file_mode: None,
                },
            ],
            dirs: Vec::new(),
        };
        let summary = run(&config).unwrap();

        assert_eq!(summary, Summary { copied: 2, failed: 1 });
        assert_eq!(
            fs::read_to_string(workspace.path().join("task.md")).unwrap(),
            "# Task"
        );
        assert_eq!(
            fs::read_to_string(workspace.path().join(".config/deep/secret")).unwrap(),
            "s3cret"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_copy_skips_volume_bookkeeping() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        // Shape of a projected ConfigMap volume
        let data = source.path().join("..2025_01_01");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("guide.md"), "guide").unwrap();
        std::os::unix::fs::symlink("..2025_01_01", source.path().join("..data")).unwrap();
        std::os::unix::fs::symlink("..data/guide.md", source.path().join("guide.md")).unwrap();
        fs::create_dir_all(source.path().join("nested")).unwrap();
        fs::write(source.path().join("nested/more.md"), "more").unwrap();

        let dest = target.path().join("guides");
        let copied = copy_dir(source.path(), &dest).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(dest.join("guide.md")).unwrap(), "guide");
        assert_eq!(fs::read_to_string(dest.join("nested/more.md")).unwrap(), "more");
        assert!(!dest.join("..data").exists());
        assert!(!fs::symlink_metadata(dest.join("guide.md")).unwrap().file_type().is_symlink());
    }

    #[cfg(unix)]
    #[test]
    fn test_make_writable_widens_modes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("ro.txt");
        fs::write(&file, "x").unwrap();
        set_mode(&file, 0o400).unwrap();

        make_writable(dir.path()).unwrap();
        assert_eq!(current_mode(&fs::metadata(&file).unwrap()), 0o644);
    }
}
