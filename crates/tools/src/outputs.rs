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

//! Output parameter collection
//!
//! Runs as a sidecar sharing the pod's PID namespace. Once every other user
//! process has exited, the declared output files are read from the workspace
//! and the values are written as JSON to the container termination message,
//! where the controller picks them up.

use crate::error::{Result, ToolError};
use crate::Env;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kubernetes truncates termination messages beyond this size
pub const MAX_TERMINATION_MESSAGE_BYTES: usize = 4096;

const LOG_PREVIEW_CHARS: usize = 50;
const SELF_MARKER: &str = "collect-outputs";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OutputParameter {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct OutputSpec {
    #[serde(default)]
    pub parameters: Vec<OutputParameter>,
}

#[derive(Debug, Serialize)]
struct TerminationMessage<'a> {
    parameters: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CollectConfig {
    pub workspace_dir: PathBuf,
    /// `None` when `OUTPUT_SPEC` is unset
    pub spec: Option<OutputSpec>,
    pub output_path: PathBuf,
    pub proc_root: PathBuf,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl CollectConfig {
    pub fn from_env(
        env: &impl Env,
        output_path: PathBuf,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<Self> {
        let spec = env
            .non_empty("OUTPUT_SPEC")
            .map(|raw| {
                serde_json::from_str::<OutputSpec>(&raw)
                    .map_err(|e| ToolError::invalid("OUTPUT_SPEC", e.to_string()))
            })
            .transpose()?;

        Ok(Self {
            workspace_dir: PathBuf::from(
                env.non_empty("WORKSPACE_DIR")
                    .unwrap_or_else(|| "/workspace".to_string()),
            ),
            spec,
            output_path,
            proc_root: PathBuf::from("/proc"),
            poll_interval,
            max_wait,
        })
    }
}

/// Shorten a value for log lines
pub fn preview(value: &str) -> String {
    match value.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

/// Read one parameter. Relative paths are taken from the workspace.
///
/// Returns `None` when the file cannot be read.
pub fn read_parameter(workspace_dir: &Path, param: &OutputParameter) -> Option<String> {
    let path = Path::new(&param.path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_dir.join(path)
    };
    fs::read_to_string(&path).ok().map(|s| s.trim().to_string())
}

/// Values for every parameter that has a file or a default
pub fn collect(workspace_dir: &Path, spec: &OutputSpec) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for param in &spec.parameters {
        match (read_parameter(workspace_dir, param), &param.default) {
            (Some(value), _) => {
                info!(name = %param.name, value = %preview(&value), "Collected output");
                values.insert(param.name.clone(), value);
            }
            (None, Some(default)) => {
                info!(name = %param.name, value = %preview(default), "Using default output");
                values.insert(param.name.clone(), default.clone());
            }
            (None, None) => {
                warn!(name = %param.name, path = %param.path, "Output file missing and no default, skipping");
            }
        }
    }
    values
}

/// Termination message for `values`; errors when it would be truncated
pub fn encode(values: &BTreeMap<String, String>) -> Result<String> {
    let message = serde_json::to_string(&TerminationMessage { parameters: values })?;
    if message.len() > MAX_TERMINATION_MESSAGE_BYTES {
        return Err(ToolError::OutputTooLarge {
            size: message.len(),
            limit: MAX_TERMINATION_MESSAGE_BYTES,
        });
    }
    Ok(message)
}

/// Whether any process other than init and collectors is alive
pub fn workload_running(proc_root: &Path, own_pid: u32) -> Result<bool> {
    for entry in fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == 1 || pid == own_pid {
            continue;
        }

        // Gone between listing and reading
        let Ok(cmdline) = fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        // Kernel threads have no command line
        if cmdline.is_empty() {
            continue;
        }
        if !String::from_utf8_lossy(&cmdline).contains(SELF_MARKER) {
            debug!(pid, "Workload process still running");
            return Ok(true);
        }
    }
    Ok(false)
}

/// Poll until the workload has exited or `max_wait` passes
pub async fn wait_for_workload(
    proc_root: &Path,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<()> {
    let started = Instant::now();
    let own_pid = std::process::id();

    loop {
        match workload_running(proc_root, own_pid) {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => warn!(error = %e, "Could not inspect processes, retrying"),
        }
        if started.elapsed() >= max_wait {
            return Err(ToolError::invalid(
                "max wait",
                format!("workload still running after {}s", max_wait.as_secs()),
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// `collect-outputs` entry point
pub async fn run(config: &CollectConfig) -> Result<()> {
    let Some(spec) = config.spec.as_ref().filter(|s| !s.parameters.is_empty()) else {
        info!("No output parameters declared, nothing to collect");
        return Ok(());
    };
    info!(
        workspace = %config.workspace_dir.display(),
        parameters = spec.parameters.len(),
        "Waiting for the workload to exit"
    );

    wait_for_workload(&config.proc_root, config.poll_interval, config.max_wait).await?;
    info!("Workload exited, collecting outputs");

    let values = collect(&config.workspace_dir, spec);
    if values.is_empty() {
        info!("No outputs collected, leaving termination message empty");
        return Ok(());
    }

    let message = encode(&values)?;
    fs::write(&config.output_path, message)?;
    info!(count = values.len(), path = %config.output_path.display(), "Wrote outputs");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn param(name: &str, path: &str, default: Option<&str>) -> OutputParameter {
        OutputParameter {
            name: name.to_string(),
            path: path.to_string(),
            default: default.map(ToString::to_string),
        }
    }

    fn fake_process(proc_root: &Path, pid: u32, cmdline: &[u8]) {
        let dir = proc_root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cmdline"), cmdline).unwrap();
    }

    #[test]
    fn test_value_is_trimmed() {
        let workspace = TempDir::new().unwrap();
        fs::write(workspace.path().join("out.txt"), "  hello \n").unwrap();

        let spec = OutputSpec {
            parameters: vec![param("x", "out.txt", None)],
        };
        let values = collect(workspace.path(), &spec);
        assert_eq!(encode(&values).unwrap(), r#"{"parameters":{"x":"hello"}}"#);
    }

    #[test]
    fn test_missing_files_use_default_or_are_omitted() {
        let workspace = TempDir::new().unwrap();
        let absolute = workspace.path().join("abs.txt");
        fs::write(&absolute, "absolute").unwrap();

        let spec = OutputSpec {
            parameters: vec![
                param("a", absolute.to_str().unwrap(), None),
                param("b", "missing.txt", Some("fallback")),
                param("c", "missing.txt", None),
            ],
        };
        let values = collect(workspace.path(), &spec);

        assert_eq!(values.get("a").map(String::as_str), Some("absolute"));
        assert_eq!(values.get("b").map(String::as_str), Some("fallback"));
        assert!(!values.contains_key("c"));
    }

    #[test]
    fn test_oversized_message_is_an_error() {
        let values = BTreeMap::from([("big".to_string(), "x".repeat(5000))]);
        assert!(matches!(
            encode(&values),
            Err(ToolError::OutputTooLarge { limit: 4096, .. })
        ));
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("short"), "short");
        let long = "y".repeat(80);
        assert_eq!(preview(&long), format!("{}...", "y".repeat(50)));
    }

    #[test]
    fn test_workload_detection() {
        let proc_root = TempDir::new().unwrap();
        fake_process(proc_root.path(), 1, b"/pause\0");
        fake_process(proc_root.path(), 7, b"task-tools\0collect-outputs\0");
        fake_process(proc_root.path(), 9, b"");
        fs::create_dir_all(proc_root.path().join("self")).unwrap();
        assert!(!workload_running(proc_root.path(), 7).unwrap());

        fake_process(proc_root.path(), 12, b"/bin/sh\0-c\0agent\0");
        assert!(workload_running(proc_root.path(), 7).unwrap());
    }

    #[tokio::test]
    async fn test_run_writes_termination_message() {
        let workspace = TempDir::new().unwrap();
        let proc_root = TempDir::new().unwrap();
        fs::write(workspace.path().join("summary.md"), "done\n").unwrap();
        let output = workspace.path().join("termination-log");

        let config = CollectConfig {
            workspace_dir: workspace.path().to_path_buf(),
            spec: Some(OutputSpec {
                parameters: vec![param("summary", "summary.md", None)],
            }),
            output_path: output.clone(),
            proc_root: proc_root.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(1),
        };
        run(&config).await.unwrap();

        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            r#"{"parameters":{"summary":"done"}}"#
        );
    }

    #[tokio::test]
    async fn test_nothing_written_without_values() {
        let workspace = TempDir::new().unwrap();
        let proc_root = TempDir::new().unwrap();
        let output = workspace.path().join("termination-log");

        let config = CollectConfig {
            workspace_dir: workspace.path().to_path_buf(),
            spec: Some(OutputSpec {
                parameters: vec![param("gone", "nope.txt", None)],
            }),
            output_path: output.clone(),
            proc_root: proc_root.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(1),
        };
        run(&config).await.unwrap();
        assert!(!output.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let proc_root = TempDir::new().unwrap();
        fake_process(proc_root.path(), 4242, b"sleep\0infinity\0");

        let result = wait_for_workload(
            proc_root.path(),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_config_from_env() {
        let env = BTreeMap::from([(
            "OUTPUT_SPEC".to_string(),
            r#"{"parameters":[{"name":"x","path":"out.txt","default":"none"}]}"#.to_string(),
        )]);
        let config = CollectConfig::from_env(
            &env,
            PathBuf::from("/dev/termination-log"),
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .unwrap();

        assert_eq!(config.workspace_dir, PathBuf::from("/workspace"));
        assert_eq!(
            config.spec.unwrap().parameters,
            vec![param("x", "out.txt", Some("none"))]
        );

        let bad = BTreeMap::from([("OUTPUT_SPEC".to_string(), "{".to_string())]);
        assert!(CollectConfig::from_env(
            &bad,
            PathBuf::new(),
            Duration::from_secs(1),
            Duration::from_secs(1)
        )
        .is_err());
    }
}
