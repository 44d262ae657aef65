//! Backend Locator
//!
//! Resolves how to launch the simulation backend:
//! - development: `zsim/api.py` under the project root, run through `uv` when
//!   available, otherwise through the first bare Python interpreter that
//!   answers `--version`
//! - production: the first packaged `zsim_api` executable found under the
//!   resource directory

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Environment;
use crate::platform::Platform;

const DEV_SCRIPT: [&str; 2] = ["zsim", "api.py"];
const PACKAGED_BINARY_STEM: &str = "zsim_api";
const PROJECT_LAUNCHER: &str = "uv";

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("Backend not found, tried: {}", format_tried(.tried))]
    BackendNotFound { tried: Vec<PathBuf> },

    #[error("No Python interpreter found, tried: {}", .tried.join(", "))]
    InterpreterNotFound { tried: Vec<String> },
}

fn format_tried(tried: &[PathBuf]) -> String {
    tried
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolved invocation for the backend process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendTarget {
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
}

pub struct BackendLocator {
    environment: Environment,
    platform: Platform,
    project_root: PathBuf,
    resource_dir: PathBuf,
}

impl BackendLocator {
    pub fn new(
        environment: Environment,
        platform: Platform,
        project_root: impl Into<PathBuf>,
        resource_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            environment,
            platform,
            project_root: project_root.into(),
            resource_dir: resource_dir.into(),
        }
    }

    pub fn locate(&self) -> Result<BackendTarget, LocateError> {
        self.locate_with(command_answers_version)
    }

    /// `can_run` reports whether a command can be executed at all.
    pub fn locate_with<F>(&self, can_run: F) -> Result<BackendTarget, LocateError>
    where
        F: Fn(&str) -> bool,
    {
        let target = match self.environment {
            Environment::Development => self.locate_dev(can_run)?,
            Environment::Production => self.locate_packaged()?,
        };
        info!(
            "Resolved backend: {} {:?} (cwd {:?})",
            target.command, target.args, target.working_directory
        );
        Ok(target)
    }

    fn locate_dev<F>(&self, can_run: F) -> Result<BackendTarget, LocateError>
    where
        F: Fn(&str) -> bool,
    {
        let script = DEV_SCRIPT
            .iter()
            .fold(self.project_root.clone(), |path, part| path.join(part));
        if !script.is_file() {
            warn!("Backend script missing at {:?}", script);
            return Err(LocateError::BackendNotFound {
                tried: vec![script],
            });
        }
        let script_arg = script.to_string_lossy().to_string();

        if can_run(PROJECT_LAUNCHER) {
            return Ok(BackendTarget {
                command: PROJECT_LAUNCHER.to_string(),
                args: vec!["run".to_string(), "python".to_string(), script_arg],
                working_directory: self.project_root.clone(),
            });
        }
        debug!("{} unavailable, probing bare interpreters", PROJECT_LAUNCHER);

        let interpreters = self.interpreter_candidates();
        for interpreter in &interpreters {
            if can_run(interpreter) {
                return Ok(BackendTarget {
                    command: interpreter.to_string(),
                    args: vec![script_arg],
                    working_directory: self.project_root.clone(),
                });
            }
        }

        let mut tried = vec![PROJECT_LAUNCHER.to_string()];
        tried.extend(interpreters.iter().map(|s| s.to_string()));
        Err(LocateError::InterpreterNotFound { tried })
    }

    fn interpreter_candidates(&self) -> Vec<&'static str> {
        if self.platform.is_windows() {
            vec!["python", "py", "python3"]
        } else {
            vec!["python3", "python"]
        }
    }

    fn locate_packaged(&self) -> Result<BackendTarget, LocateError> {
        let candidates = self.packaged_candidates();
        for candidate in &candidates {
            if candidate.is_file() {
                let working_directory = candidate
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.resource_dir.clone());
                return Ok(BackendTarget {
                    command: candidate.to_string_lossy().to_string(),
                    args: Vec::new(),
                    working_directory,
                });
            }
        }
        warn!("No packaged backend found under {:?}", self.resource_dir);
        Err(LocateError::BackendNotFound { tried: candidates })
    }

    /// Installation-relative locations, most specific first.
    pub fn packaged_candidates(&self) -> Vec<PathBuf> {
        let binary = if self.platform.is_windows() {
            format!("{}.exe", PACKAGED_BINARY_STEM)
        } else {
            PACKAGED_BINARY_STEM.to_string()
        };
        let root = &self.resource_dir;
        vec![
            root.join("backend").join(&binary),
            root.join("resources").join("backend").join(&binary),
            root.join("..").join("Resources").join("backend").join(&binary),
            root.join(&binary),
        ]
    }
}

/// Runs `<command> --version` synchronously and reports success.
pub fn command_answers_version(command: &str) -> bool {
    match Command::new(command)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn dev_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("zsim")).unwrap();
        fs::write(dir.path().join("zsim").join("api.py"), "print('ok')\n").unwrap();
        dir
    }

    #[test]
    fn dev_prefers_project_launcher() {
        let dir = dev_tree();
        let locator = BackendLocator::new(
            Environment::Development,
            Platform::Linux,
            dir.path(),
            dir.path(),
        );

        let target = locator.locate_with(|_| true).unwrap();
        assert_eq!(target.command, "uv");
        assert_eq!(target.args[..2], ["run".to_string(), "python".to_string()]);
        assert!(target.args[2].ends_with("api.py"));
        assert_eq!(target.working_directory, dir.path());
    }

    #[test]
    fn dev_falls_back_to_bare_interpreter() {
        let dir = dev_tree();
        let locator = BackendLocator::new(
            Environment::Development,
            Platform::Linux,
            dir.path(),
            dir.path(),
        );

        let target = locator.locate_with(|cmd| cmd == "python").unwrap();
        assert_eq!(target.command, "python");
        assert_eq!(target.args.len(), 1);
    }

    #[test]
    fn dev_without_interpreter_lists_everything_tried() {
        let dir = dev_tree();
        let locator = BackendLocator::new(
            Environment::Development,
            Platform::Linux,
            dir.path(),
            dir.path(),
        );

        match locator.locate_with(|_| false) {
            Err(LocateError::InterpreterNotFound { tried }) => {
                assert_eq!(tried, vec!["uv", "python3", "python"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn dev_without_script_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let locator = BackendLocator::new(
            Environment::Development,
            Platform::Linux,
            dir.path(),
            dir.path(),
        );

        assert!(matches!(
            locator.locate_with(|_| true),
            Err(LocateError::BackendNotFound { .. })
        ));
    }

    #[test]
    fn packaged_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("resources").join("backend");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("zsim_api"), b"").unwrap();
        fs::write(dir.path().join("zsim_api"), b"").unwrap();

        let locator = BackendLocator::new(
            Environment::Production,
            Platform::Linux,
            dir.path(),
            dir.path(),
        );
        let target = locator.locate_with(|_| false).unwrap();

        assert_eq!(PathBuf::from(&target.command), nested.join("zsim_api"));
        assert_eq!(target.working_directory, nested);
        assert!(target.args.is_empty());
    }

    #[test]
    fn packaged_failure_reports_every_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let locator = BackendLocator::new(
            Environment::Production,
            Platform::Windows,
            dir.path(),
            dir.path(),
        );

        match locator.locate_with(|_| true) {
            Err(LocateError::BackendNotFound { tried }) => {
                assert_eq!(tried.len(), 4);
                assert!(tried.iter().all(|p| p.to_string_lossy().ends_with("zsim_api.exe")));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
