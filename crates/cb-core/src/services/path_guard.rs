use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{OrchestratorError, Result};

/// Absolute path tokens: a `/` at the start of the command or after whitespace, `=`, a quote or `:`.
static ABSOLUTE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:^|[\s='":])(/[^\s'";|&<>()`]*)"#).unwrap());

static PARENT_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[/\s='])\.\.(?:/|$|[\s'])").unwrap());

/// Allow-list of remote directories commands may reference.
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn check_path(&self, path: &str) -> Result<()> {
        let candidate = Path::new(path);
        if !candidate.is_absolute() {
            return Err(rejected(path, "path must be absolute"));
        }
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(rejected(path, "parent-directory traversal"));
        }
        if self.roots.iter().any(|root| candidate.starts_with(root)) {
            Ok(())
        } else {
            Err(rejected(path, "outside the allowed directories"))
        }
    }

    /// Reject a command if any path embedded in it falls outside the allow-list.
    pub fn check_command(&self, command: &str) -> Result<()> {
        if let Some(m) = PARENT_SEGMENT_RE.find(command) {
            return Err(rejected(m.as_str().trim(), "parent-directory traversal"));
        }
        for caps in ABSOLUTE_PATH_RE.captures_iter(command) {
            let path = &caps[1];
            // A `//` token is a URL scheme tail such as `http://`, not a path.
            if path.starts_with("//") {
                continue;
            }
            self.check_path(path)?;
        }
        Ok(())
    }
}

fn rejected(path: &str, reason: &str) -> OrchestratorError {
    OrchestratorError::ExecPathRejected {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
