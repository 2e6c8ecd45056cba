use crate::errors::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File the submission is written to inside a workspace
pub const SUBMISSION_FILE: &str = "submission.py";

/// Per-request scratch directory used as the interpreter's working directory
pub struct IsolatedWorkspace {
    /// Path to the workspace directory
    pub path: PathBuf,
    /// Whether to clean up on drop
    cleanup_on_drop: bool,
}

impl IsolatedWorkspace {
    /// Create a new isolated workspace
    pub fn new(base: &Path) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = base.join(&id);
        std::fs::create_dir_all(&path)?;

        debug!("[WORKSPACE] Created workspace: {:?}", path);

        Ok(Self {
            path,
            cleanup_on_drop: true,
        })
    }

    /// Write the submission source into the workspace
    pub fn write_submission(&self, code: &str) -> Result<PathBuf> {
        let dest = self.path.join(SUBMISSION_FILE);
        std::fs::write(&dest, code)?;
        Ok(dest)
    }

    /// Path of a file inside the workspace
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// List all files in the workspace
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                files.push(name.to_string());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Keep the workspace (don't cleanup on drop)
    pub fn keep(&mut self) {
        self.cleanup_on_drop = false;
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        if self.cleanup_on_drop {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    "[WORKSPACE] Failed to cleanup workspace {:?}: {}",
                    self.path, e
                );
            } else {
                debug!("[WORKSPACE] Cleaned up workspace: {:?}", self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_lifecycle() {
        let base = tempfile::tempdir().unwrap();
        let path;
        {
            let ws = IsolatedWorkspace::new(base.path()).unwrap();
            path = ws.path.clone();
            let written = ws.write_submission("plt.plot([1])").unwrap();
            assert_eq!(std::fs::read_to_string(written).unwrap(), "plt.plot([1])");
            assert_eq!(ws.list_files().unwrap(), vec![SUBMISSION_FILE.to_string()]);
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_kept_workspace_survives_drop() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let mut ws = IsolatedWorkspace::new(base.path()).unwrap();
            ws.keep();
            ws.path.clone()
        };
        assert!(path.exists());
    }

    #[test]
    fn test_workspaces_are_distinct() {
        let base = tempfile::tempdir().unwrap();
        let a = IsolatedWorkspace::new(base.path()).unwrap();
        let b = IsolatedWorkspace::new(base.path()).unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(a.file("output.png"), a.path.join("output.png"));
    }
}
