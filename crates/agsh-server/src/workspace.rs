//! Per-session working directory convention.
//!
//! Sessions live under `<root>/<owner-hash>/<name>`, created on demand. A
//! request may point at an existing absolute directory instead, and may ask
//! for a repository to be cloned into a fresh directory before the agent
//! CLI starts there.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::info;

use agsh_core::{AgshError, AgshResult};

pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Default directory for an (owner, name) pair.
    pub fn session_dir(&self, owner: &str, name: &str) -> PathBuf {
        self.root.join(owner_hash(owner)).join(sanitize(name))
    }

    /// Resolve and materialize the working directory for a new session.
    pub async fn prepare(
        &self,
        owner: &str,
        name: &str,
        override_dir: Option<&Path>,
        repo_url: Option<&str>,
    ) -> AgshResult<PathBuf> {
        let dir = match override_dir {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => {
                return Err(AgshError::Workspace(format!(
                    "workdir override must be absolute: {}",
                    dir.display()
                )))
            }
            None => self.session_dir(owner, name),
        };

        tokio::fs::create_dir_all(&dir).await?;

        if let Some(url) = repo_url {
            if dir_is_empty(&dir).await? {
                clone_into(url, &dir).await?;
            }
        }

        Ok(dir)
    }
}

/// Stable short hash of the owner identity, keeping emails out of paths.
fn owner_hash(owner: &str) -> String {
    let digest = Sha256::digest(owner.to_lowercase().as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Restrict display names to filesystem-safe characters.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

async fn dir_is_empty(dir: &Path) -> AgshResult<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}

/// Shallow-clone a repository into an empty directory.
async fn clone_into(url: &str, dir: &Path) -> AgshResult<()> {
    info!(url, dir = %dir.display(), "cloning repository");
    let output = Command::new("git")
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(url)
        .arg(dir)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(AgshError::Workspace(format!("git clone failed: {tail}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_dirs_are_stable_and_safe() {
        let layout = WorkspaceLayout::new(PathBuf::from("/srv/workspaces"));
        let a = layout.session_dir("Alice@Example.com", "my app!");
        let b = layout.session_dir("alice@example.com", "my app!");
        assert_eq!(a, b);
        assert!(a.ends_with(format!("{}/my-app-", owner_hash("alice@example.com"))));
    }

    #[test]
    fn sanitize_falls_back_for_empty_names() {
        assert_eq!(sanitize("///"), "---");
        assert_eq!(sanitize(""), "session");
    }

    #[tokio::test]
    async fn prepare_creates_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(root.path().to_path_buf());
        let dir = layout.prepare("alice", "demo", None, None).await.unwrap();
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn relative_override_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(root.path().to_path_buf());
        let err = layout
            .prepare("alice", "demo", Some(Path::new("relative/path")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgshError::Workspace(_)));
    }
}
