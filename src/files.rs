//! Host filesystem access on behalf of the agent.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AppError, Result};

/// Services inbound `fs/read_text_file` and `fs/write_text_file` calls.
#[derive(Debug, Clone)]
pub struct FileAccessProxy {
    workspace_root: PathBuf,
}

impl FileAccessProxy {
    /// Create a proxy; relative paths resolve against `workspace_root`.
    #[must_use]
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }

    /// Read a file as text, optionally windowed by line.
    ///
    /// With `line` and/or `limit` supplied the content is split on line
    /// breaks and the window `[line, line + limit)` is returned (`line` is
    /// 0-indexed); with neither supplied the content is returned unmodified.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] when the file cannot be read.
    pub async fn read_text_file(
        &self,
        path: &str,
        line: Option<usize>,
        limit: Option<usize>,
    ) -> Result<String> {
        let path = self.resolve(path);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| AppError::Io(format!("read {}: {err}", path.display())))?;

        if line.is_none() && limit.is_none() {
            return Ok(content);
        }

        let start = line.unwrap_or(0);
        let window: Vec<&str> = match limit {
            Some(limit) => content.lines().skip(start).take(limit).collect(),
            None => content.lines().skip(start).collect(),
        };
        Ok(window.join("\n"))
    }

    /// Fully overwrite a file, creating missing parent directories first.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] when a directory or the file cannot be
    /// written.
    pub async fn write_text_file(&self, path: &str, content: &str) -> Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| AppError::Io(format!("mkdir {}: {err}", parent.display())))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|err| AppError::Io(format!("write {}: {err}", path.display())))?;
        debug!(path = %path.display(), bytes = content.len(), "file written");
        Ok(())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace_root.join(candidate)
        }
    }
}
