//! Long-term memory persistence.
//!
//! The tier is stored as a JSON array. Writes go to a temporary sibling
//! file which is then renamed over the target.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::{AgentError, Result};
use crate::memory::{MemoryItem, MemoryTier};

fn persistence_error(path: &Path, reason: impl std::fmt::Display) -> AgentError {
    AgentError::MemoryPersistence {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Load the long-term tier. A missing file is an empty tier.
pub async fn load_long_term(path: &Path) -> Result<Vec<MemoryItem>> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(persistence_error(path, e)),
    };
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut items: Vec<MemoryItem> = serde_json::from_str(&text).map_err(|e| persistence_error(path, e))?;
    for item in &mut items {
        item.tier = MemoryTier::Long;
    }
    tracing::debug!(path = %path.display(), items = items.len(), "long-term memory loaded");
    Ok(items)
}

/// Atomically replace the file at `path` with `items`.
pub async fn save_long_term(path: &Path, items: &[MemoryItem]) -> Result<()> {
    let json = serde_json::to_vec_pretty(items).map_err(|e| persistence_error(path, e))?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| persistence_error(path, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "memory.json".to_owned());
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    let written: Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(persistence_error(path, e));
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(persistence_error(path, e));
    }
    tracing::debug!(path = %path.display(), items = items.len(), "long-term memory saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
