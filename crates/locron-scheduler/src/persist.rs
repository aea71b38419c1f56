//! Crash-safe file persistence shared by the stores.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::SchedulerError;

/// Read a file, treating a missing file as `None`.
pub(crate) async fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Serialize `value` and replace `path` with it atomically.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SchedulerError> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes()).await?;
    Ok(())
}

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a partial one.
///
/// The temp file lives in the same directory so the final rename stays on one
/// filesystem.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(path);
    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "locron".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}
