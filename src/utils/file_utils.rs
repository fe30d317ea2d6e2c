//! File system utilities

use anyhow::{anyhow, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Ensure directory exists
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| anyhow!("Failed to create directory {}: {}", path.display(), e))?;
    }
    Ok(())
}

/// Sanitize filename for filesystem
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .trim()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    // "." and ".." would escape the library directory
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually deleted.
pub async fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// True when `path` is a regular file with at least one byte.
pub async fn is_non_empty_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// Serialize `value` as pretty JSON and replace `path` via a temp file rename
pub async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename(".."), "_");
        assert_eq!(sanitize_filename("  "), "_");
        assert_eq!(
            sanitize_filename("3f1c0d1e-video"),
            "3f1c0d1e-video".to_string()
        );
    }

    #[tokio::test]
    async fn test_remove_file_if_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.mp4");
        tokio::fs::write(&path, b"abc").await.unwrap();

        assert!(is_non_empty_file(&path).await);
        assert!(remove_file_if_exists(&path).await.unwrap());
        assert!(!remove_file_if_exists(&path).await.unwrap());
        assert!(!is_non_empty_file(&path).await);
    }
}
