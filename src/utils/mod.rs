// Utility functions for Exliar GPU

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Helper to create a timestamped backup of a file.
/// A missing file needs no backup and returns its own path.
pub fn create_timestamped_backup(file_path: &Path) -> io::Result<PathBuf> {
    if !file_path.exists() {
        return Ok(file_path.to_path_buf());
    }

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let backup_filename = format!(
        "{}.backup_{}",
        file_path.file_name().unwrap_or_default().to_string_lossy(),
        timestamp
    );
    let backup_path = file_path.with_file_name(backup_filename);

    fs::copy(file_path, &backup_path)?;
    debug!(from = %file_path.display(), to = %backup_path.display(), "Backed up file");
    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_copies_content_next_to_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("101.conf");
        fs::write(&original, "arch: amd64\n").unwrap();

        let backup = create_timestamped_backup(&original).unwrap();
        assert_ne!(backup, original);
        assert_eq!(backup.parent(), original.parent());
        assert!(backup.file_name().unwrap().to_string_lossy().starts_with("101.conf.backup_"));
        assert_eq!(fs::read_to_string(backup).unwrap(), "arch: amd64\n");
    }

    #[test]
    fn missing_file_needs_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert_eq!(create_timestamped_backup(&missing).unwrap(), missing);
    }
}
