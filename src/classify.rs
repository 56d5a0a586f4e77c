//! File classification
//!
//! Pure filename-extension lookup mapping completed downloads into category
//! subdirectories. Rules are injectable through the manager configuration.

use crate::error::{DownloadError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Category used when no rule matches
pub const FALLBACK_CATEGORY: &str = "Other";

fn default_rules() -> HashMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 6] = [
        ("Videos", &[".mp4", ".avi", ".mkv", ".mov"]),
        ("Audio", &[".mp3", ".flac", ".wav", ".aac"]),
        ("Documents", &[".pdf", ".doc", ".docx", ".xls", ".xlsx"]),
        ("Archives", &[".zip", ".rar", ".7z", ".tar.gz"]),
        ("Programs", &[".exe", ".msi"]),
        ("Images", &[".jpg", ".png", ".gif", ".bmp", ".webp"]),
    ];
    table
        .into_iter()
        .map(|(cat, exts)| {
            (
                cat.to_string(),
                exts.iter().map(|e| e.to_string()).collect(),
            )
        })
        .collect()
}

/// Lower-cased extension including the dot, with `.tar.gz` kept compound.
fn extract_extension(file_name: &str) -> String {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".tar.gz") {
        return ".tar.gz".to_string();
    }
    match Path::new(&lower).extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

/// Extension → category lookup with a move-on-complete helper
pub struct FileClassifier {
    rules: RwLock<HashMap<String, Vec<String>>>,
}

impl FileClassifier {
    /// Classifier with the built-in rules
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(default_rules()),
        }
    }

    /// Classifier with caller-supplied rules
    pub fn with_rules(rules: HashMap<String, Vec<String>>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Category for a filename; `"Other"` when nothing matches.
    pub fn classify(&self, file_name: &str) -> String {
        let ext = extract_extension(file_name);
        if ext.is_empty() {
            return FALLBACK_CATEGORY.to_string();
        }

        let rules = self.rules.read();
        for (category, extensions) in rules.iter() {
            if extensions.iter().any(|e| e.to_lowercase() == ext) {
                return category.clone();
            }
        }
        FALLBACK_CATEGORY.to_string()
    }

    /// Move a completed file into `<base_dir>/<category>/`, creating the
    /// category directory on demand. Returns the new path.
    pub async fn move_to_category(&self, file_path: &Path, base_dir: &Path) -> Result<PathBuf> {
        let file_name = file_path
            .file_name()
            .ok_or_else(|| DownloadError::storage(file_path, "path has no file name"))?;

        let category = self.classify(&file_name.to_string_lossy());
        let dest_dir = base_dir.join(&category);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| DownloadError::storage(&dest_dir, format!("create dir failed: {e}")))?;

        let dest = dest_dir.join(file_name);
        tokio::fs::rename(file_path, &dest)
            .await
            .map_err(|e| DownloadError::storage(file_path, format!("rename failed: {e}")))?;
        Ok(dest)
    }

    /// Replace the rule set
    pub fn update_rules(&self, rules: HashMap<String, Vec<String>>) {
        *self.rules.write() = rules;
    }

    /// Current rules, cloned
    pub fn rules(&self) -> HashMap<String, Vec<String>> {
        self.rules.read().clone()
    }
}

impl Default for FileClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn classifies_by_extension() {
        let c = FileClassifier::new();
        assert_eq!(c.classify("movie.mp4"), "Videos");
        assert_eq!(c.classify("song.FLAC"), "Audio");
        assert_eq!(c.classify("report.pdf"), "Documents");
        assert_eq!(c.classify("setup.exe"), "Programs");
        assert_eq!(c.classify("photo.webp"), "Images");
    }

    #[test]
    fn compound_tar_gz_extension() {
        let c = FileClassifier::new();
        assert_eq!(c.classify("backup.tar.gz"), "Archives");
        assert_eq!(c.classify("BACKUP.TAR.GZ"), "Archives");
        // A plain .gz is not in the default rules
        assert_eq!(c.classify("data.gz"), "Other");
    }

    #[test]
    fn unknown_and_missing_extensions() {
        let c = FileClassifier::new();
        assert_eq!(c.classify("mystery.xyz"), "Other");
        assert_eq!(c.classify("README"), "Other");
    }

    #[test]
    fn custom_rules_override_defaults() {
        let mut rules = HashMap::new();
        rules.insert("Books".to_string(), vec![".epub".to_string()]);
        let c = FileClassifier::with_rules(rules);
        assert_eq!(c.classify("novel.epub"), "Books");
        // Default rules are gone
        assert_eq!(c.classify("movie.mp4"), "Other");
    }

    #[tokio::test]
    async fn moves_file_into_category_dir() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("clip.mp4");
        tokio::fs::write(&src, b"data").await.unwrap();

        let c = FileClassifier::new();
        let dest = c.move_to_category(&src, dir.path()).await.unwrap();

        assert_eq!(dest, dir.path().join("Videos").join("clip.mp4"));
        assert!(!src.exists());
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn move_missing_file_fails() {
        let dir = tempdir().unwrap();
        let c = FileClassifier::new();
        let missing = dir.path().join("nope.mp4");
        assert!(c.move_to_category(&missing, dir.path()).await.is_err());
    }
}
