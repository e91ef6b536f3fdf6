use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Canonical entry page of a HarmonyOS application project.
pub const ENTRY_PAGE: &str = "entry/src/main/ets/pages/Index.ets";
/// Canonical string resource file.
pub const STRING_RESOURCE: &str = "entry/src/main/resources/base/element/string.json";
/// Canonical module manifest.
pub const MODULE_MANIFEST: &str = "entry/src/main/module.json5";

/// The target application project on disk. The pipeline reads the
/// requirement from its README and writes generated sources through
/// project-relative paths.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Read the natural-language requirement from the project README.
    pub fn read_requirement(&self) -> Result<String> {
        let path = self.root.join("README.md");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Generation(format!(
                "cannot read requirement from {}: {e}",
                path.display()
            ))
        })?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(Error::Generation(format!(
                "requirement file {} is empty",
                path.display()
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Whether a project-relative path names an existing file or one of
    /// the canonical slots (which count even when absent).
    pub fn is_recognized(&self, relative: &str) -> bool {
        matches!(relative, ENTRY_PAGE | STRING_RESOURCE | MODULE_MANIFEST)
            || self.root.join(relative).is_file()
    }
}

/// Whether a path string looks project-relative (rooted at the module
/// directory, not absolute, no parent traversal).
pub fn is_project_relative(path: &str) -> bool {
    path.starts_with("entry/") && !path.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_requirement() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README.md"), "Build a counter page.\n").unwrap();
        let layout = ProjectLayout::new(dir.path());
        assert_eq!(layout.read_requirement().unwrap(), "Build a counter page.");
    }

    #[test]
    fn test_read_requirement_missing_readme() {
        let dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(dir.path());
        assert!(layout.read_requirement().is_err());
    }

    #[test]
    fn test_read_requirement_empty_readme() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README.md"), "  \n").unwrap();
        let layout = ProjectLayout::new(dir.path());
        assert!(layout.read_requirement().is_err());
    }

    #[test]
    fn test_canonical_slots_recognized_even_when_absent() {
        let dir = TempDir::new().unwrap();
        let layout = ProjectLayout::new(dir.path());
        assert!(layout.is_recognized(ENTRY_PAGE));
        assert!(layout.is_recognized(STRING_RESOURCE));
        assert!(layout.is_recognized(MODULE_MANIFEST));
        assert!(!layout.is_recognized("entry/src/main/ets/pages/Other.ets"));
    }

    #[test]
    fn test_existing_file_recognized() {
        let dir = TempDir::new().unwrap();
        let rel = "entry/src/main/ets/pages/Detail.ets";
        let abs = dir.path().join(rel);
        std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
        std::fs::write(&abs, "// page").unwrap();
        let layout = ProjectLayout::new(dir.path());
        assert!(layout.is_recognized(rel));
    }

    #[test]
    fn test_is_project_relative() {
        assert!(is_project_relative(ENTRY_PAGE));
        assert!(!is_project_relative("/tmp/Index.ets"));
        assert!(!is_project_relative("entry/../../etc/passwd"));
        assert!(!is_project_relative("unknown"));
    }
}
