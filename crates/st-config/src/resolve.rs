//! Definition file discovery.
//!
//! Resolution order for a relative `def_file`:
//! 1. Explicitly configured directories, in the order they were added
//! 2. `SIMTEL_REPORT_DEF_PATH` (colon-separated directories)
//! 3. Fallback directories (the descriptor document's own directory)
//! 4. The current working directory
//!
//! Absolute paths are used as-is.

use std::path::{Path, PathBuf};
use tracing::trace;

/// Environment variable listing extra definition directories.
pub const ENV_REPORT_DEF_PATH: &str = "SIMTEL_REPORT_DEF_PATH";

/// Where a definition file was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionSource {
    Absolute,
    Explicit,
    Environment,
    Fallback,
    WorkingDirectory,
}

impl std::fmt::Display for DefinitionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefinitionSource::Absolute => write!(f, "absolute path"),
            DefinitionSource::Explicit => write!(f, "configured directory"),
            DefinitionSource::Environment => write!(f, "environment variable"),
            DefinitionSource::Fallback => write!(f, "descriptor directory"),
            DefinitionSource::WorkingDirectory => write!(f, "working directory"),
        }
    }
}

/// Ordered list of directories searched for definition files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefinitionSearchPath {
    explicit: Vec<PathBuf>,
    env: Vec<PathBuf>,
    fallback: Vec<PathBuf>,
}

impl DefinitionSearchPath {
    /// Search path with no directories besides the working directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Search path seeded from `SIMTEL_REPORT_DEF_PATH`.
    pub fn from_env() -> Self {
        let mut path = Self::new();
        if let Ok(value) = std::env::var(ENV_REPORT_DEF_PATH) {
            path.env = split_path_list(&value);
        }
        path
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.explicit.push(dir.into());
        self
    }

    pub fn push_dir(&mut self, dir: impl Into<PathBuf>) {
        self.explicit.push(dir.into());
    }

    pub fn push_fallback(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if !self.fallback.contains(&dir) {
            self.fallback.push(dir);
        }
    }

    /// Candidate directories in resolution order.
    pub fn directories(&self) -> Vec<(PathBuf, DefinitionSource)> {
        let mut dirs = Vec::new();
        dirs.extend(self.explicit.iter().cloned().map(|d| (d, DefinitionSource::Explicit)));
        dirs.extend(self.env.iter().cloned().map(|d| (d, DefinitionSource::Environment)));
        dirs.extend(self.fallback.iter().cloned().map(|d| (d, DefinitionSource::Fallback)));
        dirs.push((PathBuf::from("."), DefinitionSource::WorkingDirectory));
        dirs
    }

    /// Locate `file`, returning the first existing candidate.
    pub fn resolve(&self, file: &Path) -> Option<PathBuf> {
        self.resolve_with_source(file).map(|(p, _)| p)
    }

    pub fn resolve_with_source(&self, file: &Path) -> Option<(PathBuf, DefinitionSource)> {
        if file.is_absolute() {
            return file.exists().then(|| (file.to_path_buf(), DefinitionSource::Absolute));
        }
        for (dir, source) in self.directories() {
            let candidate = dir.join(file);
            trace!(candidate = %candidate.display(), %source, "Probing definition path");
            if candidate.is_file() {
                return Some((candidate, source));
            }
        }
        None
    }
}

impl std::fmt::Display for DefinitionSearchPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dirs: Vec<String> = self
            .directories()
            .into_iter()
            .map(|(d, _)| d.display().to_string())
            .collect();
        write!(f, "[{}]", dirs.join(", "))
    }
}

fn split_path_list(value: &str) -> Vec<PathBuf> {
    value
        .split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_explicit_dir_wins_over_fallback() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        std::fs::write(a.path().join("def.yaml"), "name: a\n").unwrap();
        std::fs::write(b.path().join("def.yaml"), "name: b\n").unwrap();

        let mut search = DefinitionSearchPath::new().with_dir(a.path());
        search.push_fallback(b.path());
        let (found, source) = search.resolve_with_source(Path::new("def.yaml")).unwrap();
        assert_eq!(found, a.path().join("def.yaml"));
        assert_eq!(source, DefinitionSource::Explicit);
    }

    #[test]
    fn test_fallback_used_when_missing_elsewhere() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        std::fs::write(b.path().join("only_b.yaml"), "name: b\n").unwrap();

        let mut search = DefinitionSearchPath::new().with_dir(a.path());
        search.push_fallback(b.path());
        search.push_fallback(b.path());
        assert_eq!(search.directories().len(), 3);
        let (_, source) = search.resolve_with_source(Path::new("only_b.yaml")).unwrap();
        assert_eq!(source, DefinitionSource::Fallback);
    }

    #[test]
    fn test_absolute_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("abs.yaml");
        std::fs::write(&file, "name: x\n").unwrap();
        let search = DefinitionSearchPath::new();
        assert_eq!(
            search.resolve_with_source(&file),
            Some((file.clone(), DefinitionSource::Absolute))
        );
        assert!(search.resolve(&dir.path().join("nope.yaml")).is_none());
    }

    #[test]
    fn test_split_path_list() {
        let dirs = split_path_list("/a:: /b :");
        assert_eq!(dirs, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }
}
