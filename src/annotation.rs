//! Name sets loaded from newline-delimited annotation files
//!
//! Annotation files are produced by the source-level analyzers that run
//! before instrumentation. Each line holds one identifier: a runtime tracing
//! function that must never be instrumented, a file-system function of
//! interest, or a struct type whose pointers are worth tracking.
//!
//! Loading merges into the existing set, so several files can feed the same
//! set. A missing or unreadable file is logged and otherwise ignored.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

/// Set of identifiers read from one or more annotation files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationSet {
    names: HashSet<String>,
}

impl AnnotationSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from in-memory names
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        set.extend(names);
        set
    }

    /// Load every file in `paths`, merging into one set
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mut set = Self::new();
        for path in paths {
            set.load(path);
        }
        set
    }

    /// Merge the names in `path` into this set
    ///
    /// Failures are logged with `tracing::error!` and leave the set as it
    /// was. Returns the number of names that were not already present.
    pub fn load(&mut self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        match self.try_load(path) {
            Ok(added) => {
                tracing::debug!(path = %path.display(), added, "loaded annotation file");
                added
            }
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "cannot open annotation file");
                0
            }
        }
    }

    /// Merge the names in `path`, reporting I/O failures to the caller
    pub fn try_load(&mut self, path: impl AsRef<Path>) -> io::Result<usize> {
        let contents = fs::read_to_string(path)?;
        let before = self.names.len();
        self.extend(contents.lines());
        Ok(self.names.len() - before)
    }

    /// Case-exact membership test
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Remove every name
    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterate names in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl<S: Into<String>> Extend<S> for AnnotationSet {
    fn extend<T: IntoIterator<Item = S>>(&mut self, iter: T) {
        for name in iter {
            let name: String = name.into();
            let name = name.trim_end_matches('\r');
            if !name.is_empty() {
                self.names.insert(name.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_list(lines: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(lines.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_merges_files() {
        let a = write_list("trace_load_inst\ntrace_store_inst\n");
        let b = write_list("trace_store_inst\ntrace_init_all\n");

        let mut set = AnnotationSet::new();
        assert_eq!(set.load(a.path()), 2);
        assert_eq!(set.load(b.path()), 1);
        assert_eq!(set.len(), 3);
        assert!(set.contains("trace_init_all"));
    }

    #[test]
    fn test_missing_file_keeps_existing_names() {
        let mut set = AnnotationSet::from_names(["nova_write"]);
        assert_eq!(set.load("/nonexistent/annotations.txt"), 0);
        assert!(set.contains("nova_write"));
        assert!(set.try_load("/nonexistent/annotations.txt").is_err());
    }

    #[test]
    fn test_membership_is_case_exact() {
        let set = AnnotationSet::from_names(["nova_inode"]);
        assert!(set.contains("nova_inode"));
        assert!(!set.contains("NOVA_INODE"));
        assert!(!set.contains("nova_inode "));
    }

    #[test]
    fn test_blank_lines_and_crlf() {
        let file = write_list("pmfs_inode\r\n\r\n\npmfs_super_block\n");
        let set = AnnotationSet::from_files(&[file.path()]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("pmfs_inode"));
        assert!(!set.contains(""));
    }

    #[test]
    fn test_clear() {
        let mut set = AnnotationSet::from_names(["a", "b"]);
        set.clear();
        assert!(set.is_empty());
        assert!(!set.contains("a"));
    }
}
