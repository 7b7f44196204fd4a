//! Canonical path handle used throughout the mining pipeline.
//!
//! A [`FileRef`] denotes a filesystem location independently of whether the
//! location currently exists. Equality and hashing use the lexically cleaned
//! absolute path, so two handles built from `/a/./b` and `/a/b` compare equal
//! without touching the disk. Prefix tests are by whole path segment.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

/// Bytes escaped in the path portion of a `file://` URI.
///
/// `/` stays literal. The set is RFC 3986: everything that is not a pchar.
const URI_PATH_ESCAPES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// An opaque handle for a filesystem path.
///
/// Cheap to clone, comparable for equality, testable for segment-wise prefix
/// containment, and convertible to a `file://` URI.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FileRef {
    path: PathBuf,
}

impl FileRef {
    /// Build a handle from a path, cleaning it lexically.
    ///
    /// `.` components are dropped and `..` pops the previous segment. No
    /// filesystem access happens; symlinks are left alone.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut cleaned = PathBuf::new();
        for component in path.as_ref().components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    cleaned.pop();
                }
                other => cleaned.push(other),
            }
        }
        Self { path: cleaned }
    }

    /// The cleaned path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path segment as shown to users, e.g. `c.txt` for `/root/sub/c.txt`.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    /// Handle for the containing directory, if any.
    pub fn parent(&self) -> Option<FileRef> {
        self.path.parent().map(FileRef::new)
    }

    /// Whether `self` lies strictly below `prefix`, by whole path segments.
    ///
    /// `/root/subdir` is a prefix of `/root/subdir/file.txt` but not of
    /// `/root/subdirectory`, and a path is not its own prefix.
    pub fn has_prefix(&self, prefix: &FileRef) -> bool {
        self != prefix && self.path.starts_with(&prefix.path)
    }

    /// Render as a `file://` URI with percent-encoded path bytes.
    pub fn uri(&self) -> String {
        let raw = self.path.to_string_lossy();
        format!("file://{}", utf8_percent_encode(&raw, URI_PATH_ESCAPES))
    }

    /// Current modification time on disk, or `None` when stat fails.
    ///
    /// Uses `symlink_metadata` so a dangling symlink still answers for itself.
    pub fn modified_time(&self) -> Option<SystemTime> {
        std::fs::symlink_metadata(&self.path)
            .ok()
            .and_then(|meta| meta.modified().ok())
    }

    /// Whether anything exists at this path right now.
    pub fn exists_on_disk(&self) -> bool {
        std::fs::symlink_metadata(&self.path).is_ok()
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileRef({})", self.path.display())
    }
}

impl From<&Path> for FileRef {
    fn from(path: &Path) -> Self {
        FileRef::new(path)
    }
}

impl From<PathBuf> for FileRef {
    fn from(path: PathBuf) -> Self {
        FileRef::new(path)
    }
}

impl From<&str> for FileRef {
    fn from(path: &str) -> Self {
        FileRef::new(path)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
