//! Directory-backed store for attendance clock-in/out photos.
//!
//! Stands in for the production blob store: photos live under a root
//! directory and are addressed by a `photo://` url. Deletion is used
//! best-effort by attendance delete; callers log failures and continue
//! with the remaining photos.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use uuid::Uuid;

/// Which side of a clock session a photo belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoKind {
    ClockIn,
    ClockOut,
}

impl PhotoKind {
    fn as_str(self) -> &'static str {
        match self {
            PhotoKind::ClockIn => "in",
            PhotoKind::ClockOut => "out",
        }
    }
}

const URL_SCHEME: &str = "photo://";

pub struct PhotoStore {
    root: PathBuf,
}

impl PhotoStore {
    /// Open (creating if needed) a photo store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create photo store root {}", root.display()))?;
        Ok(PhotoStore { root })
    }

    /// Save an attendance photo, returning its url.
    pub fn save_attendance_photo(
        &self,
        bytes: &[u8],
        staff_id: &str,
        session_id: &str,
        kind: PhotoKind,
    ) -> anyhow::Result<String> {
        let rel = format!(
            "{staff_id}/{session_id}-{}-{}.jpg",
            kind.as_str(),
            Uuid::new_v4().simple()
        );
        let path = self.root.join(&rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create photo dir {}", parent.display()))?;
        }
        fs::write(&path, bytes).with_context(|| format!("write photo {}", path.display()))?;
        Ok(format!("{URL_SCHEME}{rel}"))
    }

    /// Delete a photo by its url. Unknown schemes and traversal attempts
    /// are rejected; a missing file is not an error.
    pub fn delete_by_url(&self, url: &str) -> anyhow::Result<()> {
        let path = self.path_from_url(url)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("delete photo {}: {e}", path.display())),
        }
    }

    fn path_from_url(&self, url: &str) -> anyhow::Result<PathBuf> {
        let rel = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| anyhow!("not a photo url: {url}"))?;
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(anyhow!("invalid photo path: {rel}"));
        }
        Ok(self.root.join(rel_path))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
