//! On-disk layout of bundle generations and the published pointer.
//!
//! ```text
//! <data>/current            -> bundles/<generation>   (symlink, swapped atomically)
//! <data>/bundles/<generation>/index.html
//! <data>/bundles/<generation>/media/...
//! <data>/bundles/.staging/                            (build area, never published)
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone)]
pub struct BundleLayout {
    current: PathBuf,
    generations: PathBuf,
}

impl BundleLayout {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            current: data_dir.join("current"),
            generations: data_dir.join("bundles"),
        }
    }

    /// The published bundle location readers open.
    pub fn current(&self) -> &Path {
        &self.current
    }

    pub fn current_index(&self) -> PathBuf {
        self.current.join("index.html")
    }

    pub fn generations(&self) -> &Path {
        &self.generations
    }

    pub fn staging(&self) -> PathBuf {
        self.generations.join(STAGING_DIR)
    }

    pub fn generation_dir(&self, generation: &str) -> PathBuf {
        self.generations.join(generation)
    }

    /// Whether a complete bundle is published.
    pub fn is_published(&self) -> bool {
        self.current_index().is_file()
    }

    /// Name of the generation `current` points at, if any.
    pub fn current_generation(&self) -> Option<String> {
        #[cfg(unix)]
        {
            std::fs::read_link(&self.current)
                .ok()
                .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    /// Point `current` at `generation_dir`.
    ///
    /// On unix a fresh symlink is renamed over `current`; rename of a symlink
    /// is atomic, so readers resolve either the old or the new generation.
    /// Elsewhere the generation directory itself is moved into place.
    pub fn publish(&self, generation_dir: &Path) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            let swap = self.current.with_extension("swap");
            match std::fs::remove_file(&swap) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            let relative = Path::new("bundles").join(
                generation_dir
                    .file_name()
                    .ok_or_else(|| std::io::Error::other("generation dir has no name"))?,
            );
            std::os::unix::fs::symlink(&relative, &swap)?;
            if self.current.is_dir() && !is_symlink(&self.current) {
                // Left over from a non-symlink layout.
                std::fs::remove_dir_all(&self.current)?;
            }
            std::fs::rename(&swap, &self.current)
        }
        #[cfg(not(unix))]
        {
            let old = self.current.with_extension("old");
            let _ = std::fs::remove_dir_all(&old);
            if self.current.exists() {
                std::fs::rename(&self.current, &old)?;
            }
            std::fs::rename(generation_dir, &self.current)?;
            let _ = std::fs::remove_dir_all(&old);
            Ok(())
        }
    }

    /// Remove every generation not named in `keep`. Staging is left alone.
    pub fn prune(&self, keep: &[&str]) -> std::io::Result<usize> {
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.generations) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == STAGING_DIR || keep.contains(&name.as_str()) {
                continue;
            }
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Delete the published pointer, every generation and the staging area.
    pub fn clear(&self) -> std::io::Result<()> {
        if is_symlink(&self.current) {
            std::fs::remove_file(&self.current)?;
        } else if self.current.exists() {
            std::fs::remove_dir_all(&self.current)?;
        }
        match std::fs::remove_dir_all(&self.generations) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}
