// src/runtime/filesystem.rs
//! Root filesystem provisioning
//!
//! Images are fetched into a local cache, then unpacked into a per-node
//! directory. Any failure surfaces as `UnavailableDependency`.

use crate::runtime::shell::{quote, Shell};
use crate::utils::errors::{PlatformError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Fetches and unpacks filesystem images
pub trait FilesystemProvider: Send + Sync {
    /// Make `image` available locally and return the archive path
    fn download(&self, image: &str) -> Result<PathBuf>;

    /// Unpack `archive` into `dest` and return the resulting root path
    fn extract(&self, archive: &Path, dest: &Path) -> Result<PathBuf>;

    /// Delete an extracted root; a missing root is not an error
    fn remove(&self, root: &Path) -> Result<()>;
}

/// Provider for images reachable on the local filesystem
///
/// Accepts plain paths and `file://` URIs; archives are unpacked with `tar`.
pub struct LocalFileManager {
    cache_dir: PathBuf,
    shell: Arc<dyn Shell>,
}

impl LocalFileManager {
    pub fn new(cache_dir: impl Into<PathBuf>, shell: Arc<dyn Shell>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            shell,
        }
    }

    fn source_path(image: &str) -> Result<PathBuf> {
        if let Some(path) = image.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        if let Some((scheme, _)) = image.split_once("://") {
            return Err(PlatformError::UnavailableDependency(format!(
                "Unsupported image scheme '{}' in {}",
                scheme, image
            )));
        }
        Ok(PathBuf::from(image))
    }
}

impl FilesystemProvider for LocalFileManager {
    fn download(&self, image: &str) -> Result<PathBuf> {
        let source = Self::source_path(image)?;
        if !source.is_file() {
            return Err(PlatformError::UnavailableDependency(format!(
                "Image {} not found at {:?}",
                image, source
            )));
        }

        let file_name = source.file_name().ok_or_else(|| {
            PlatformError::UnavailableDependency(format!("Image {} has no file name", image))
        })?;
        let cached = self.cache_dir.join(file_name);

        if cached.exists() {
            debug!("Image {} already cached at {:?}", image, cached);
            return Ok(cached);
        }

        fs::create_dir_all(&self.cache_dir).map_err(|e| {
            PlatformError::UnavailableDependency(format!("Failed to create cache: {}", e))
        })?;
        fs::copy(&source, &cached).map_err(|e| {
            PlatformError::UnavailableDependency(format!("Failed to fetch {}: {}", image, e))
        })?;

        info!("Fetched image {} into {:?}", image, cached);
        Ok(cached)
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest).map_err(|e| {
            PlatformError::UnavailableDependency(format!("Failed to create {:?}: {}", dest, e))
        })?;

        let command = format!(
            "tar -xf {} -C {}",
            quote(&archive.to_string_lossy()),
            quote(&dest.to_string_lossy())
        );
        self.shell.run(&command).map_err(|e| {
            PlatformError::UnavailableDependency(format!("Failed to extract {:?}: {}", archive, e))
        })?;

        debug!("Extracted {:?} into {:?}", archive, dest);
        Ok(dest.to_path_buf())
    }

    fn remove(&self, root: &Path) -> Result<()> {
        match fs::remove_dir_all(root) {
            Ok(()) => {
                debug!("Removed root filesystem {:?}", root);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
