//! Extension registry - manages installed extensions
//!
//! Handles discovery, enable/disable bookkeeping and uninstall. Loading an
//! extension into a unit is the runtime's job; the registry only knows what
//! is on disk.

use super::manifest::{ExtensionManifest, MANIFEST_FILES};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Marker file that disables an extension without uninstalling it
const DISABLED_MARKER: &str = ".disabled";

/// Information about an installed extension
#[derive(Debug, Clone)]
pub struct InstalledExtension {
    pub manifest: ExtensionManifest,
    /// Installation directory
    pub path: PathBuf,
    pub enabled: bool,
}

impl InstalledExtension {
    /// Load an installed extension from its directory
    pub fn load(extension_dir: &Path) -> Result<Self> {
        let manifest = ExtensionManifest::load_from_dir(extension_dir)
            .with_context(|| format!("Invalid extension at {}", extension_dir.display()))?;
        let enabled = !extension_dir.join(DISABLED_MARKER).exists();

        Ok(Self {
            manifest,
            path: extension_dir.to_path_buf(),
            enabled,
        })
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn enable(&mut self) -> Result<()> {
        let marker = self.path.join(DISABLED_MARKER);
        if marker.exists() {
            std::fs::remove_file(&marker)?;
        }
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        std::fs::write(self.path.join(DISABLED_MARKER), "")?;
        self.enabled = false;
        Ok(())
    }
}

/// Registry of all installed extensions
pub struct ExtensionRegistry {
    extensions: HashMap<String, InstalledExtension>,
    extensions_dir: PathBuf,
}

impl ExtensionRegistry {
    /// Scan the default extensions directory
    pub fn new() -> Result<Self> {
        Self::open(super::extensions_dir()?)
    }

    /// Scan a specific extensions directory
    pub fn open(extensions_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut registry = Self {
            extensions: HashMap::new(),
            extensions_dir: extensions_dir.into(),
        };
        registry.scan()?;
        Ok(registry)
    }

    /// Rescan the extensions directory
    pub fn scan(&mut self) -> Result<()> {
        self.extensions.clear();

        if !self.extensions_dir.exists() {
            std::fs::create_dir_all(&self.extensions_dir)?;
            return Ok(());
        }

        for entry in std::fs::read_dir(&self.extensions_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if !MANIFEST_FILES.iter().any(|name| path.join(name).exists()) {
                tracing::debug!("Skipping {}: no manifest", path.display());
                continue;
            }

            match InstalledExtension::load(&path) {
                Ok(extension) => {
                    tracing::debug!(
                        "Found extension: {} v{}",
                        extension.manifest.display_name(),
                        extension.manifest.version
                    );
                    self.extensions
                        .insert(extension.id().to_string(), extension);
                }
                Err(e) => {
                    tracing::warn!("Failed to load extension at {}: {:#}", path.display(), e);
                }
            }
        }

        tracing::debug!("Found {} extensions", self.extensions.len());
        Ok(())
    }

    /// All installed extensions, ordered by id
    pub fn all(&self) -> Vec<&InstalledExtension> {
        let mut list: Vec<_> = self.extensions.values().collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    pub fn list_enabled(&self) -> Vec<&InstalledExtension> {
        self.all().into_iter().filter(|e| e.enabled).collect()
    }

    pub fn get(&self, id: &str) -> Option<&InstalledExtension> {
        self.extensions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut InstalledExtension> {
        self.extensions.get_mut(id)
    }

    pub fn enable(&mut self, id: &str) -> Result<()> {
        self.get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Extension '{}' not found", id))?
            .enable()
    }

    pub fn disable(&mut self, id: &str) -> Result<()> {
        self.get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Extension '{}' not found", id))?
            .disable()
    }

    /// Remove an extension's directory
    pub fn uninstall(&mut self, id: &str) -> Result<()> {
        let extension = self
            .extensions
            .remove(id)
            .ok_or_else(|| anyhow::anyhow!("Extension '{}' not found", id))?;

        std::fs::remove_dir_all(&extension.path)?;

        tracing::info!("Uninstalled extension: {}", id);
        Ok(())
    }

    pub fn extensions_dir(&self) -> &Path {
        &self.extensions_dir
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_extension(root: &Path, id: &str) -> PathBuf {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("extension.toml"),
            format!("id = \"{}\"\nversion = \"0.1.0\"\nmain = \"index.js\"\n", id),
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_scan_and_toggle() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(tmp.path(), "alpha");
        write_extension(tmp.path(), "beta");
        std::fs::create_dir_all(tmp.path().join("not-an-extension")).unwrap();

        let mut registry = ExtensionRegistry::open(tmp.path()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list_enabled().len(), 2);

        registry.disable("beta").unwrap();
        assert!(tmp.path().join("beta").join(DISABLED_MARKER).exists());

        // state survives a rescan
        registry.scan().unwrap();
        let enabled: Vec<_> = registry.list_enabled().iter().map(|e| e.id().to_string()).collect();
        assert_eq!(enabled, vec!["alpha".to_string()]);

        registry.enable("beta").unwrap();
        assert_eq!(registry.list_enabled().len(), 2);
    }

    #[test]
    fn test_uninstall_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_extension(tmp.path(), "gone");
        let mut registry = ExtensionRegistry::open(tmp.path()).unwrap();
        registry.uninstall("gone").unwrap();
        assert!(!dir.exists());
        assert!(registry.uninstall("gone").is_err());
    }
}
