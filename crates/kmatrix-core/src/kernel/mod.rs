//! Kernel targets and the catalog they are selected from.
//!
//! A catalog is loaded once from one or more TOML sources, repaired by
//! [`KernelCatalog::resolve_fallbacks`], and is read-only afterwards.
//!
//! Catalog file format:
//!
//! ```toml
//! [[kernels]]
//! distro = "Ubuntu"
//! version = "18.04"
//! release = "4.15.0-20-generic"
//! kernel_path = "/home/user/.kmatrix/kernels/vmlinuz-4.15.0-20-generic"
//! rootfs_path = "/home/user/.kmatrix/images/ubuntu-18.04.img"
//! ```

pub mod fallback;
pub mod selector;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use kmatrix_state::TargetRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{KmatrixError, Result};

pub use fallback::FallbackReport;
pub use selector::select;

// ---------------------------------------------------------------------------
// DistroVersion
// ---------------------------------------------------------------------------

/// Distribution version ("18.04", "7", "8.2") compared by its numeric parts,
/// so "18.4" and "18.04" are the same version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistroVersion(String);

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Part<'a> {
    Num(u64),
    Text(&'a str),
}

impl DistroVersion {
    pub fn new(version: impl Into<String>) -> Self {
        DistroVersion(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> Vec<Part<'_>> {
        self.0
            .split(['.', '-', '_'])
            .filter(|p| !p.is_empty())
            .map(|p| p.parse().map(Part::Num).unwrap_or(Part::Text(p)))
            .collect()
    }
}

impl PartialEq for DistroVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts() == other.parts()
    }
}

impl Eq for DistroVersion {}

impl Hash for DistroVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts().hash(state);
    }
}

impl Ord for DistroVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts().cmp(&other.parts())
    }
}

impl PartialOrd for DistroVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DistroVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// KernelDescriptor
// ---------------------------------------------------------------------------

/// Identity key of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelId {
    pub distro: String,
    pub version: DistroVersion,
    pub release: String,
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.distro, self.version, self.release)
    }
}

/// One bootable kernel target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub distro: String,
    pub version: DistroVersion,
    /// Kernel release string (`uname -r`).
    pub release: String,
    pub kernel_path: PathBuf,
    /// `None` marks the entry unusable.
    #[serde(default)]
    pub rootfs_path: Option<PathBuf>,
    /// Build environment image carrying this kernel's headers.
    #[serde(default)]
    pub build_image: Option<String>,
}

impl KernelDescriptor {
    pub fn new(
        distro: impl Into<String>,
        version: impl Into<String>,
        release: impl Into<String>,
        kernel_path: impl Into<PathBuf>,
        rootfs_path: impl Into<PathBuf>,
    ) -> Self {
        KernelDescriptor {
            distro: distro.into(),
            version: DistroVersion::new(version),
            release: release.into(),
            kernel_path: kernel_path.into(),
            rootfs_path: Some(rootfs_path.into()),
            build_image: None,
        }
    }

    pub fn id(&self) -> KernelId {
        KernelId {
            distro: self.distro.clone(),
            version: self.version.clone(),
            release: self.release.clone(),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.rootfs_path.is_some()
    }

    /// String matched by selection patterns: "distro version release".
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.distro, self.version, self.release)
    }

    /// Image used to build artifacts against this kernel.
    ///
    /// Defaults to `kmatrix_<distro>_<version>` with dots replaced, e.g.
    /// `kmatrix_ubuntu_18__04`.
    pub fn build_image(&self) -> String {
        self.build_image.clone().unwrap_or_else(|| {
            format!(
                "kmatrix_{}_{}",
                self.distro.to_lowercase(),
                self.version.as_str().replace('.', "__")
            )
        })
    }

    /// Kernel headers location inside the build image.
    pub fn headers_path(&self) -> String {
        format!("/lib/modules/{}/build", self.release)
    }

    pub fn target_ref(&self) -> TargetRef {
        TargetRef {
            distro: self.distro.clone(),
            version: self.version.to_string(),
            release: self.release.clone(),
        }
    }
}

impl fmt::Display for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

// ---------------------------------------------------------------------------
// KernelCatalog
// ---------------------------------------------------------------------------

/// Where a catalog is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    /// Must exist; absence is a configuration error.
    Required(PathBuf),
    /// Skipped when the file does not exist.
    Optional(PathBuf),
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    kernels: Vec<KernelDescriptor>,
}

/// Ordered set of kernel targets, at most one per identity key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelCatalog {
    kernels: Vec<KernelDescriptor>,
}

impl KernelCatalog {
    /// Build a catalog; later duplicates of an identity key are dropped.
    pub fn new(kernels: Vec<KernelDescriptor>) -> Self {
        let mut catalog = KernelCatalog::default();
        catalog.merge(kernels);
        catalog
    }

    /// Parse one TOML catalog document.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(document)?;
        Ok(Self::new(file.kernels))
    }

    /// Load and merge `sources` in order. First-seen identity wins.
    pub fn load(sources: &[CatalogSource]) -> Result<Self> {
        let mut catalog = KernelCatalog::default();

        for source in sources {
            let (path, required) = match source {
                CatalogSource::Required(p) => (p, true),
                CatalogSource::Optional(p) => (p, false),
            };

            if !path.exists() {
                if required {
                    return Err(KmatrixError::Config(format!(
                        "kernel catalog {} does not exist",
                        path.display()
                    )));
                }
                debug!(path = %path.display(), "optional kernel catalog absent");
                continue;
            }

            let document = std::fs::read_to_string(path).map_err(|e| {
                KmatrixError::Config(format!("cannot read {}: {}", path.display(), e))
            })?;
            let file: CatalogFile = toml::from_str(&document).map_err(|e| {
                KmatrixError::Config(format!("malformed kernel catalog {}: {}", path.display(), e))
            })?;

            let offered = file.kernels.len();
            let added = catalog.merge(file.kernels);
            info!(
                path = %path.display(),
                offered,
                added,
                "kernel catalog loaded"
            );
        }

        Ok(catalog)
    }

    /// Append entries whose identity key is not yet present. Returns how many
    /// were added.
    pub fn merge(&mut self, kernels: Vec<KernelDescriptor>) -> usize {
        let mut seen: HashSet<KernelId> = self.kernels.iter().map(|k| k.id()).collect();
        let before = self.kernels.len();
        for kernel in kernels {
            if seen.insert(kernel.id()) {
                self.kernels.push(kernel);
            }
        }
        self.kernels.len() - before
    }

    /// Replace or clear every missing rootfs, checking presence on disk.
    pub fn resolve_fallbacks(&mut self) -> FallbackReport {
        fallback::resolve(&mut self.kernels, |p: &Path| p.exists())
    }

    /// [`KernelCatalog::resolve_fallbacks`] with an injected presence check.
    pub fn resolve_fallbacks_with<F>(&mut self, exists: F) -> FallbackReport
    where
        F: Fn(&Path) -> bool,
    {
        fallback::resolve(&mut self.kernels, exists)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.iter()
    }

    /// Entries with a rootfs, in catalog order.
    pub fn usable(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.iter().filter(|k| k.is_usable())
    }

    pub fn get(&self, id: &KernelId) -> Option<&KernelDescriptor> {
        self.kernels.iter().find(|k| &k.id() == id)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}
