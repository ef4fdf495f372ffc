//! Rootfs fallback resolution.
//!
//! An entry whose rootfs image is missing borrows the image of the nearest
//! strictly older version of the same distro that has one. Presence is
//! sampled once before any entry is rewritten, so a substituted path never
//! becomes a donor for another entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{DistroVersion, KernelDescriptor, KernelId};

/// What resolution changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackReport {
    /// Entries that received another entry's rootfs, with the path used.
    pub substituted: Vec<(KernelId, PathBuf)>,
    /// Entries left without a rootfs.
    pub unusable: Vec<KernelId>,
}

impl FallbackReport {
    pub fn is_clean(&self) -> bool {
        self.substituted.is_empty() && self.unusable.is_empty()
    }
}

/// Donor images for one distro, sorted by descending version. Entries of
/// equal version keep catalog order.
struct DistroIndex<'a> {
    donors: Vec<(&'a DistroVersion, &'a Path)>,
}

impl<'a> DistroIndex<'a> {
    /// Closest donor whose version is strictly lower than `version`.
    fn closest_below(&self, version: &DistroVersion) -> Option<&'a Path> {
        self.donors
            .iter()
            .find(|(v, _)| *v < version)
            .map(|(_, path)| *path)
    }
}

pub(super) fn resolve<F>(kernels: &mut [KernelDescriptor], exists: F) -> FallbackReport
where
    F: Fn(&Path) -> bool,
{
    let present: Vec<bool> = kernels
        .iter()
        .map(|k| k.rootfs_path.as_deref().is_some_and(&exists))
        .collect();

    let substitutions: Vec<(usize, Option<PathBuf>)> = {
        let mut index: HashMap<&str, DistroIndex<'_>> = HashMap::new();
        for (kernel, _) in kernels.iter().zip(&present).filter(|(_, p)| **p) {
            if let Some(rootfs) = kernel.rootfs_path.as_deref() {
                index
                    .entry(kernel.distro.as_str())
                    .or_insert_with(|| DistroIndex { donors: Vec::new() })
                    .donors
                    .push((&kernel.version, rootfs));
            }
        }
        for distro in index.values_mut() {
            // stable: equal versions stay in catalog order
            distro.donors.sort_by(|a, b| b.0.cmp(a.0));
        }

        kernels
            .iter()
            .enumerate()
            .filter(|(i, _)| !present[*i])
            .map(|(i, kernel)| {
                let donor = index
                    .get(kernel.distro.as_str())
                    .and_then(|d| d.closest_below(&kernel.version))
                    .map(Path::to_path_buf);
                (i, donor)
            })
            .collect()
    };

    let mut report = FallbackReport::default();
    for (i, donor) in substitutions {
        let kernel = &mut kernels[i];
        match donor {
            Some(path) => {
                info!(
                    kernel = %kernel.describe(),
                    fallback = %path.display(),
                    "rootfs missing, using fallback"
                );
                kernel.rootfs_path = Some(path.clone());
                report.substituted.push((kernel.id(), path));
            }
            None => {
                warn!(
                    kernel = %kernel.describe(),
                    "rootfs missing and no fallback found, kernel unusable"
                );
                kernel.rootfs_path = None;
                report.unusable.push(kernel.id());
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::super::KernelCatalog;
    use super::*;

    fn k(distro: &str, version: &str, release: &str) -> KernelDescriptor {
        KernelDescriptor::new(
            distro,
            version,
            release,
            format!("/k/{distro}-{release}"),
            format!("/r/{distro}-{version}.img"),
        )
    }

    fn present(paths: &[&str]) -> impl Fn(&Path) -> bool {
        let set: HashSet<PathBuf> = paths.iter().map(PathBuf::from).collect();
        move |p: &Path| set.contains(p)
    }

    #[test]
    fn test_nearest_lower_version_is_substituted() {
        let mut catalog = KernelCatalog::new(vec![
            k("A", "3", "a3"),
            k("A", "2", "a2"),
            k("A", "1", "a1"),
            k("B", "1", "b1"),
        ]);

        let report =
            catalog.resolve_fallbacks_with(present(&["/r/A-2.img", "/r/A-1.img"]));

        let entries: Vec<_> = catalog.iter().collect();
        assert_eq!(entries[0].rootfs_path, Some(PathBuf::from("/r/A-2.img")));
        assert_eq!(entries[1].rootfs_path, Some(PathBuf::from("/r/A-2.img")));
        assert_eq!(entries[2].rootfs_path, Some(PathBuf::from("/r/A-1.img")));
        assert_eq!(entries[3].rootfs_path, None);

        assert_eq!(report.substituted.len(), 1);
        assert_eq!(report.unusable, vec![entries[3].id()]);
        assert_eq!(catalog.usable().count(), 3);
    }

    #[test]
    fn test_equal_version_is_not_a_donor() {
        let mut a = k("Ubuntu", "18.04", "4.15.0-20");
        a.rootfs_path = Some(PathBuf::from("/r/missing.img"));
        let b = k("Ubuntu", "18.04", "4.15.0-29");
        let mut catalog = KernelCatalog::new(vec![a, b]);

        catalog.resolve_fallbacks_with(present(&["/r/Ubuntu-18.04.img"]));

        let first = catalog.iter().next().unwrap();
        assert!(!first.is_usable());
    }

    #[test]
    fn test_zero_padded_version_is_not_a_lower_donor() {
        let mut padded = k("Ubuntu", "18.04", "4.15.0-20");
        padded.rootfs_path = Some(PathBuf::from("/r/missing.img"));
        let catalog_entries = vec![padded, k("Ubuntu", "18.4", "4.15.0-29")];
        let mut catalog = KernelCatalog::new(catalog_entries);

        let report = catalog.resolve_fallbacks_with(present(&["/r/Ubuntu-18.4.img"]));

        assert!(report.substituted.is_empty());
        assert_eq!(report.unusable.len(), 1);
        assert!(!catalog.iter().next().unwrap().is_usable());
    }

    #[test]
    fn test_versions_compare_numerically_not_lexically() {
        let mut catalog = KernelCatalog::new(vec![
            k("Debian", "10", "4.19"),
            k("Debian", "9", "4.9"),
            k("Debian", "8", "3.16"),
        ]);

        catalog.resolve_fallbacks_with(present(&["/r/Debian-9.img", "/r/Debian-8.img"]));

        let first = catalog.iter().next().unwrap();
        assert_eq!(first.rootfs_path, Some(PathBuf::from("/r/Debian-9.img")));
    }

    #[test]
    fn test_substituted_paths_are_not_donors() {
        let mut catalog = KernelCatalog::new(vec![
            k("A", "3", "a3"),
            k("A", "2", "a2"),
            k("A", "1", "a1"),
        ]);

        // only A@1 is present; A@2 borrows it, A@3 must also find A@1 directly
        catalog.resolve_fallbacks_with(present(&["/r/A-1.img"]));

        for kernel in catalog.iter() {
            assert_eq!(kernel.rootfs_path, Some(PathBuf::from("/r/A-1.img")));
        }
    }

    #[test]
    fn test_satisfied_catalog_is_untouched() {
        let original = KernelCatalog::new(vec![k("A", "1", "a1"), k("B", "2", "b2")]);
        let mut catalog = original.clone();

        let report = catalog.resolve_fallbacks_with(|_: &Path| true);

        assert!(report.is_clean());
        assert_eq!(catalog, original);
    }

    #[test]
    fn test_distros_do_not_cross() {
        let mut catalog = KernelCatalog::new(vec![k("A", "5", "a5"), k("B", "1", "b1")]);

        catalog.resolve_fallbacks_with(present(&["/r/B-1.img"]));

        assert!(!catalog.iter().next().unwrap().is_usable());
    }
}
