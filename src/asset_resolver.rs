//! Asset Resolver Module
//!
//! Locates referenced image files across an ordered list of storage roots
//! (local drives first, then e.g. a network mount). Resolution is read-only
//! and idempotent; the caller decides what to do about a miss.

use std::path::{Path, PathBuf};

/// An image reference together with the concrete location it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    /// The path as written in the source document.
    pub raw: String,
    /// The existing file the reference resolved to.
    pub location: PathBuf,
}

/// Prioritized resource-location strategy: candidates are tried in order and
/// the first existing file wins.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    roots: Vec<PathBuf>,
}

impl AssetResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        AssetResolver { roots }
    }

    /// Resolves a raw source path to an existing file, or `None` when no
    /// candidate exists. Filesystem access is limited to existence checks;
    /// a slow network root simply slows this call down.
    pub fn resolve(&self, raw: &str) -> Option<ResolvedAsset> {
        self.candidates(raw).into_iter().find(|c| c.is_file()).map(|location| ResolvedAsset {
            raw: raw.to_string(),
            location,
        })
    }

    /// Number of locations `resolve` will try for a given path. Used for
    /// warning messages.
    pub fn candidate_count(&self, raw: &str) -> usize {
        self.candidates(raw).len()
    }

    /// The literal path first; then, if the path starts with one of the
    /// configured roots, the same relative path re-rooted under every other
    /// root, in configuration order.
    fn candidates(&self, raw: &str) -> Vec<PathBuf> {
        let literal = PathBuf::from(raw);
        let mut out = vec![literal.clone()];

        if let Some(rel) = self.relative_part(&literal) {
            for root in &self.roots {
                let candidate = root.join(rel);
                if !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
        }
        out
    }

    /// Strips the first configured root that prefixes the path.
    fn relative_part<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        self.roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn literal_path_wins_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        let network = dir.path().join("network");
        let photo = local.join("trip/photo1.jpg");
        touch(&photo);

        let resolver = AssetResolver::new(vec![local.clone(), network]);
        let resolved = resolver.resolve(photo.to_str().unwrap()).unwrap();
        assert_eq!(resolved.location, photo);
    }

    #[test]
    fn falls_back_to_later_roots_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        let network = dir.path().join("network");
        touch(&network.join("trip/photo1.jpg"));
        fs::create_dir_all(&local).unwrap();

        let resolver = AssetResolver::new(vec![local.clone(), network.clone()]);
        // Referenced under the local root, only present on the network root.
        let raw = local.join("trip/photo1.jpg");
        let resolved = resolver.resolve(raw.to_str().unwrap()).unwrap();
        assert_eq!(resolved.location, network.join("trip/photo1.jpg"));
        assert_eq!(resolved.raw, raw.to_str().unwrap());
    }

    #[test]
    fn missing_everywhere_is_a_miss_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        fs::create_dir_all(&local).unwrap();
        let resolver = AssetResolver::new(vec![local.clone()]);

        let raw = local.join("nope.jpg");
        assert!(resolver.resolve(raw.to_str().unwrap()).is_none());
        // The re-rooted candidate collapses into the literal one.
        assert_eq!(resolver.candidate_count(raw.to_str().unwrap()), 1);
    }

    #[test]
    fn paths_outside_all_roots_are_only_tried_literally() {
        let resolver = AssetResolver::new(vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")]);
        assert_eq!(resolver.candidate_count("/elsewhere/x.jpg"), 1);
    }
}
