//! Lookup from request paths to share resources.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use super::{build_entry, ShareConfig, ShareEntry, ShareError, ShareKind, ShareResult};

/// Why a request path could not be mapped to a local resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    /// No share covers the path, or the resource does not exist.
    NotFound,
    /// The client is not on the share's allow list, or the path escapes the
    /// share root.
    Forbidden,
}

/// A request path mapped onto a share. The local path has not been touched on
/// disk yet; [`Resolution::confine`] does that.
#[derive(Debug, Clone)]
pub struct Resolution<'a> {
    pub entry: &'a ShareEntry,
    /// Lexically joined local path (share root plus remaining segments).
    pub local_path: PathBuf,
}

impl Resolution<'_> {
    /// Canonicalize the local path and make sure it still lives under the
    /// share root. Symlinks pointing outside the root are forbidden.
    ///
    /// Returns the path that must be opened; callers never re-derive it.
    pub async fn confine(&self) -> Result<PathBuf, ResolveError> {
        let canonical = tokio::fs::canonicalize(&self.local_path)
            .await
            .map_err(|_| ResolveError::NotFound)?;

        if is_within(&canonical, &self.entry.local_path) {
            Ok(canonical)
        } else {
            Err(ResolveError::Forbidden)
        }
    }
}

fn is_within(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

/// Immutable map of public paths to shares.
#[derive(Debug, Clone, Default)]
pub struct ShareRegistry {
    /// Sorted by descending depth so the first prefix match is the longest.
    entries: Vec<ShareEntry>,
}

impl ShareRegistry {
    /// Validate every configured share and build the registry.
    pub fn from_configs(configs: &[ShareConfig]) -> ShareResult<Self> {
        if configs.is_empty() {
            return Err(ShareError::Empty);
        }

        let mut entries: Vec<ShareEntry> = Vec::with_capacity(configs.len());
        for config in configs {
            let entry = build_entry(config)?;
            if entries.iter().any(|e| e.public_path == entry.public_path) {
                return Err(ShareError::DuplicatePublicPath(config.public_path.clone()));
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| b.depth().cmp(&a.depth()));

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ShareEntry> {
        self.entries.iter()
    }

    /// Find the share with the longest public path covering `segments`.
    pub fn lookup(&self, segments: &[String]) -> Option<(&ShareEntry, usize)> {
        self.entries.iter().find_map(|entry| {
            let prefix = entry.segments();
            let matches = prefix.len() <= segments.len()
                && prefix
                    .iter()
                    .zip(segments)
                    .all(|(key, seg)| *key == seg.to_lowercase());
            matches.then_some((entry, prefix.len()))
        })
    }

    /// Map decoded request path segments to a share resource for `client`.
    ///
    /// Segments come from the request parser and are already free of `.`,
    /// `..` and separators; this is checked again here so the registry never
    /// relies on its caller for confinement.
    pub fn resolve(&self, segments: &[String], client: IpAddr) -> Result<Resolution<'_>, ResolveError> {
        let (entry, consumed) = self.lookup(segments).ok_or(ResolveError::NotFound)?;

        if !entry.permits(client) {
            return Err(ResolveError::Forbidden);
        }

        let rest = &segments[consumed..];
        let local_path = match entry.kind {
            ShareKind::File if rest.is_empty() => entry.local_path.clone(),
            ShareKind::File => return Err(ResolveError::NotFound),
            ShareKind::Directory => {
                let mut path = entry.local_path.clone();
                for segment in rest {
                    if !is_plain_segment(segment) {
                        return Err(ResolveError::Forbidden);
                    }
                    path.push(segment);
                }
                path
            }
        };

        Ok(Resolution { entry, local_path })
    }
}

fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\', '\0'])
        && !Path::new(segment).has_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn segs(path: &str) -> Vec<String> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    fn fixture() -> (TempDir, ShareRegistry) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/readme.txt"), b"read me").unwrap();
        std::fs::write(dir.path().join("single.bin"), b"\x00\x01").unwrap();

        let registry = ShareRegistry::from_configs(&[
            ShareConfig::new("/Docs", dir.path().join("docs")),
            ShareConfig::new("/files/single.bin", dir.path().join("single.bin")),
        ])
        .unwrap();
        (dir, registry)
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(matches!(
            ShareRegistry::from_configs(&[]),
            Err(ShareError::Empty)
        ));
    }

    #[test]
    fn test_duplicate_public_path_rejected() {
        let dir = TempDir::new().unwrap();
        let err = ShareRegistry::from_configs(&[
            ShareConfig::new("/a", dir.path()),
            ShareConfig::new("/A/", dir.path()),
        ])
        .unwrap_err();
        assert!(matches!(err, ShareError::DuplicatePublicPath(_)));
    }

    #[test]
    fn test_lookup_is_case_insensitive_on_share_prefix() {
        let (_dir, registry) = fixture();
        let resolution = registry.resolve(&segs("/DOCS/readme.txt"), CLIENT).unwrap();
        assert!(resolution.local_path.ends_with("docs/readme.txt"));
    }

    #[test]
    fn test_lookup_non_ascii_public_path() {
        let dir = TempDir::new().unwrap();
        let registry =
            ShareRegistry::from_configs(&[ShareConfig::new("/Über", dir.path())]).unwrap();

        for path in ["/Über/hello.txt", "/über/hello.txt", "/ÜBER/hello.txt"] {
            let (entry, consumed) = registry.lookup(&segs(path)).unwrap();
            assert_eq!(entry.public_path, "über");
            assert_eq!(consumed, 1);
        }
        assert!(registry.lookup(&segs("/uber/hello.txt")).is_none());
    }

    #[test]
    fn test_unknown_path_not_found() {
        let (_dir, registry) = fixture();
        assert_eq!(
            registry.resolve(&segs("/nothing/here"), CLIENT).unwrap_err(),
            ResolveError::NotFound
        );
    }

    #[test]
    fn test_file_share_rejects_suffix() {
        let (_dir, registry) = fixture();
        assert!(registry.resolve(&segs("/files/single.bin"), CLIENT).is_ok());
        assert_eq!(
            registry
                .resolve(&segs("/files/single.bin/extra"), CLIENT)
                .unwrap_err(),
            ResolveError::NotFound
        );
    }

    #[test]
    fn test_dot_dot_segment_forbidden() {
        let (_dir, registry) = fixture();
        let segments = vec!["docs".to_string(), "..".to_string(), "single.bin".to_string()];
        assert_eq!(
            registry.resolve(&segments, CLIENT).unwrap_err(),
            ResolveError::Forbidden
        );
    }

    #[test]
    fn test_longest_prefix_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("outer/inner")).unwrap();
        let registry = ShareRegistry::from_configs(&[
            ShareConfig::new("/", dir.path().join("outer")),
            ShareConfig::new("/deep", dir.path().join("outer/inner")),
        ])
        .unwrap();

        let (entry, consumed) = registry.lookup(&segs("/deep/x")).unwrap();
        assert_eq!(entry.public_path, "deep");
        assert_eq!(consumed, 1);

        let (entry, consumed) = registry.lookup(&segs("/other")).unwrap();
        assert_eq!(entry.public_path, "");
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_allow_list_forbids_other_clients() {
        let dir = TempDir::new().unwrap();
        let mut config = ShareConfig::new("/private", dir.path());
        config.allow = vec!["10.0.0.7".to_string()];
        let registry = ShareRegistry::from_configs(&[config]).unwrap();

        assert_eq!(
            registry.resolve(&segs("/private"), CLIENT).unwrap_err(),
            ResolveError::Forbidden
        );
        assert!(registry
            .resolve(&segs("/private"), "10.0.0.7".parse().unwrap())
            .is_ok());
    }

    #[tokio::test]
    async fn test_confine_accepts_regular_file() {
        let (_dir, registry) = fixture();
        let resolution = registry.resolve(&segs("/docs/readme.txt"), CLIENT).unwrap();
        let path = resolution.confine().await.unwrap();
        assert!(path.ends_with("readme.txt"));
    }

    #[tokio::test]
    async fn test_confine_missing_file_not_found() {
        let (_dir, registry) = fixture();
        let resolution = registry.resolve(&segs("/docs/missing.txt"), CLIENT).unwrap();
        assert_eq!(resolution.confine().await.unwrap_err(), ResolveError::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_confine_rejects_symlink_escape() {
        let (dir, registry) = fixture();
        std::os::unix::fs::symlink(
            dir.path().join("single.bin"),
            dir.path().join("docs/escape.bin"),
        )
        .unwrap();

        let resolution = registry.resolve(&segs("/docs/escape.bin"), CLIENT).unwrap();
        assert_eq!(resolution.confine().await.unwrap_err(), ResolveError::Forbidden);
    }
}
