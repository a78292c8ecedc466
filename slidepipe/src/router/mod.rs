//! Artifact router.
//!
//! Every stage that materializes a classification outcome goes through
//! [`ArtifactRouter::place`], which exposes a source file at a destination
//! path using the cheapest strategy that works:
//!
//! | requested  | attempt order                                          |
//! |------------|--------------------------------------------------------|
//! | `symlink`  | symlink, hardlink (cross-device sources only), copy    |
//! | `hardlink` | hardlink, symlink, copy                                |
//! | `copy`     | copy                                                   |
//! | `none`     | nothing                                                |
//!
//! The strategy that took effect is returned so callers can report it.

use crate::config::RouterConfig;
use crate::core::LinkStrategy;
use crate::errors::RouterError;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Filesystem primitives used by the router.
///
/// Exists so tests can force individual strategies to fail.
pub trait LinkOps: Send + Sync + fmt::Debug {
    /// Creates a symbolic link at `dst` pointing to `src`.
    fn symlink(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Creates a hard link at `dst` to `src`.
    fn hard_link(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Copies the bytes of `src` to `dst`.
    fn copy(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Removes the file or symlink at `path`.
    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// [`LinkOps`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdLinkOps;

impl LinkOps for StdLinkOps {
    #[cfg(unix)]
    fn symlink(&self, src: &Path, dst: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(src, dst)
    }

    #[cfg(windows)]
    fn symlink(&self, src: &Path, dst: &Path) -> io::Result<()> {
        std::os::windows::fs::symlink_file(src, dst)
    }

    #[cfg(not(any(unix, windows)))]
    fn symlink(&self, _src: &Path, _dst: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks unsupported"))
    }

    fn hard_link(&self, src: &Path, dst: &Path) -> io::Result<()> {
        fs::hard_link(src, dst)
    }

    fn copy(&self, src: &Path, dst: &Path) -> io::Result<()> {
        fs::copy(src, dst).map(|_| ())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Places files according to a [`LinkStrategy`] with a fixed fallback ladder.
#[derive(Debug, Clone)]
pub struct ArtifactRouter {
    ops: Arc<dyn LinkOps>,
    cross_device_prefixes: Vec<PathBuf>,
}

impl Default for ArtifactRouter {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

impl ArtifactRouter {
    /// Creates a router over the real filesystem.
    #[must_use]
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            ops: Arc::new(StdLinkOps),
            cross_device_prefixes: config.cross_device_prefixes.clone(),
        }
    }

    /// Replaces the filesystem primitives.
    #[must_use]
    pub fn with_ops(mut self, ops: Arc<dyn LinkOps>) -> Self {
        self.ops = ops;
        self
    }

    /// Replaces the cross-device prefixes.
    #[must_use]
    pub fn with_cross_device_prefixes(mut self, prefixes: Vec<PathBuf>) -> Self {
        self.cross_device_prefixes = prefixes;
        self
    }

    /// Whether `src` lives under a known cross-device mount point.
    ///
    /// Only a hint: it decides whether a hardlink is worth trying after a
    /// failed symlink.
    #[must_use]
    pub fn looks_cross_device(&self, src: &Path) -> bool {
        self.cross_device_prefixes.iter().any(|p| src.starts_with(p))
    }

    /// Strategies attempted, in order, for `requested`.
    #[must_use]
    pub fn ladder(&self, requested: LinkStrategy, src: &Path) -> Vec<LinkStrategy> {
        match requested {
            LinkStrategy::Symlink if self.looks_cross_device(src) => vec![
                LinkStrategy::Symlink,
                LinkStrategy::Hardlink,
                LinkStrategy::Copy,
            ],
            LinkStrategy::Symlink => vec![LinkStrategy::Symlink, LinkStrategy::Copy],
            LinkStrategy::Hardlink => vec![
                LinkStrategy::Hardlink,
                LinkStrategy::Symlink,
                LinkStrategy::Copy,
            ],
            LinkStrategy::Copy => vec![LinkStrategy::Copy],
            LinkStrategy::None => Vec::new(),
        }
    }

    /// Materializes `dst` from `src` and returns the strategy that took effect.
    ///
    /// `none` is a no-op and leaves `dst` untouched. Otherwise any existing
    /// file or symlink at `dst` is removed first and parent directories are
    /// created. Fails when every rung of the ladder failed, or at once when a
    /// stale destination cannot be removed.
    pub fn place(&self, src: &Path, dst: &Path, requested: LinkStrategy) -> Result<LinkStrategy, RouterError> {
        if !requested.places() {
            return Ok(LinkStrategy::None);
        }

        let src = absolute(src);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| RouterError::new(&src, dst, e))?;
        }
        self.clear_destination(dst).map_err(|e| RouterError::new(&src, dst, e))?;

        let mut last_error = None;
        for strategy in self.ladder(requested, &src) {
            match self.attempt(strategy, &src, dst) {
                Ok(()) => return Ok(strategy),
                Err(e) => {
                    debug!(
                        src = %src.display(),
                        dst = %dst.display(),
                        strategy = %strategy,
                        error = %e,
                        "placement failed, falling back"
                    );
                    if let Err(clear) = self.clear_destination(dst) {
                        warn!(dst = %dst.display(), error = %clear, "cannot clear partial placement");
                        return Err(RouterError::new(&src, dst, clear));
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(RouterError::new(
            &src,
            dst,
            last_error.unwrap_or_else(|| io::Error::other("empty fallback ladder")),
        ))
    }

    /// Removes a file or symlink left at `dst`; a missing one is fine and
    /// directories are left alone.
    fn clear_destination(&self, dst: &Path) -> io::Result<()> {
        match fs::symlink_metadata(dst) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => match self.ops.remove_file(dst) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn attempt(&self, strategy: LinkStrategy, src: &Path, dst: &Path) -> io::Result<()> {
        match strategy {
            LinkStrategy::Symlink => self.ops.symlink(src, dst),
            LinkStrategy::Hardlink => self.ops.hard_link(src, dst),
            LinkStrategy::Copy => self.ops.copy(src, dst),
            LinkStrategy::None => Ok(()),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Real filesystem, but selected primitives always fail.
    #[derive(Debug, Default)]
    struct FlakyOps {
        fail_symlink: bool,
        fail_hard_link: bool,
        fail_copy: bool,
        fail_remove: bool,
    }

    fn denied() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "denied")
    }

    impl LinkOps for FlakyOps {
        fn symlink(&self, src: &Path, dst: &Path) -> io::Result<()> {
            if self.fail_symlink {
                return Err(denied());
            }
            StdLinkOps.symlink(src, dst)
        }

        fn hard_link(&self, src: &Path, dst: &Path) -> io::Result<()> {
            if self.fail_hard_link {
                return Err(denied());
            }
            StdLinkOps.hard_link(src, dst)
        }

        fn copy(&self, src: &Path, dst: &Path) -> io::Result<()> {
            if self.fail_copy {
                return Err(denied());
            }
            StdLinkOps.copy(src, dst)
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            if self.fail_remove {
                return Err(denied());
            }
            StdLinkOps.remove_file(path)
        }
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tiles").join("a.jpg");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"tile-bytes").unwrap();
        (dir, src)
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_same_filesystem() {
        let (dir, src) = fixture();
        let dst = dir.path().join("out").join("tissue").join("a.jpg");

        let used = ArtifactRouter::default().place(&src, &dst, LinkStrategy::Symlink).unwrap();

        assert_eq!(used, LinkStrategy::Symlink);
        assert!(fs::symlink_metadata(&dst).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&dst).unwrap(), fs::canonicalize(&src).unwrap());
    }

    #[test]
    fn test_failed_symlink_falls_back_to_copy() {
        let (dir, src) = fixture();
        let dst = dir.path().join("out").join("a.jpg");
        let router = ArtifactRouter::default().with_ops(Arc::new(FlakyOps {
            fail_symlink: true,
            ..FlakyOps::default()
        }));

        let used = router.place(&src, &dst, LinkStrategy::Symlink).unwrap();

        assert_eq!(used, LinkStrategy::Copy);
        assert_eq!(fs::read(&dst).unwrap(), b"tile-bytes");
    }

    #[test]
    fn test_failed_symlink_cross_device_tries_hardlink() {
        let (dir, src) = fixture();
        let dst = dir.path().join("out").join("a.jpg");
        let router = ArtifactRouter::default()
            .with_ops(Arc::new(FlakyOps {
                fail_symlink: true,
                ..FlakyOps::default()
            }))
            .with_cross_device_prefixes(vec![fs::canonicalize(dir.path()).unwrap()]);

        let used = router.place(&src, &dst, LinkStrategy::Symlink).unwrap();

        assert_eq!(used, LinkStrategy::Hardlink);
        assert_eq!(fs::read(&dst).unwrap(), b"tile-bytes");
    }

    #[test]
    fn test_hardlink_request() {
        let (dir, src) = fixture();
        let dst = dir.path().join("out").join("a.jpg");

        let used = ArtifactRouter::default().place(&src, &dst, LinkStrategy::Hardlink).unwrap();

        assert_eq!(used, LinkStrategy::Hardlink);
        assert_eq!(fs::read(&dst).unwrap(), b"tile-bytes");
    }

    #[test]
    fn test_none_leaves_destination_absent() {
        let (dir, src) = fixture();
        let dst = dir.path().join("out").join("a.jpg");

        let used = ArtifactRouter::default().place(&src, &dst, LinkStrategy::None).unwrap();

        assert_eq!(used, LinkStrategy::None);
        assert!(fs::symlink_metadata(&dst).is_err());
        assert!(!dst.parent().unwrap().exists());
    }

    #[test]
    fn test_existing_destination_replaced() {
        let (dir, src) = fixture();
        let dst = dir.path().join("a_copy.jpg");
        fs::write(&dst, b"stale").unwrap();

        ArtifactRouter::default().place(&src, &dst, LinkStrategy::Copy).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"tile-bytes");
    }

    #[test]
    fn test_exhausted_ladder_is_router_error() {
        let (dir, src) = fixture();
        let dst = dir.path().join("out").join("a.jpg");
        let router = ArtifactRouter::default().with_ops(Arc::new(FlakyOps {
            fail_symlink: true,
            fail_hard_link: true,
            fail_copy: true,
            fail_remove: false,
        }));

        let err = router.place(&src, &dst, LinkStrategy::Hardlink).unwrap_err();

        assert_eq!(err.dst, dst);
        assert_eq!(err.source.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_stale_destination_removal_error_surfaces() {
        let (dir, src) = fixture();
        let dst = dir.path().join("a_copy.jpg");
        fs::write(&dst, b"stale").unwrap();
        let router = ArtifactRouter::default().with_ops(Arc::new(FlakyOps {
            fail_remove: true,
            ..FlakyOps::default()
        }));

        let err = router.place(&src, &dst, LinkStrategy::Copy).unwrap_err();

        assert_eq!(err.source.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(fs::read(&dst).unwrap(), b"stale");
    }

    #[test]
    fn test_ladder_order() {
        let router = ArtifactRouter::default();
        let local = Path::new("/data/tiles/a.jpg");
        let mounted = Path::new("/mnt/slides/a.jpg");

        assert_eq!(
            router.ladder(LinkStrategy::Symlink, local),
            vec![LinkStrategy::Symlink, LinkStrategy::Copy]
        );
        assert_eq!(
            router.ladder(LinkStrategy::Symlink, mounted),
            vec![LinkStrategy::Symlink, LinkStrategy::Hardlink, LinkStrategy::Copy]
        );
        assert_eq!(router.ladder(LinkStrategy::Copy, local), vec![LinkStrategy::Copy]);
        assert!(router.ladder(LinkStrategy::None, local).is_empty());
    }
}
