//! Image file discovery.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Extensions recognised as images (lower case, without the dot).
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp"];

/// Whether `path` has an image extension (case-insensitive).
#[must_use]
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

// Directories starting with `_` hold diagnostics (samples, raw predictions).
fn is_hidden_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_str().is_some_and(|n| n.starts_with('_'))
}

fn walk_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_hidden_dir(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(DirEntry::into_path)
}

fn walk(root: &Path) -> impl Iterator<Item = PathBuf> {
    walk_files(root).filter(|p| is_image(p))
}

/// Every file below `root` whose extension is `ext` (case-insensitive),
/// recursively and sorted.
#[must_use]
pub fn list_with_extension(root: &Path, ext: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walk_files(root)
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(ext))
        })
        .collect();
    files.sort();
    files
}

/// Every image below `root`, recursively and sorted. Symlinked images are
/// included; a missing root yields nothing.
#[must_use]
pub fn list_images(root: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = walk(root).collect();
    images.sort();
    images
}

/// Number of images below `root`.
#[must_use]
pub fn count_images(root: &Path) -> usize {
    walk(root).count()
}

/// Whether at least one image exists below `root`.
#[must_use]
pub fn has_images(root: &Path) -> bool {
    walk(root).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_list_images_recursive_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("s2")).unwrap();
        fs::create_dir_all(root.join("s1")).unwrap();
        fs::create_dir_all(root.join("_samples/tissue")).unwrap();
        for p in ["s2/b.PNG", "s1/a.jpg", "s1/notes.txt", "_samples/tissue/001_a.jpg"] {
            fs::write(root.join(p), "x").unwrap();
        }

        let images = list_images(root);
        assert_eq!(images, vec![root.join("s1/a.jpg"), root.join("s2/b.PNG")]);
        assert_eq!(count_images(root), 2);
        assert!(has_images(root));
    }

    #[test]
    fn test_list_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("s1")).unwrap();
        for p in ["s1/b.f32", "s1/a.F32", "index.json"] {
            fs::write(dir.path().join(p), "x").unwrap();
        }
        assert_eq!(
            list_with_extension(dir.path(), "f32"),
            vec![dir.path().join("s1/a.F32"), dir.path().join("s1/b.f32")]
        );
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(list_images(&missing).is_empty());
        assert!(!has_images(&missing));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_images_listed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.png"), "x").unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.png"), out.join("link.png")).unwrap();

        assert_eq!(list_images(&out), vec![out.join("link.png")]);
    }
}
