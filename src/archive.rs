//! Archive unpacking and in-tree symlink resolution.
//!
//! `archive` repositories are tarballs (gzip detected by magic bytes),
//! `zip` repositories are zip files. After extraction the `special`
//! pragma may require rewriting symlinks: partial resolution keeps
//! confined relative links and replaces the rest with their targets,
//! complete resolution replaces every link. Any link whose target
//! escapes the extracted tree is an error in both modes.

use std::{
    fs,
    io::Cursor,
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use walkdir::WalkDir;

use crate::{config::pragmas::PragmaSpecial, errors::SetupError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpack archive bytes into `dest` according to the repository type
/// string (`archive` or `zip`).
pub fn unpack(repo_type: &str, data: &[u8], dest: &Path) -> Result<(), SetupError> {
    fs::create_dir_all(dest)?;
    match repo_type {
        "zip" => unpack_zip(data, dest),
        _ => unpack_tar(data, dest),
    }
}

fn unpack_tar(data: &[u8], dest: &Path) -> Result<(), SetupError> {
    if data.starts_with(&GZIP_MAGIC) {
        tar::Archive::new(GzDecoder::new(data))
            .unpack(dest)
            .map_err(|e| SetupError::Archive(format!("tar+gz: {e}")))
    } else {
        tar::Archive::new(data)
            .unpack(dest)
            .map_err(|e| SetupError::Archive(format!("tar: {e}")))
    }
}

fn unpack_zip(data: &[u8], dest: &Path) -> Result<(), SetupError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| SetupError::Archive(format!("zip: {e}")))?;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| SetupError::Archive(format!("zip entry: {e}")))?;
        let Some(rel_path) = entry.enclosed_name() else {
            return Err(SetupError::Archive(format!(
                "zip entry {:?} escapes the extraction root",
                entry.name()
            )));
        };
        let target = dest.join(rel_path);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Rewrite symlinks under `root` according to the `special` pragma.
/// `Ignore` is handled at import time and is a no-op here.
pub fn resolve_special(root: &Path, special: PragmaSpecial) -> Result<(), SetupError> {
    resolve_special_aliased(root, root, special)
}

/// Like [`resolve_special`], but for a working copy of a tree that
/// originally lived at `alias_root`: absolute link targets inside the
/// original tree are remapped into the copy before the escape check.
pub fn resolve_special_aliased(
    root: &Path,
    alias_root: &Path,
    special: PragmaSpecial,
) -> Result<(), SetupError> {
    match special {
        PragmaSpecial::Ignore => Ok(()),
        PragmaSpecial::ResolvePartially => resolve_links(root, alias_root, false),
        PragmaSpecial::ResolveCompletely => resolve_links(root, alias_root, true),
    }
}

// Copies introduced by one pass may contain further links, so passes repeat
// until a fixed point; the pass bound turns link loops into errors.
fn resolve_links(root: &Path, alias_root: &Path, complete: bool) -> Result<(), SetupError> {
    for _pass in 0..64 {
        let mut acted = false;
        let links: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.path_is_symlink())
            .map(|entry| entry.into_path())
            .collect();
        for link in links {
            let target = fs::read_link(&link)?;
            if !complete && is_confined_relative(&target) {
                continue;
            }
            let base = link.parent().expect("link inside root has a parent");
            let mut resolved = if target.is_absolute() {
                normalize_lexically(&target)?
            } else {
                normalize_lexically(&base.join(&target))?
            };
            if let Ok(relative) = resolved.strip_prefix(alias_root) {
                resolved = root.join(relative);
            }
            if !resolved.starts_with(root) {
                return Err(SetupError::Archive(format!(
                    "symlink {link:?} -> {target:?} escapes the tree"
                )));
            }
            if !resolved.exists() && fs::symlink_metadata(&resolved).is_err() {
                return Err(SetupError::Archive(format!(
                    "symlink {link:?} -> {target:?} is dangling"
                )));
            }
            fs::remove_file(&link)?;
            copy_path(&resolved, &link)?;
            acted = true;
        }
        if !acted {
            return Ok(());
        }
    }
    Err(SetupError::Archive(
        "symlink resolution did not reach a fixed point (link loop?)".to_string(),
    ))
}

/// A relative path without any `..` component stays inside the tree.
fn is_confined_relative(target: &Path) -> bool {
    target.is_relative()
        && !target
            .components()
            .any(|component| matches!(component, Component::ParentDir))
}

/// Lexical normalization; `..` past the root is an error.
fn normalize_lexically(path: &Path) -> Result<PathBuf, SetupError> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(SetupError::Archive(format!(
                        "path {path:?} escapes through `..`"
                    )));
                }
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

fn copy_path(from: &Path, to: &Path) -> Result<(), SetupError> {
    let meta = fs::symlink_metadata(from)?;
    if meta.file_type().is_symlink() {
        // copy the link itself; a later pass resolves it in place
        let target = fs::read_link(from)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, to)?;
        #[cfg(not(unix))]
        return Err(SetupError::Archive(format!(
            "cannot copy symlink {from:?} on this platform"
        )));
    } else if meta.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_path(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        fs::copy(from, to)?;
    }
    Ok(())
}

/// Copy a directory tree (links preserved) into `to`; used when a local
/// path needs symlink resolution without mutating the source.
pub fn copy_tree(from: &Path, to: &Path) -> Result<(), SetupError> {
    copy_path(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_unpack_tar_gz() {
        let data = make_tar_gz(&[("dir/a.txt", "alpha"), ("b.txt", "beta")]);
        let dest = tempfile::tempdir().unwrap();
        unpack("archive", &data, dest.path()).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("dir/a.txt")).unwrap(), "alpha");
        assert_eq!(fs::read_to_string(dest.path().join("b.txt")).unwrap(), "beta");
    }

    #[test]
    fn test_unpack_zip() {
        use std::io::Write;

        use zip::write::SimpleFileOptions;

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("inner/file.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"zipped").unwrap();
        let data = writer.finish().unwrap().into_inner();

        let dest = tempfile::tempdir().unwrap();
        unpack("zip", &data, dest.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dest.path().join("inner/file.txt")).unwrap(),
            "zipped"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_partially_keeps_confined_links() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/real.txt"), "real").unwrap();
        symlink("sub/real.txt", root.join("confined")).unwrap();
        fs::write(root.join("other.txt"), "other").unwrap();
        symlink(root.join("other.txt"), root.join("absolute")).unwrap();

        resolve_special(&root, PragmaSpecial::ResolvePartially).unwrap();
        // confined relative link kept
        assert!(fs::symlink_metadata(root.join("confined")).unwrap().file_type().is_symlink());
        // absolute link replaced by contents
        let meta = fs::symlink_metadata(root.join("absolute")).unwrap();
        assert!(meta.file_type().is_file());
        assert_eq!(fs::read_to_string(root.join("absolute")).unwrap(), "other");
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_completely_resolves_all() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("real.txt"), "real").unwrap();
        symlink("real.txt", root.join("first")).unwrap();
        symlink("first", root.join("second")).unwrap();

        resolve_special(&root, PragmaSpecial::ResolveCompletely).unwrap();
        for name in ["first", "second"] {
            let meta = fs::symlink_metadata(root.join(name)).unwrap();
            assert!(meta.file_type().is_file(), "{name} still a link");
            assert_eq!(fs::read_to_string(root.join(name)).unwrap(), "real");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_escaping_link_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        fs::write(dir.path().join("outside.txt"), "secret").unwrap();
        symlink("../outside.txt", root.join("escape")).unwrap();

        let err = resolve_special(&root, PragmaSpecial::ResolveCompletely).unwrap_err();
        assert!(matches!(err, SetupError::Archive(_)));
    }
}
