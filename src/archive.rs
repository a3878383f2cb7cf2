//! Backup archives of the gateway's state and workspace
//!
//! Exports are gzip-compressed tarballs. Imports are validated in full before
//! anything touches the disk: absolute paths, `..` components and link
//! entries reject the whole archive.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The upload is not an acceptable backup
    #[error("invalid archive: {0}")]
    Invalid(String),
    /// Reading or writing the filesystem failed
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a successful import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub entries: usize,
}

/// Path a directory gets inside the archive: relative to `root` when it lives
/// below it, otherwise its final component
fn archive_name(root: &Path, dir: &Path) -> PathBuf {
    let resolve = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    let (root, dir_abs) = (resolve(root), resolve(dir));

    match dir_abs.strip_prefix(&root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => dir_abs
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data")),
    }
}

/// Pack `dirs` into a gzip tarball. Missing directories are skipped.
pub fn export_dirs(root: &Path, dirs: &[&Path]) -> Result<Vec<u8>, ArchiveError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    for dir in dirs {
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "Skipping missing directory in export");
            continue;
        }
        let name = archive_name(root, dir);
        debug!(dir = %dir.display(), name = %name.display(), "Adding directory to export");
        builder.append_dir_all(&name, dir)?;
    }

    let encoder = builder.into_inner()?;
    let bytes = encoder.finish()?;
    info!(bytes = bytes.len(), "Backup archive created");
    Ok(bytes)
}

/// Reject anything that could land outside the destination
pub fn validate_entry_path(path: &Path) -> Result<(), ArchiveError> {
    if path.as_os_str().is_empty() {
        return Err(ArchiveError::Invalid("empty entry path".to_string()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(ArchiveError::Invalid(format!(
                    "entry '{}' contains '..'",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::Invalid(format!(
                    "entry '{}' is absolute",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

fn validate_entry_type(path: &Path, entry_type: EntryType) -> Result<(), ArchiveError> {
    match entry_type {
        EntryType::Regular | EntryType::Continuous | EntryType::Directory => Ok(()),
        EntryType::Symlink | EntryType::Link => Err(ArchiveError::Invalid(format!(
            "entry '{}' is a link",
            path.display()
        ))),
        other => Err(ArchiveError::Invalid(format!(
            "entry '{}' has unsupported type {:?}",
            path.display(),
            other
        ))),
    }
}

fn open(data: &[u8]) -> Archive<impl Read + '_> {
    Archive::new(GzDecoder::new(data))
}

/// Check every entry without writing anything. Returns the entry count.
pub fn validate_archive(data: &[u8]) -> Result<usize, ArchiveError> {
    let mut archive = open(data);
    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::Invalid(e.to_string()))?;

    let mut count = 0;
    for entry in entries {
        let entry = entry.map_err(|e| ArchiveError::Invalid(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| ArchiveError::Invalid(e.to_string()))?
            .into_owned();
        validate_entry_path(&path)?;
        validate_entry_type(&path, entry.header().entry_type())?;
        count += 1;
    }

    if count == 0 {
        return Err(ArchiveError::Invalid("archive is empty".to_string()));
    }
    Ok(count)
}

/// Restore a gzip tarball into `dest` after validating all of it
pub fn import_archive(data: &[u8], dest: &Path) -> Result<ImportSummary, ArchiveError> {
    let count = validate_archive(data)?;
    std::fs::create_dir_all(dest)?;

    let mut archive = open(data);
    archive.set_preserve_permissions(false);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.unpack_in(dest)? {
            return Err(ArchiveError::Invalid(format!(
                "entry '{}' escapes the destination",
                entry.path()?.display()
            )));
        }
    }

    info!(entries = count, dest = %dest.display(), "Backup archive restored");
    Ok(ImportSummary { entries: count })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tarball<F>(build: F) -> Vec<u8>
    where
        F: FnOnce(&mut Builder<GzEncoder<Vec<u8>>>),
    {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        build(&mut builder);
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn file_header(size: usize) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_size(size as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header
    }

    /// Write a raw name into the header, bypassing the builder's own checks
    fn raw_entry(path: &str, data: &[u8], entry_type: EntryType) -> Vec<u8> {
        tarball(|builder| {
            let mut header = file_header(data.len());
            header.set_entry_type(entry_type);
            let name = &mut header.as_old_mut().name;
            name[..path.len()].copy_from_slice(path.as_bytes());
            header.set_cksum();
            builder.append(&header, data).unwrap();
        })
    }

    #[test]
    fn test_export_and_import_restore_layout() {
        let root = tempfile::tempdir().unwrap();
        let state = root.path().join("state");
        let workspace = root.path().join("workspace");
        std::fs::create_dir_all(state.join("nested")).unwrap();
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(state.join("gateway.json"), "{}").unwrap();
        std::fs::write(state.join("nested/creds"), "secret").unwrap();
        std::fs::write(workspace.join("notes.md"), "# notes").unwrap();

        let data = export_dirs(root.path(), &[&state, &workspace]).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let summary = import_archive(&data, dest.path()).unwrap();
        assert!(summary.entries >= 5);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("state/gateway.json")).unwrap(),
            "{}"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("state/nested/creds")).unwrap(),
            "secret"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("workspace/notes.md")).unwrap(),
            "# notes"
        );
    }

    #[test]
    fn test_export_skips_missing_dirs() {
        let root = tempfile::tempdir().unwrap();
        let present = root.path().join("state");
        std::fs::create_dir_all(&present).unwrap();
        std::fs::write(present.join("a"), "1").unwrap();
        let missing = root.path().join("missing");

        let data = export_dirs(root.path(), &[&present, &missing]).unwrap();
        assert!(validate_archive(&data).unwrap() >= 2);
    }

    #[test]
    fn test_archive_name_outside_root_uses_last_component() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let dir = other.path().join("workspace");
        std::fs::create_dir_all(&dir).unwrap();

        assert_eq!(archive_name(root.path(), &dir), PathBuf::from("workspace"));
        assert_eq!(
            archive_name(other.path(), &dir.join("sub")),
            PathBuf::from("workspace/sub")
        );
    }

    #[test]
    fn test_validate_entry_path() {
        assert!(validate_entry_path(Path::new("state/gateway.json")).is_ok());
        assert!(validate_entry_path(Path::new("./state")).is_ok());
        assert!(validate_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(validate_entry_path(Path::new("state/../../escape")).is_err());
        assert!(validate_entry_path(Path::new("")).is_err());
    }

    #[test]
    fn test_import_rejects_parent_components() {
        let data = raw_entry("../escape.txt", b"x", EntryType::Regular);
        let dest = tempfile::tempdir().unwrap();

        let err = import_archive(&data, dest.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Invalid(_)));
        assert!(!dest.path().join("../escape.txt").exists());
    }

    #[test]
    fn test_import_rejects_absolute_paths() {
        let data = raw_entry("/tmp/gatewrap-absolute", b"x", EntryType::Regular);
        let dest = tempfile::tempdir().unwrap();

        assert!(matches!(
            import_archive(&data, dest.path()),
            Err(ArchiveError::Invalid(_))
        ));
    }

    #[test]
    fn test_import_rejects_links_before_writing() {
        let data = tarball(|builder| {
            let header = file_header(2);
            builder.append_data(&mut header.clone(), "ok.txt", &b"ok"[..]).unwrap();

            let mut link = tar::Header::new_gnu();
            link.set_entry_type(EntryType::Symlink);
            link.set_size(0);
            builder.append_link(&mut link, "evil", "/etc/passwd").unwrap();
        });
        let dest = tempfile::tempdir().unwrap();

        let err = import_archive(&data, dest.path()).unwrap_err();
        assert!(err.to_string().contains("is a link"));
        // Validation runs before unpacking
        assert!(!dest.path().join("ok.txt").exists());
    }

    #[test]
    fn test_import_rejects_garbage() {
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            import_archive(b"definitely not gzip", dest.path()),
            Err(ArchiveError::Invalid(_))
        ));
    }
}
