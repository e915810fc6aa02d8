use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::PlatformError;

/// Extracts `archive_path` (a `.tar.gz`) into `dest`, rejecting any member
/// whose path is absolute or contains a `..` segment before a single byte is
/// written — the defense against symlink/`..` escape attacks named in the
/// upload protocol.
pub fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<(), PlatformError> {
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path.is_absolute() || path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(PlatformError::Validation(format!(
                "archive member escapes staging root: {}",
                path.display()
            )));
        }
        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Packs `src` (a published package tree) into a fresh `.tar.gz` at
/// `archive_path`, used by the download protocol's begin phase.
pub fn create_tar_gz(src: &Path, archive_path: &Path) -> Result<(), PlatformError> {
    let file = File::create(archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", src)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Locates the single `manifest.json` at the root of a staged extraction.
/// Ambiguous (more than one) or missing manifests both fail the upload.
pub fn find_manifest(staging_root: &Path) -> Result<PathBuf, PlatformError> {
    let direct = staging_root.join("manifest.json");
    if direct.is_file() {
        return Ok(direct);
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(staging_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let candidate = entry.path().join("manifest.json");
            if candidate.is_file() {
                found.push(candidate);
            }
        }
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(PlatformError::Validation("manifest.json not found in upload".into())),
        _ => Err(PlatformError::Validation("ambiguous manifest.json in upload".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extracts_well_formed_archive() {
        let dir = std::env::temp_dir().join(format!("arcadehost-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let archive = dir.join("in.tar.gz");
        make_archive(&archive, &[("manifest.json", b"{}")]);
        let dest = dir.join("out");
        std::fs::create_dir_all(&dest).unwrap();
        extract_tar_gz(&archive, &dest).unwrap();
        assert!(dest.join("manifest.json").is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_path_traversal_member() {
        let dir = std::env::temp_dir().join(format!("arcadehost-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let archive = dir.join("evil.tar.gz");
        make_archive(&archive, &[("../escape.txt", b"pwned")]);
        let dest = dir.join("out");
        std::fs::create_dir_all(&dest).unwrap();
        let err = extract_tar_gz(&archive, &dest).unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn finds_manifest_one_level_deep() {
        let dir = std::env::temp_dir().join(format!("arcadehost-test-{}", uuid::Uuid::new_v4()));
        let nested = dir.join("payload");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("manifest.json"), b"{}").unwrap();
        let found = find_manifest(&dir).unwrap();
        assert_eq!(found, nested.join("manifest.json"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
