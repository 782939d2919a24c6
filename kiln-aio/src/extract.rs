// kiln-aio/src/extract.rs
// Archive extraction with top-level directory stripping.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_common::error::{KilnError, Result};
use tar::Archive;
use tracing::{debug, error};
use xz2::read::XzDecoder;
use zip::read::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    TarXz,
    TarBz2,
    Zip,
}

impl ArchiveKind {
    /// From the file name first, then by sniffing the magic bytes.
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_lowercase();
        let by_name = [
            (".tar.gz", ArchiveKind::TarGz),
            (".tgz", ArchiveKind::TarGz),
            (".tar.xz", ArchiveKind::TarXz),
            (".txz", ArchiveKind::TarXz),
            (".tar.bz2", ArchiveKind::TarBz2),
            (".tbz", ArchiveKind::TarBz2),
            (".tbz2", ArchiveKind::TarBz2),
            (".zip", ArchiveKind::Zip),
            (".tar", ArchiveKind::Tar),
        ];
        if let Some((_, kind)) = by_name.iter().find(|(ext, _)| name.ends_with(ext)) {
            return Ok(*kind);
        }

        let sniffed = infer::get_from_path(path)?;
        let kind = match sniffed.map(|t| t.mime_type()) {
            Some("application/gzip") => ArchiveKind::TarGz,
            Some("application/x-xz") => ArchiveKind::TarXz,
            Some("application/x-bzip2") => ArchiveKind::TarBz2,
            Some("application/zip") => ArchiveKind::Zip,
            Some("application/x-tar") => ArchiveKind::Tar,
            other => {
                return Err(KilnError::Generic(format!(
                    "Unsupported archive type for {} (detected: {})",
                    path.display(),
                    other.unwrap_or("unknown")
                )))
            }
        };
        debug!("Sniffed archive type {:?} for {}", kind, path.display());
        Ok(kind)
    }
}

/// Extracts `archive_path` into `target_dir`. A single top-level directory shared by every
/// entry is stripped; archives with several top-level entries are extracted as they are.
/// Returns the name of the stripped directory, if any.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<Option<PathBuf>> {
    let kind = ArchiveKind::detect(archive_path)?;
    let root = infer_archive_root_dir(archive_path, kind)?;
    let strip_components = usize::from(root.is_some());
    debug!(
        "Extracting archive '{}' ({:?}) to '{}' (strip_components={})",
        archive_path.display(),
        kind,
        target_dir.display(),
        strip_components
    );

    fs::create_dir_all(target_dir)?;
    let file = File::open(archive_path)?;
    match kind {
        ArchiveKind::Zip => extract_zip_archive(file, target_dir, strip_components, archive_path)?,
        ArchiveKind::TarGz => extract_tar_archive(
            GzDecoder::new(file),
            target_dir,
            strip_components,
            archive_path,
        )?,
        ArchiveKind::TarXz => extract_tar_archive(
            XzDecoder::new(file),
            target_dir,
            strip_components,
            archive_path,
        )?,
        ArchiveKind::TarBz2 => extract_tar_archive(
            BzDecoder::new(file),
            target_dir,
            strip_components,
            archive_path,
        )?,
        ArchiveKind::Tar => extract_tar_archive(file, target_dir, strip_components, archive_path)?,
    }
    Ok(root)
}

/// Runs `extract_archive` on the blocking pool.
pub async fn extract_archive_async(
    archive_path: &Path,
    target_dir: &Path,
) -> Result<Option<PathBuf>> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive(&archive_path, &target_dir))
        .await
        .map_err(|e| KilnError::Generic(format!("JoinError in archive extraction: {e}")))?
}

fn open_decoded(archive_path: &Path, kind: ArchiveKind) -> Result<Box<dyn Read>> {
    let file = File::open(archive_path)?;
    Ok(match kind {
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveKind::TarXz => Box::new(XzDecoder::new(file)),
        ArchiveKind::TarBz2 => Box::new(BzDecoder::new(file)),
        ArchiveKind::Tar | ArchiveKind::Zip => Box::new(file),
    })
}

fn infer_archive_root_dir(archive_path: &Path, kind: ArchiveKind) -> Result<Option<PathBuf>> {
    let paths: Vec<PathBuf> = match kind {
        ArchiveKind::Zip => {
            let mut archive = ZipArchive::new(File::open(archive_path)?).map_err(|e| {
                KilnError::Generic(format!("Failed to open ZIP {}: {}", archive_path.display(), e))
            })?;
            let mut names = Vec::with_capacity(archive.len());
            for i in 0..archive.len() {
                let entry = archive.by_index_raw(i).map_err(|e| {
                    KilnError::Generic(format!(
                        "Error reading ZIP index {} in {}: {}",
                        i,
                        archive_path.display(),
                        e
                    ))
                })?;
                names.push(PathBuf::from(entry.name()));
            }
            names
        }
        _ => {
            let mut archive = Archive::new(open_decoded(archive_path, kind)?);
            let mut names = Vec::new();
            for entry in archive.entries()? {
                let entry = entry.map_err(|e| tar_error(archive_path, e))?;
                names.push(entry.path().map_err(|e| tar_error(archive_path, e))?.into_owned());
            }
            names
        }
    };
    Ok(single_root(&paths, archive_path))
}

/// The one top-level directory containing every entry, if there is one.
fn single_root(paths: &[PathBuf], archive_path_for_log: &Path) -> Option<PathBuf> {
    let mut roots = HashSet::new();
    let mut has_nested_entry = false;
    for path in paths {
        let mut components = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir));
        match components.next() {
            Some(Component::Normal(name)) => {
                roots.insert(PathBuf::from(name));
                if components.next().is_some() {
                    has_nested_entry = true;
                }
            }
            Some(_) => return None,
            None => continue,
        }
        if roots.len() > 1 {
            debug!(
                "Multiple top-level items found in {}, not stripping.",
                archive_path_for_log.display()
            );
            return None;
        }
    }
    // A lone top-level regular file is not a directory to strip.
    if has_nested_entry {
        roots.into_iter().next()
    } else {
        None
    }
}

fn tar_error(archive_path: &Path, e: io::Error) -> KilnError {
    KilnError::Generic(format!(
        "Error reading TAR entry from {}: {}",
        archive_path.display(),
        e
    ))
}

/// Maps an archive path onto `target_dir`, refusing anything that would escape it.
fn stripped_target(
    original: &Path,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<Option<PathBuf>> {
    let stripped: Vec<Component<'_>> = original
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .skip(strip_components)
        .collect();
    if stripped.is_empty() {
        return Ok(None);
    }
    let mut out = target_dir.to_path_buf();
    for comp in stripped {
        match comp {
            Component::Normal(p) => out.push(p),
            _ => {
                error!(
                    "Disallowed component {:?} in path {} within {}",
                    comp,
                    original.display(),
                    archive_path_for_log.display()
                );
                return Err(KilnError::Generic(format!(
                    "Unsafe path component in {} within {}",
                    original.display(),
                    archive_path_for_log.display()
                )));
            }
        }
    }
    Ok(Some(out))
}

fn extract_tar_archive<R: Read>(
    reader: R,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry.map_err(|e| tar_error(archive_path_for_log, e))?;
        let original = entry
            .path()
            .map_err(|e| tar_error(archive_path_for_log, e))?
            .into_owned();
        let Some(dest) =
            stripped_target(&original, target_dir, strip_components, archive_path_for_log)?
        else {
            continue;
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        // Hard link targets are archive paths; re-root them the same way.
        if entry.header().entry_type() == tar::EntryType::Link {
            if let Ok(Some(link_name)) = entry.link_name() {
                if let Some(src) = stripped_target(
                    &link_name,
                    target_dir,
                    strip_components,
                    archive_path_for_log,
                )? {
                    fs::hard_link(&src, &dest).or_else(|_| fs::copy(&src, &dest).map(|_| ()))?;
                    continue;
                }
            }
        }
        entry.unpack(&dest).map_err(|e| {
            KilnError::Generic(format!(
                "Failed to unpack {} from {}: {}",
                original.display(),
                archive_path_for_log.display(),
                e
            ))
        })?;
    }
    Ok(())
}

fn extract_zip_archive<R: Read + Seek>(
    reader: R,
    target_dir: &Path,
    strip_components: usize,
    archive_path_for_log: &Path,
) -> Result<()> {
    let mut archive = ZipArchive::new(reader).map_err(|e| {
        KilnError::Generic(format!(
            "Failed to open ZIP {}: {}",
            archive_path_for_log.display(),
            e
        ))
    })?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(|e| {
            KilnError::Generic(format!("Failed to access ZIP entry: {e}"))
        })?;
        let Some(enclosed) = file.enclosed_name() else {
            return Err(KilnError::Generic(format!(
                "Unsafe ZIP entry path '{}' in {}",
                file.name(),
                archive_path_for_log.display()
            )));
        };
        let Some(dest) =
            stripped_target(&enclosed, target_dir, strip_components, archive_path_for_log)?
        else {
            continue;
        };
        if file.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&dest)?;
        io::copy(&mut file, &mut outfile)?;
        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar_gz(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn single_top_level_directory_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("xz-5.8.1.tar.gz");
        write_tar_gz(
            &archive,
            &[("xz-5.8.1/README", "readme"), ("xz-5.8.1/src/main.c", "int main;")],
        );
        let out = dir.path().join("out");
        let root = extract_archive(&archive, &out).unwrap();
        assert_eq!(root, Some(PathBuf::from("xz-5.8.1")));
        assert_eq!(fs::read_to_string(out.join("src/main.c")).unwrap(), "int main;");
    }

    #[test]
    fn multiple_top_level_entries_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("flat.tar.gz");
        write_tar_gz(&archive, &[("a/one", "1"), ("b/two", "2")]);
        let out = dir.path().join("out");
        assert_eq!(extract_archive(&archive, &out).unwrap(), None);
        assert!(out.join("a/one").is_file());
        assert!(out.join("b/two").is_file());
    }

    #[test]
    fn type_is_sniffed_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("download");
        write_tar_gz(&archive, &[("pkg/file", "x")]);
        assert_eq!(ArchiveKind::detect(&archive).unwrap(), ArchiveKind::TarGz);
    }

    #[test]
    fn parent_components_are_rejected() {
        let err = stripped_target(
            Path::new("pkg/../../etc/passwd"),
            Path::new("/tmp/out"),
            1,
            Path::new("evil.tar"),
        );
        assert!(err.is_err());
    }
}
