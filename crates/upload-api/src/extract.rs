//! Archive extraction with path-escape protection.
//!
//! Every entry name is cleaned and resolved against the target directory
//! before anything touches the filesystem. An entry that would land outside
//! the target aborts extraction; entries already written are left in place.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};

/// Archive formats accepted for bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Zip archive, read through its central directory.
    Zip,
    /// Uncompressed tar stream.
    Tar,
    /// Gzip-compressed tar stream (`.tar.gz` or `.tgz`).
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from the file name suffix, ignoring case.
    #[must_use]
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

/// Extract a bundle on the blocking thread pool.
pub async fn extract_bundle_blocking(bundle: &Path, out_dir: &Path) -> DeployResult<()> {
    let bundle = bundle.to_owned();
    let out_dir = out_dir.to_owned();
    spawn_blocking(move || extract_bundle(&bundle, &out_dir))
        .await
        .map_err(|e| DeployError::Internal(format!("extraction task failed: {e}")))?
}

/// Extract a bundle into `out_dir`, dispatching on its suffix.
pub fn extract_bundle(bundle: &Path, out_dir: &Path) -> DeployResult<()> {
    let format = ArchiveFormat::detect(bundle).ok_or(DeployError::UnsupportedArchive)?;
    debug!(bundle = %bundle.display(), ?format, "extracting bundle");

    match format {
        ArchiveFormat::Zip => extract_zip(bundle, out_dir),
        ArchiveFormat::Tar => extract_tar(BufReader::new(open(bundle)?), out_dir),
        ArchiveFormat::TarGz => {
            extract_tar(GzDecoder::new(BufReader::new(open(bundle)?)), out_dir)
        }
    }
}

fn open(path: &Path) -> DeployResult<File> {
    File::open(path).map_err(|e| DeployError::io("failed to open bundle", e))
}

fn extract_zip(bundle: &Path, out_dir: &Path) -> DeployResult<()> {
    let mut archive = zip::ZipArchive::new(open(bundle)?)
        .map_err(|e| DeployError::Archive(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| DeployError::Archive(e.to_string()))?;
        let name = entry.name().to_owned();
        let target = safe_join(out_dir, &name)?;

        if entry.is_dir() {
            create_dir(&target)?;
            continue;
        }
        if entry.unix_mode().is_some_and(is_symlink_mode) {
            warn!(entry = %name, "skipping symlink archive entry");
            continue;
        }
        write_entry(&target, &mut entry)?;
    }
    Ok(())
}

const fn is_symlink_mode(mode: u32) -> bool {
    mode & 0o170_000 == 0o120_000
}

fn extract_tar<R: Read>(reader: R, out_dir: &Path) -> DeployResult<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| DeployError::Archive(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| DeployError::Archive(e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| DeployError::Archive(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let target = safe_join(out_dir, &name)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => create_dir(&target)?,
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                write_entry(&target, &mut entry)?;
            }
            other => {
                warn!(entry = %name, kind = ?other, "skipping non-regular archive entry");
            }
        }
    }
    Ok(())
}

fn create_dir(path: &Path) -> DeployResult<()> {
    fs::create_dir_all(path).map_err(|e| DeployError::Archive(e.to_string()))
}

fn write_entry(target: &Path, reader: &mut impl Read) -> DeployResult<()> {
    if let Some(parent) = target.parent() {
        create_dir(parent)?;
    }
    let mut out = File::create(target).map_err(|e| DeployError::Archive(e.to_string()))?;
    io::copy(reader, &mut out).map_err(|e| DeployError::Archive(e.to_string()))?;
    Ok(())
}

/// Resolve an archive entry name to a path inside `base`.
///
/// The name is cleaned lexically first. Names that climb out of the archive
/// root (`..` or `../…`) are rejected, as is anything whose absolute form is
/// neither `base` itself nor a descendant of it. Absolute names are
/// re-rooted under `base`.
pub fn safe_join(base: &Path, name: &str) -> DeployResult<PathBuf> {
    let cleaned = clean(Path::new(name));
    if cleaned.components().next() == Some(Component::ParentDir) {
        return Err(DeployError::InvalidArchivePath {
            entry: name.to_owned(),
        });
    }

    let relative: PathBuf = cleaned
        .components()
        .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir))
        .collect();
    let target = base.join(&relative);

    let base_abs = absolute(base)?;
    let target_abs = absolute(&target)?;
    if target_abs != base_abs && !target_abs.starts_with(&base_abs) {
        return Err(DeployError::ArchiveEscape {
            entry: name.to_owned(),
        });
    }
    Ok(target)
}

fn absolute(path: &Path) -> DeployResult<PathBuf> {
    std::path::absolute(path)
        .map(|p| clean(&p))
        .map_err(|e| DeployError::io("failed to resolve path", e))
}

/// Lexically normalise a path: drop `.` segments and resolve `..` against
/// preceding normal segments. Leading `..` segments of a relative path are
/// kept; `..` directly under a root is discarded.
fn clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            match data {
                Some(data) => {
                    writer
                        .start_file(*name, SimpleFileOptions::default())
                        .unwrap();
                    writer.write_all(data).unwrap();
                }
                None => writer
                    .add_directory(*name, SimpleFileOptions::default())
                    .unwrap(),
            }
        }
        writer.finish().unwrap();
    }

    fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_old();
            header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn detect_formats() {
        assert_eq!(ArchiveFormat::detect(Path::new("a.ZIP")), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar")), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar.gz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("/x/a.Tgz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("a.7z")), None);
    }

    #[test]
    fn clean_normalises_segments() {
        assert_eq!(clean(Path::new("a/./b//c")), PathBuf::from("a/b/c"));
        assert_eq!(clean(Path::new("a/../b")), PathBuf::from("b"));
        assert_eq!(clean(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(clean(Path::new("/../etc")), PathBuf::from("/etc"));
        assert_eq!(clean(Path::new("./")), PathBuf::new());
    }

    #[test]
    fn safe_join_accepts_nested_paths() {
        let dir = TempDir::new().unwrap();
        let target = safe_join(dir.path(), "src/main.rs").unwrap();
        assert_eq!(target, dir.path().join("src/main.rs"));

        let target = safe_join(dir.path(), "src/../README.md").unwrap();
        assert_eq!(target, dir.path().join("README.md"));

        assert_eq!(safe_join(dir.path(), "./").unwrap(), dir.path());
    }

    #[test]
    fn safe_join_reroots_absolute_names() {
        let dir = TempDir::new().unwrap();
        let target = safe_join(dir.path(), "/etc/passwd").unwrap();
        assert_eq!(target, dir.path().join("etc/passwd"));
    }

    #[test]
    fn safe_join_rejects_parent_escapes() {
        let dir = TempDir::new().unwrap();
        for name in ["..", "../evil.txt", "../../evil.txt", "a/../../evil.txt", "./../x"] {
            let err = safe_join(dir.path(), name).unwrap_err();
            assert!(
                matches!(err, DeployError::InvalidArchivePath { .. }),
                "{name} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn safe_join_rejects_sibling_prefix() {
        let parent = TempDir::new().unwrap();
        let base = parent.path().join("src");
        fs::create_dir(&base).unwrap();

        // `src-evil` shares a string prefix with `src` but is not inside it.
        assert!(safe_join(&base, "../src-evil/x").is_err());
    }

    #[test]
    fn extracts_zip_with_directories() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("app.zip");
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        write_zip(
            &bundle,
            &[
                ("assets/", None),
                ("main.go", Some(b"package main")),
                ("pkg/util/util.go", Some(b"package util")),
            ],
        );

        extract_bundle(&bundle, &out).unwrap();

        assert!(out.join("assets").is_dir());
        assert_eq!(fs::read_to_string(out.join("main.go")).unwrap(), "package main");
        assert_eq!(
            fs::read_to_string(out.join("pkg/util/util.go")).unwrap(),
            "package util"
        );
    }

    #[test]
    fn zip_symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("links.zip");
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let mut writer = zip::ZipWriter::new(File::create(&bundle).unwrap());
        writer
            .add_symlink("passwd", "/etc/passwd", SimpleFileOptions::default())
            .unwrap();
        writer
            .start_file("main.go", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"package main").unwrap();
        writer.finish().unwrap();

        extract_bundle(&bundle, &out).unwrap();

        assert!(fs::symlink_metadata(out.join("passwd")).is_err());
        assert_eq!(fs::read_to_string(out.join("main.go")).unwrap(), "package main");
    }

    #[test]
    fn zip_escape_is_rejected_without_writing_outside() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("evil.zip");
        let out = dir.path().join("a/b/out");
        fs::create_dir_all(&out).unwrap();
        write_zip(&bundle, &[("../../evil.txt", Some(b"pwned"))]);

        let err = extract_bundle(&bundle, &out).unwrap_err();

        assert!(matches!(err, DeployError::InvalidArchivePath { .. }));
        assert!(!dir.path().join("a/evil.txt").exists());
    }

    #[test]
    fn extracts_plain_tar() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("app.tar");
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(&bundle, tar_bytes(&[("app.py", b"print('hi')"), ("lib/x.py", b"x = 1")])).unwrap();

        extract_bundle(&bundle, &out).unwrap();

        assert_eq!(fs::read_to_string(out.join("app.py")).unwrap(), "print('hi')");
        assert_eq!(fs::read_to_string(out.join("lib/x.py")).unwrap(), "x = 1");
    }

    #[test]
    fn extracts_gzipped_tar() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("app.tgz");
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&tar_bytes(&[("server.js", b"console.log(1)")]))
            .unwrap();
        fs::write(&bundle, encoder.finish().unwrap()).unwrap();

        extract_bundle(&bundle, &out).unwrap();

        assert_eq!(
            fs::read_to_string(out.join("server.js")).unwrap(),
            "console.log(1)"
        );
    }

    #[test]
    fn tar_escape_stops_extraction() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("evil.tar");
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(
            &bundle,
            tar_bytes(&[("../escape.txt", b"bad"), ("after.txt", b"never")]),
        )
        .unwrap();

        let err = extract_bundle(&bundle, &out).unwrap_err();

        assert!(matches!(err, DeployError::InvalidArchivePath { .. }));
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!out.join("after.txt").exists());
    }

    #[test]
    fn corrupt_gzip_is_an_archive_error() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("broken.tar.gz");
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        fs::write(&bundle, b"definitely not gzip").unwrap();

        let err = extract_bundle(&bundle, &out).unwrap_err();
        assert!(matches!(err, DeployError::Archive(_)));
    }

    #[test]
    fn unknown_suffix_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("app.rar");
        fs::write(&bundle, b"rar").unwrap();

        let err = extract_bundle(&bundle, dir.path()).unwrap_err();
        assert!(matches!(err, DeployError::UnsupportedArchive));
    }
}
