//! `.kdeps` package extraction and private file helpers.
//!
//! # Responsibilities
//! - Unpack a tar+gzip package over a workflow directory
//! - Reject absolute paths and parent traversal before touching disk
//! - Cap every extracted file (decompression bombs)
//!
//! # Design Decisions
//! - Entries are extracted in archive order and overwrite in place; a
//!   failure mid-way leaves earlier entries written
//! - Only directories and regular files are materialized; links and
//!   special entries are skipped
//! - Directories are created 0750, files 0600

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Error type for package extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("invalid package: not a valid gzip archive: {0}")]
    NotGzip(String),
    #[error("failed to read archive entry: {0}")]
    Entry(#[source] io::Error),
    #[error("invalid path in package: {0}")]
    InvalidPath(String),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to create parent directory for {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to extract {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Summary of a finished extraction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
}

/// Normalize an archive entry name to a relative path.
///
/// `None` for absolute names or names escaping the root; `Some("")` for
/// names that normalize to the root itself.
pub fn clean_entry_path(name: &str) -> Option<PathBuf> {
    if name.starts_with('/') || name.starts_with('\\') {
        return None;
    }
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

/// Extract a tar+gzip package into `dest`, capping each file at `max_file_bytes`.
pub fn extract_package(
    data: &[u8],
    dest: &Path,
    max_file_bytes: u64,
) -> Result<ExtractSummary, ExtractError> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Err(ExtractError::NotGzip("missing gzip header".into()));
    }

    let mut archive = Archive::new(GzDecoder::new(data));
    let mut summary = ExtractSummary::default();

    for entry in archive.entries().map_err(ExtractError::Entry)? {
        let mut entry = entry.map_err(ExtractError::Entry)?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let rel = clean_entry_path(&name).ok_or_else(|| ExtractError::InvalidPath(name.clone()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&rel);
        let shown = rel.display().to_string();

        match entry.header().entry_type() {
            EntryType::Directory => {
                create_private_dir(&target).map_err(|source| ExtractError::CreateDir {
                    path: shown,
                    source,
                })?;
                summary.directories += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    create_private_dir(parent).map_err(|source| ExtractError::CreateParent {
                        path: shown.clone(),
                        source,
                    })?;
                }
                let mut file = open_private(&target).map_err(|source| ExtractError::Write {
                    path: shown.clone(),
                    source,
                })?;
                let written = io::copy(&mut (&mut entry).take(max_file_bytes), &mut file)
                    .map_err(|source| ExtractError::Write {
                        path: shown.clone(),
                        source,
                    })?;
                if written == max_file_bytes && entry.header().size().unwrap_or(0) > max_file_bytes {
                    tracing::warn!(path = %shown, max = max_file_bytes, "Package file truncated at size limit");
                }
                summary.files += 1;
            }
            other => {
                tracing::debug!(path = %shown, entry_type = ?other, "Skipping non-regular package entry");
            }
        }
    }

    Ok(summary)
}

/// `create_dir_all` with mode 0750 on Unix.
pub fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o750);
    }
    builder.create(path)
}

fn open_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Create or truncate `path` (mode 0600) with `contents`.
pub fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;
    let mut file = open_private(path)?;
    file.write_all(contents)
}

/// Remove every `*.yaml`/`*.yml` file directly inside `dir`.
///
/// A missing directory and individual removal failures are ignored.
pub fn clear_resources_dir(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}
