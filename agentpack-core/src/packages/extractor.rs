//! Archive validation, extraction, packing and hashing.
//!
//! Extraction is two-phase. The first phase enumerates every entry without
//! writing anything and checks it against [`SecurityLimits`]: entry count,
//! path traversal, absolute paths, symlinks, per-entry size, total size and
//! compression ratio. Only when the whole archive passes does the second phase
//! create directories and files, always with fixed permissions.
//!
//! Zip is the native format (it is what [`create_archive`] produces);
//! gzip-compressed tar archives are accepted as well.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[cfg(test)]
use mockall::automock;

use super::error::PackageError;

/// Permission bits for every directory created during extraction.
pub const DIR_MODE: u32 = 0o755;

/// Permission bits for every file created during extraction.
pub const FILE_MODE: u32 = 0o644;

// ============================================================================
// Limits and Violations
// ============================================================================

/// Resource limits enforced before any byte is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityLimits {
    /// Maximum sum of declared uncompressed entry sizes.
    pub max_total_uncompressed_bytes: u64,
    /// Maximum number of entries in the archive.
    pub max_entry_count: usize,
    /// Maximum declared uncompressed size of one entry.
    pub max_single_entry_bytes: u64,
    /// Maximum whole-archive uncompressed:compressed ratio.
    pub max_compression_ratio: u64,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_total_uncompressed_bytes: 1024 * 1024 * 1024,
            max_entry_count: 10_000,
            max_single_entry_bytes: 500 * 1024 * 1024,
            max_compression_ratio: 100,
        }
    }
}

/// A structural safety check the archive failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityViolation {
    #[error("archive has {count} entries, exceeding max_entry_count ({limit})")]
    TooManyEntries { count: usize, limit: usize },

    #[error("entry '{entry}' is an absolute path")]
    AbsolutePath { entry: String },

    #[error("entry '{entry}' resolves outside the destination directory")]
    PathTraversal { entry: String },

    #[error("entry '{entry}' is a symbolic link")]
    Symlink { entry: String },

    #[error("entry '{entry}' has unsupported type: {entry_type}")]
    UnsupportedEntry { entry: String, entry_type: String },

    #[error("entry '{entry}' declares {size} bytes, exceeding max_single_entry_bytes ({limit})")]
    EntryTooLarge { entry: String, size: u64, limit: u64 },

    #[error("archive declares at least {total} uncompressed bytes, exceeding max_total_uncompressed_bytes ({limit})")]
    TotalSizeExceeded { total: u64, limit: u64 },

    #[error("archive compression ratio {ratio}:1 exceeds max_compression_ratio ({limit}:1)")]
    CompressionRatio { ratio: u64, limit: u64 },

    #[error("entry '{entry}' contains more data than its declared size")]
    SizeMismatch { entry: String },

    #[error("destination {} is outside the base root {}", dest.display(), root.display())]
    DestinationOutsideRoot { dest: PathBuf, root: PathBuf },

    #[error("malformed archive: {reason}")]
    Malformed { reason: String },
}

fn malformed(reason: impl ToString) -> PackageError {
    PackageError::Security(SecurityViolation::Malformed {
        reason: reason.to_string(),
    })
}

// ============================================================================
// Archive Listing
// ============================================================================

/// Supported archive container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// ZIP archive (.zip)
    Zip,
    /// Gzip-compressed tar archive (.tar.gz, .tgz)
    TarGz,
}

impl ArchiveFormat {
    /// Detects the format from magic bytes, falling back to the file name.
    pub fn detect(path: &Path) -> Result<Self, PackageError> {
        let mut magic = [0u8; 4];
        let read = File::open(path)
            .and_then(|mut f| f.read(&mut magic))
            .map_err(|e| PackageError::io(path, e))?;

        match &magic[..read] {
            [b'P', b'K', 0x03, 0x04] | [b'P', b'K', 0x05, 0x06] => return Ok(Self::Zip),
            [0x1f, 0x8b, ..] => return Ok(Self::TarGz),
            _ => {}
        }

        let lower = path.to_string_lossy().to_lowercase();
        if lower.ends_with(".zip") {
            Ok(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else {
            Err(malformed(format!(
                "unrecognised archive format: {}",
                path.display()
            )))
        }
    }
}

/// One archive entry as declared by the archive, before extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path as declared in the archive.
    pub path: String,
    pub uncompressed_size: u64,
    /// Compressed size; zero for tar entries, which share one compressed stream.
    pub compressed_size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// Result of the validation pre-scan.
#[derive(Debug, Clone)]
pub struct ArchiveScan {
    pub format: ArchiveFormat,
    pub entries: Vec<ArchiveEntry>,
    /// Compressed bytes the ratio check divides by.
    pub compressed_bytes: u64,
    /// Sum of declared uncompressed sizes.
    pub uncompressed_bytes: u64,
}

/// Summary of a completed extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes_written: u64,
}

/// Enumerates and validates every entry without writing anything.
///
/// # Errors
///
/// Returns `PackageError::Security` naming the violated limit or check.
pub fn scan_archive(archive_path: &Path, limits: &SecurityLimits) -> Result<ArchiveScan, PackageError> {
    let format = ArchiveFormat::detect(archive_path)?;
    let (entries, compressed_bytes) = match format {
        ArchiveFormat::Zip => list_zip(archive_path, limits)?,
        ArchiveFormat::TarGz => list_tar_gz(archive_path, limits)?,
    };

    let uncompressed_bytes = validate_entries(&entries, compressed_bytes, limits)?;

    debug!(
        entries = entries.len(),
        uncompressed_bytes, compressed_bytes, "Archive passed validation"
    );

    Ok(ArchiveScan {
        format,
        entries,
        compressed_bytes,
        uncompressed_bytes,
    })
}

fn list_zip(
    archive_path: &Path,
    limits: &SecurityLimits,
) -> Result<(Vec<ArchiveEntry>, u64), PackageError> {
    let file = File::open(archive_path).map_err(|e| PackageError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(malformed)?;

    // Reject before enumerating anything
    if archive.len() > limits.max_entry_count {
        return Err(SecurityViolation::TooManyEntries {
            count: archive.len(),
            limit: limits.max_entry_count,
        }
        .into());
    }

    let mut entries = Vec::with_capacity(archive.len());
    let mut compressed_bytes = 0u64;

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i).map_err(malformed)?;
        let mode = entry.unix_mode().unwrap_or(0) & 0o170000;
        let is_symlink = mode == 0o120000;

        if !is_symlink && mode != 0 && mode != 0o100000 && mode != 0o040000 {
            return Err(SecurityViolation::UnsupportedEntry {
                entry: entry.name().to_string(),
                entry_type: format!("unix mode {:o}", mode),
            }
            .into());
        }

        compressed_bytes = compressed_bytes.saturating_add(entry.compressed_size());
        entries.push(ArchiveEntry {
            path: entry.name().to_string(),
            uncompressed_size: entry.size(),
            compressed_size: entry.compressed_size(),
            is_dir: entry.is_dir(),
            is_symlink,
        });
    }

    Ok((entries, compressed_bytes))
}

fn open_tar_gz(archive_path: &Path) -> Result<tar::Archive<impl Read>, PackageError> {
    let file = File::open(archive_path).map_err(|e| PackageError::io(archive_path, e))?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    Ok(tar::Archive::new(decoder))
}

fn list_tar_gz(
    archive_path: &Path,
    limits: &SecurityLimits,
) -> Result<(Vec<ArchiveEntry>, u64), PackageError> {
    let compressed_bytes = fs::metadata(archive_path)
        .map_err(|e| PackageError::io(archive_path, e))?
        .len();

    let mut archive = open_tar_gz(archive_path)?;
    let mut entries = Vec::new();
    let mut declared_total = 0u64;

    for entry_result in archive.entries().map_err(malformed)? {
        let entry = entry_result.map_err(malformed)?;
        let entry_type = entry.header().entry_type();

        // Global pax headers carry metadata only
        if entry_type == tar::EntryType::XGlobalHeader {
            continue;
        }

        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        // Tar has no central directory, so stop as soon as a limit is crossed
        if entries.len() >= limits.max_entry_count {
            return Err(SecurityViolation::TooManyEntries {
                count: entries.len() + 1,
                limit: limits.max_entry_count,
            }
            .into());
        }
        declared_total = declared_total.saturating_add(entry.size());
        if declared_total > limits.max_total_uncompressed_bytes {
            return Err(SecurityViolation::TotalSizeExceeded {
                total: declared_total,
                limit: limits.max_total_uncompressed_bytes,
            }
            .into());
        }

        let is_symlink = entry_type.is_symlink();
        if !is_symlink && !entry_type.is_file() && !entry_type.is_dir() {
            return Err(SecurityViolation::UnsupportedEntry {
                entry: path,
                entry_type: format!("{:?}", entry_type),
            }
            .into());
        }

        entries.push(ArchiveEntry {
            path,
            uncompressed_size: entry.size(),
            compressed_size: 0,
            is_dir: entry_type.is_dir(),
            is_symlink,
        });
    }

    Ok((entries, compressed_bytes))
}

/// Checks every entry against the limits and returns the declared total size.
fn validate_entries(
    entries: &[ArchiveEntry],
    compressed_bytes: u64,
    limits: &SecurityLimits,
) -> Result<u64, SecurityViolation> {
    if entries.len() > limits.max_entry_count {
        return Err(SecurityViolation::TooManyEntries {
            count: entries.len(),
            limit: limits.max_entry_count,
        });
    }

    let mut total = 0u64;
    for entry in entries {
        sanitize_entry_path(&entry.path)?;

        if entry.is_symlink {
            return Err(SecurityViolation::Symlink {
                entry: entry.path.clone(),
            });
        }

        if entry.uncompressed_size > limits.max_single_entry_bytes {
            return Err(SecurityViolation::EntryTooLarge {
                entry: entry.path.clone(),
                size: entry.uncompressed_size,
                limit: limits.max_single_entry_bytes,
            });
        }

        total = total.saturating_add(entry.uncompressed_size);
        if total > limits.max_total_uncompressed_bytes {
            return Err(SecurityViolation::TotalSizeExceeded {
                total,
                limit: limits.max_total_uncompressed_bytes,
            });
        }
    }

    if total > 0 {
        let exceeded = match compressed_bytes {
            0 => true,
            c => total > c.saturating_mul(limits.max_compression_ratio),
        };
        if exceeded {
            return Err(SecurityViolation::CompressionRatio {
                ratio: total.checked_div(compressed_bytes).unwrap_or(u64::MAX),
                limit: limits.max_compression_ratio,
            });
        }
    }

    Ok(total)
}

/// Resolves a declared entry path to a relative path inside the destination.
///
/// `..` segments are allowed only while they stay inside the destination.
pub fn sanitize_entry_path(declared: &str) -> Result<PathBuf, SecurityViolation> {
    let normalized = declared.replace('\\', "/");

    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(SecurityViolation::AbsolutePath {
            entry: declared.to_string(),
        });
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SecurityViolation::PathTraversal {
                        entry: declared.to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SecurityViolation::AbsolutePath {
                    entry: declared.to_string(),
                });
            }
        }
    }

    Ok(parts.iter().collect())
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

// ============================================================================
// Extraction
// ============================================================================

/// Validates an archive and extracts it into `dest_dir`.
///
/// Nothing is written unless the whole archive passes [`scan_archive`]. Write
/// phase failures leave partial output behind; the caller owns cleanup.
///
/// # Errors
///
/// Returns `PackageError::Security` for validation failures,
/// `PackageError::Cancelled` if `cancel` fires between entries and an I/O
/// error for write failures.
pub fn extract_archive(
    archive_path: &Path,
    dest_dir: &Path,
    limits: &SecurityLimits,
    cancel: &CancellationToken,
) -> Result<ExtractSummary, PackageError> {
    info!(
        "Extracting {} to {}",
        archive_path.display(),
        dest_dir.display()
    );

    let scan = scan_archive(archive_path, limits)?;

    if cancel.is_cancelled() {
        return Err(PackageError::Cancelled);
    }

    create_dir_fixed(dest_dir)?;

    let summary = match scan.format {
        ArchiveFormat::Zip => write_zip(archive_path, dest_dir, limits, cancel)?,
        ArchiveFormat::TarGz => write_tar_gz(archive_path, dest_dir, limits, cancel)?,
    };

    debug!(
        files = summary.files,
        directories = summary.directories,
        bytes = summary.bytes_written,
        "Extraction complete"
    );
    Ok(summary)
}

fn write_zip(
    archive_path: &Path,
    dest_dir: &Path,
    limits: &SecurityLimits,
    cancel: &CancellationToken,
) -> Result<ExtractSummary, PackageError> {
    let file = File::open(archive_path).map_err(|e| PackageError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(malformed)?;
    let mut summary = ExtractSummary::default();

    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(PackageError::Cancelled);
        }

        let entry = archive.by_index(i).map_err(malformed)?;
        let name = entry.name().to_string();
        let relative = sanitize_entry_path(&name)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest_path = dest_dir.join(&relative);

        if entry.is_dir() {
            create_dir_fixed(&dest_path)?;
            summary.directories += 1;
        } else {
            let declared = entry.size();
            summary.bytes_written += write_file_fixed(entry, &dest_path, &name, declared, limits)?;
            summary.files += 1;
        }
    }

    Ok(summary)
}

fn write_tar_gz(
    archive_path: &Path,
    dest_dir: &Path,
    limits: &SecurityLimits,
    cancel: &CancellationToken,
) -> Result<ExtractSummary, PackageError> {
    let mut archive = open_tar_gz(archive_path)?;
    let mut summary = ExtractSummary::default();

    for entry_result in archive.entries().map_err(malformed)? {
        if cancel.is_cancelled() {
            return Err(PackageError::Cancelled);
        }

        let entry = entry_result.map_err(malformed)?;
        let entry_type = entry.header().entry_type();
        if entry_type == tar::EntryType::XGlobalHeader {
            continue;
        }

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let relative = sanitize_entry_path(&name)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest_path = dest_dir.join(&relative);

        if entry_type.is_dir() {
            create_dir_fixed(&dest_path)?;
            summary.directories += 1;
        } else if entry_type.is_file() {
            let declared = entry.size();
            summary.bytes_written += write_file_fixed(entry, &dest_path, &name, declared, limits)?;
            summary.files += 1;
        } else {
            // The archive changed between the scan and the write phase
            return Err(SecurityViolation::UnsupportedEntry {
                entry: name,
                entry_type: format!("{:?}", entry_type),
            }
            .into());
        }
    }

    Ok(summary)
}

/// Creates a directory tree, forcing the fixed directory mode.
fn create_dir_fixed(path: &Path) -> Result<(), PackageError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder.create(path).map_err(|e| PackageError::io(path, e))?;
    set_mode(path, DIR_MODE)
}

/// Writes one file with the fixed file mode, refusing more data than declared.
fn write_file_fixed<R: Read>(
    reader: R,
    dest_path: &Path,
    entry_name: &str,
    declared_size: u64,
    limits: &SecurityLimits,
) -> Result<u64, PackageError> {
    if let Some(parent) = dest_path.parent() {
        create_dir_fixed(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }

    let mut outfile = options
        .open(dest_path)
        .map_err(|e| PackageError::io(dest_path, e))?;

    let cap = declared_size.min(limits.max_single_entry_bytes);
    let written = io::copy(&mut reader.take(cap.saturating_add(1)), &mut outfile)
        .map_err(|e| PackageError::io(dest_path, e))?;
    if written > cap {
        return Err(SecurityViolation::SizeMismatch {
            entry: entry_name.to_string(),
        }
        .into());
    }

    outfile.flush().map_err(|e| PackageError::io(dest_path, e))?;
    set_mode(dest_path, FILE_MODE)?;
    Ok(written)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), PackageError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| PackageError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), PackageError> {
    Ok(())
}

// ============================================================================
// Packing
// ============================================================================

fn is_hidden_name(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn to_forward_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Packs a directory into a zip archive.
///
/// Hidden files and directories (names starting with `.`) are skipped, as are
/// symlinks. Entry names use forward slashes on every platform.
///
/// Returns the number of files written.
pub fn create_archive(source_dir: &Path, archive_path: &Path) -> Result<usize, PackageError> {
    info!(
        "Packing {} into {}",
        source_dir.display(),
        archive_path.display()
    );

    if !source_dir.is_dir() {
        return Err(PackageError::io(
            source_dir,
            io::Error::new(io::ErrorKind::NotFound, "source is not a directory"),
        ));
    }

    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).map_err(|e| PackageError::io(parent, e))?;
    }

    let file = File::create(archive_path).map_err(|e| PackageError::io(archive_path, e))?;
    let mut zip = zip::ZipWriter::new(file);
    let file_options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(FILE_MODE);
    let dir_options = zip::write::SimpleFileOptions::default().unix_permissions(DIR_MODE);

    let walker = WalkDir::new(source_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden_name(e.file_name()));

    let mut files = 0;
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source_dir).to_path_buf();
            PackageError::io(path, io::Error::other(e.to_string()))
        })?;
        if entry.depth() == 0 || entry.path() == archive_path {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .unwrap_or(entry.path());
        let name = to_forward_slash_path(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            warn!("Skipping symlink while packing: {}", entry.path().display());
        } else if file_type.is_dir() {
            zip.add_directory(format!("{}/", name), dir_options)
                .map_err(|e| PackageError::io(archive_path, io::Error::other(e)))?;
        } else {
            zip.start_file(name, file_options)
                .map_err(|e| PackageError::io(archive_path, io::Error::other(e)))?;
            let mut source =
                File::open(entry.path()).map_err(|e| PackageError::io(entry.path(), e))?;
            io::copy(&mut source, &mut zip).map_err(|e| PackageError::io(archive_path, e))?;
            files += 1;
        }
    }

    zip.finish()
        .map_err(|e| PackageError::io(archive_path, io::Error::other(e)))?;

    debug!(files, "Archive created");
    Ok(files)
}

// ============================================================================
// Hashing
// ============================================================================

/// Computes the lowercase hex SHA-256 of a file, streaming its contents.
pub fn hash_file(path: &Path) -> Result<String, PackageError> {
    let file = File::open(path).map_err(|e| PackageError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).map_err(|e| PackageError::io(path, e))?;
    Ok(format_sha256_hex(&hasher.finalize()))
}

/// Recomputes a file's hash and compares it case-insensitively.
pub fn verify_file(path: &Path, expected: &str) -> Result<(), PackageError> {
    let actual = hash_file(path)?;
    if actual != expected.trim().to_lowercase() {
        return Err(PackageError::IntegrityMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    debug!("SHA256 verified: {}", actual);
    Ok(())
}

/// Formats a SHA256 hash as lowercase hex without using the hex crate.
pub(crate) fn format_sha256_hex(hash: &[u8]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// Extractor Capability
// ============================================================================

/// Extraction and hashing as consumed by the installer.
#[cfg_attr(test, automock)]
pub trait ArchiveExtractor: Send + Sync {
    /// Validates and extracts `archive` into `destination`.
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary, PackageError>;

    /// Computes the archive's content hash.
    fn hash(&self, path: &Path) -> Result<String, PackageError>;
}

/// Extractor confined to a base root directory.
#[derive(Debug, Clone)]
pub struct SecureExtractor {
    base_root: PathBuf,
    limits: SecurityLimits,
}

impl SecureExtractor {
    /// Creates an extractor that refuses destinations outside `base_root`.
    pub fn new(base_root: impl Into<PathBuf>, limits: SecurityLimits) -> Self {
        Self {
            base_root: base_root.into(),
            limits,
        }
    }

    /// Returns the configured limits.
    pub fn limits(&self) -> &SecurityLimits {
        &self.limits
    }

    /// Checks that `destination` resolves inside the base root.
    pub fn ensure_within_root(&self, destination: &Path) -> Result<(), PackageError> {
        let outside = || {
            PackageError::Security(SecurityViolation::DestinationOutsideRoot {
                dest: destination.to_path_buf(),
                root: self.base_root.clone(),
            })
        };

        if destination
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(outside());
        }

        let root = self
            .base_root
            .canonicalize()
            .map_err(|e| PackageError::io(&self.base_root, e))?;

        // Canonicalize the deepest existing ancestor, then re-append the rest
        let mut existing = destination.to_path_buf();
        let mut remainder = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    remainder.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => return Err(outside()),
            }
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|e| PackageError::io(&existing, e))?;
        for part in remainder.into_iter().rev() {
            resolved.push(part);
        }

        if resolved.starts_with(&root) && resolved != root {
            Ok(())
        } else {
            Err(outside())
        }
    }
}

impl ArchiveExtractor for SecureExtractor {
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary, PackageError> {
        self.ensure_within_root(destination)?;
        extract_archive(archive, destination, &self.limits, cancel)
    }

    fn hash(&self, path: &Path) -> Result<String, PackageError> {
        hash_file(path)
    }
}
