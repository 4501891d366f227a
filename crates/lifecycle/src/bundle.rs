/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Archive bundle construction and verification
//!
//! Bundles are plain tar streams wrapped in gzip so any standard tar
//! utility can read them back. The builder records the entry count and
//! a SHA-256 digest at build time; [`ArchiveBuilder::verify`] re-reads
//! the bundle and fails when the entry count no longer matches, which
//! catches truncated writes and disk-full conditions before any
//! original file is deleted.

use crate::{
    error::{LifecycleError, Result},
    scanner::StorageItem,
};
use chrono::Utc;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Supported bundle compression formats.
///
/// Only gzip is implemented; requesting anything else fails fast with
/// `UnsupportedFormat` instead of silently falling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    Gzip,
    Zstd,
    Lz4,
}

impl CompressionFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionFormat::Gzip => ".gz",
            CompressionFormat::Zstd => ".zst",
            CompressionFormat::Lz4 => ".lz4",
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionFormat::Gzip => f.write_str("gzip"),
            CompressionFormat::Zstd => f.write_str("zstd"),
            CompressionFormat::Lz4 => f.write_str("lz4"),
        }
    }
}

/// Outcome of a bundle build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveResult {
    pub path: PathBuf,
    pub original_size: u64,
    pub compressed_size: u64,
    /// Percentage size reduction, clamped to 0..=100.
    pub compression_ratio: f64,
    pub file_count: usize,
    /// SHA-256 of the bundle file.
    pub checksum: String,
}

/// Builds and verifies tar+gzip bundles
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    level: u32,
}

impl ArchiveBuilder {
    /// Create a builder for the given format and compression level.
    ///
    /// Fails with `UnsupportedFormat` for anything but gzip.
    pub fn new(format: CompressionFormat, level: u32) -> Result<Self> {
        if format != CompressionFormat::Gzip {
            return Err(LifecycleError::UnsupportedFormat(format.to_string()));
        }
        Ok(Self {
            level: level.min(9),
        })
    }

    /// Write a bundle containing exactly `files`, rooted at `source_root`.
    ///
    /// Entry names are the file paths relative to `source_root`, so the
    /// bundle extracts back into the same layout.
    pub fn build(
        &self,
        source_root: &Path,
        files: &[StorageItem],
        destination_dir: &Path,
        bundle_name: &str,
    ) -> Result<ArchiveResult> {
        std::fs::create_dir_all(destination_dir)?;

        let original_size: u64 = files
            .iter()
            .map(|item| std::fs::metadata(&item.path).map(|m| m.len()))
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .sum();

        let file_name = format!(
            "{}_{}.tar.gz",
            bundle_name,
            Utc::now().format("%Y%m%d_%H%M%S%3f")
        );
        let bundle_path = destination_dir.join(file_name);
        debug!(path = %bundle_path.display(), files = files.len(), "writing bundle");

        let output = File::create(&bundle_path)?;
        let encoder = GzEncoder::new(output, Compression::new(self.level));
        let mut builder = tar::Builder::new(encoder);
        for item in files {
            let entry_name = match item.path.strip_prefix(source_root) {
                Ok(relative) => relative.to_path_buf(),
                // Files outside the root keep their file name only.
                Err(_) => PathBuf::from(
                    item.path
                        .file_name()
                        .ok_or_else(|| LifecycleError::SourceNotFound(item.path.clone()))?,
                ),
            };
            builder.append_path_with_name(&item.path, entry_name)?;
        }
        let encoder = builder.into_inner()?;
        encoder.finish()?;

        let compressed_size = std::fs::metadata(&bundle_path)?.len();
        let compression_ratio = if original_size == 0 {
            0.0
        } else {
            ((1.0 - compressed_size as f64 / original_size as f64) * 100.0).clamp(0.0, 100.0)
        };
        let checksum = file_checksum(&bundle_path)?;

        info!(
            path = %bundle_path.display(),
            files = files.len(),
            original = original_size,
            compressed = compressed_size,
            "bundle written"
        );

        Ok(ArchiveResult {
            path: bundle_path,
            original_size,
            compressed_size,
            compression_ratio,
            file_count: files.len(),
            checksum,
        })
    }

    /// Re-read a bundle and compare its entry count with the count
    /// recorded at build time. Any read failure or count mismatch is an
    /// `Integrity` error.
    pub fn verify(&self, result: &ArchiveResult) -> Result<()> {
        let file = File::open(&result.path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        let mut archive = tar::Archive::new(decoder);

        let mut actual = 0usize;
        let entries = archive.entries().map_err(|_| LifecycleError::Integrity {
            expected: result.file_count,
            actual,
        })?;
        for entry in entries {
            if entry.is_err() {
                return Err(LifecycleError::Integrity {
                    expected: result.file_count,
                    actual,
                });
            }
            actual += 1;
        }

        if actual != result.file_count {
            return Err(LifecycleError::Integrity {
                expected: result.file_count,
                actual,
            });
        }
        debug!(path = %result.path.display(), entries = actual, "bundle verified");
        Ok(())
    }
}

/// SHA-256 digest of a file, hex-encoded
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::FileScanner;
    use tempfile::TempDir;

    fn fixture(files: &[(&str, &[u8])]) -> (TempDir, Vec<StorageItem>) {
        let dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let items = FileScanner::new().scan(dir.path(), "results").unwrap();
        (dir, items)
    }

    #[test]
    fn non_gzip_formats_are_rejected() {
        let err = ArchiveBuilder::new(CompressionFormat::Zstd, 6).unwrap_err();
        assert!(matches!(err, LifecycleError::UnsupportedFormat(_)));
        let err = ArchiveBuilder::new(CompressionFormat::Lz4, 6).unwrap_err();
        assert!(matches!(err, LifecycleError::UnsupportedFormat(_)));
    }

    #[test]
    fn build_then_verify_roundtrip() {
        let (dir, items) = fixture(&[
            ("a.json", &[b'a'; 100][..]),
            ("b.json", &[b'b'; 100][..]),
            ("nested/c.json", &[b'c'; 100][..]),
        ]);
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(CompressionFormat::Gzip, 6).unwrap();

        let result = builder
            .build(dir.path(), &items, dest.path(), "job")
            .unwrap();
        assert_eq!(result.file_count, 3);
        assert_eq!(result.original_size, 300);
        assert!(result.compressed_size > 0);
        assert_eq!(result.checksum.len(), 64);

        builder.verify(&result).unwrap();
    }

    #[test]
    fn bundle_is_readable_by_standard_tar() {
        let (dir, items) = fixture(&[("x.log", b"hello"), ("sub/y.log", b"world")]);
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(CompressionFormat::Gzip, 6).unwrap();
        let result = builder
            .build(dir.path(), &items, dest.path(), "job")
            .unwrap();

        let decoder = GzDecoder::new(File::open(&result.path).unwrap());
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"x.log".to_string()));
        assert!(names.contains(&"sub/y.log".to_string()));
    }

    #[test]
    fn corrupting_the_bundle_fails_verification() {
        let (dir, items) = fixture(&[
            ("a.json", &[b'a'; 100][..]),
            ("b.json", &[b'b'; 100][..]),
            ("c.json", &[b'c'; 100][..]),
        ]);
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(CompressionFormat::Gzip, 6).unwrap();
        let result = builder
            .build(dir.path(), &items, dest.path(), "job")
            .unwrap();

        // Delete one byte from the middle of the bundle.
        let mut bytes = std::fs::read(&result.path).unwrap();
        bytes.remove(bytes.len() / 2);
        std::fs::write(&result.path, &bytes).unwrap();

        let err = builder.verify(&result).unwrap_err();
        assert!(matches!(err, LifecycleError::Integrity { .. }));
    }

    #[test]
    fn truncating_the_bundle_fails_verification() {
        let (dir, items) = fixture(&[("a.json", &[b'a'; 2000][..])]);
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(CompressionFormat::Gzip, 6).unwrap();
        let result = builder
            .build(dir.path(), &items, dest.path(), "job")
            .unwrap();

        let bytes = std::fs::read(&result.path).unwrap();
        std::fs::write(&result.path, &bytes[..bytes.len() / 2]).unwrap();

        let err = builder.verify(&result).unwrap_err();
        assert!(matches!(err, LifecycleError::Integrity { .. }));
    }

    #[test]
    fn empty_file_list_yields_zero_ratio() {
        let dir = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(CompressionFormat::Gzip, 6).unwrap();

        let result = builder.build(dir.path(), &[], dest.path(), "job").unwrap();
        assert_eq!(result.original_size, 0);
        assert_eq!(result.compression_ratio, 0.0);
        assert_eq!(result.file_count, 0);
        builder.verify(&result).unwrap();
    }

    #[test]
    fn compression_ratio_stays_in_bounds() {
        // A single tiny file compresses badly; the ratio must clamp at
        // zero rather than go negative.
        let (dir, items) = fixture(&[("tiny.bin", &[0x42][..])]);
        let dest = TempDir::new().unwrap();
        let builder = ArchiveBuilder::new(CompressionFormat::Gzip, 6).unwrap();
        let result = builder
            .build(dir.path(), &items, dest.path(), "job")
            .unwrap();
        assert!((0.0..=100.0).contains(&result.compression_ratio));

        // Highly repetitive data compresses well and still stays in range.
        let (dir, items) = fixture(&[("big.bin", &[b'z'; 65536][..])]);
        let result = builder
            .build(dir.path(), &items, dest.path(), "job")
            .unwrap();
        assert!((0.0..=100.0).contains(&result.compression_ratio));
        assert!(result.compression_ratio > 50.0);
    }
}
